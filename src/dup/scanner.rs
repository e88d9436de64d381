//! Schema-driven duplicate tablet discovery scan task.

use std::sync::Arc;

use crate::dup::worker::LoopWorker;
use crate::dup::{wall_now_us, LsId, ReplicaAddr, TabletCatalog};
use crate::utils::DuplicaError;

use serde::Deserialize;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct ScannerConfig {
    /// Interval between scan passes, in millisecs.
    pub scan_interval_ms: u64,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        ScannerConfig {
            scan_interval_ms: 10_000,
        }
    }
}

/// Periodic classification of which hosted tablets are duplicate tables,
/// feeding the tablet-set manager of the tenant's duplicate-eligible LS.
///
/// GC's grace period is the largest tick gap observed so far rather than a
/// fixed constant, so transient scheduling jitter cannot cause a false
/// eviction.
pub struct DupTabletScanner {
    shutdown_tx: watch::Sender<bool>,

    /// Join handle of the scanner task.
    _scanner_handle: JoinHandle<()>,
}

impl DupTabletScanner {
    /// Creates a new scanner for one tenant. Spawns the scan task.
    pub fn new_and_setup(
        config: ScannerConfig,
        me: ReplicaAddr,
        catalog: Arc<dyn TabletCatalog>,
        worker: Arc<LoopWorker>,
    ) -> Result<Self, DuplicaError> {
        if config.scan_interval_ms == 0 {
            return logged_err!("invalid scan_interval_ms 0");
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let scanner_handle = tokio::spawn(Self::scanner_task(
            config,
            me,
            catalog,
            worker,
            shutdown_rx,
        ));

        Ok(DupTabletScanner {
            shutdown_tx,
            _scanner_handle: scanner_handle,
        })
    }

    /// Signals the scan task to exit after the current pass.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Scanner task function.
    async fn scanner_task(
        config: ScannerConfig,
        me: ReplicaAddr,
        catalog: Arc<dyn TabletCatalog>,
        worker: Arc<LoopWorker>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        pf_debug!("tablet_scanner task spawned");

        let scan_interval = Duration::from_millis(config.scan_interval_ms);
        let mut ticker = time::interval(scan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut last_tick: Option<Instant> = None;
        let mut observed_max_interval = scan_interval;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let now = Instant::now();
            if let Some(last) = last_tick {
                let gap = now.duration_since(last);
                if gap > observed_max_interval {
                    observed_max_interval = gap;
                }
            }
            last_tick = Some(now);

            if let Err(e) =
                Self::scan_once(me, &catalog, &worker, observed_max_interval)
                    .await
            {
                // a failed pass (e.g. schema fetch) defers to the next tick
                pf_warn!("tablet scan pass failed: {}", e);
            }
        }

        pf_debug!("tablet_scanner task exitted");
    }

    /// One full scan pass: classify every tablet hosted on the tenant's
    /// duplicate-eligible LS, then garbage-collect stale entries under the
    /// adaptive grace period.
    async fn scan_once(
        me: ReplicaAddr,
        catalog: &Arc<dyn TabletCatalog>,
        worker: &Arc<LoopWorker>,
        grace: Duration,
    ) -> Result<(), DuplicaError> {
        let ls = match catalog.dup_eligible_ls().await? {
            None => return Ok(()),
            Some(ls) => ls,
        };
        let handler = match worker.lookup(ls) {
            None => {
                pf_debug!("{} not registered, scan skipped", ls);
                return Ok(());
            }
            Some(handler) => handler,
        };

        let leader = catalog.ls_leader(ls).await?;
        if let Some(leader) = leader {
            handler.note_leader(leader).await;
        }
        if leader != Some(me) {
            // classification happens on the leader only; follower
            // membership comes from replay
            return Ok(());
        }

        let dup_set = catalog.dup_tablet_set().await?;
        let hosted = catalog.hosted_tablets(ls).await?;
        let now = wall_now_us();
        let mut saw_dup = false;
        for tablet in hosted {
            let is_dup = dup_set.contains(&tablet);
            saw_dup |= is_dup;
            if let Err(e) =
                handler.refresh_dup_table_tablet(tablet, is_dup, now).await
            {
                // per-tablet failures never abort the remaining pass
                pf_warn!("{} tablet {} refresh failed: {}", ls, tablet, e);
            }
        }
        if saw_dup {
            worker.append_ls(ls)?;
        }

        match handler.gc_dup_tablets(now, grace).await {
            Ok(evicted) if evicted > 0 => {
                pf_info!("{} gc evicted {} tablets", ls, evicted)
            }
            Ok(_) => {}
            Err(e) => pf_warn!("{} gc failed: {}", ls, e),
        }
        Ok(())
    }
}

impl Drop for DupTabletScanner {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dup::collab::test_stubs::{
        NullCheckpoint, NullGts, NullLogStream, NullTransport,
    };
    use crate::dup::worker::LoopWorkerConfig;
    use crate::dup::{
        DupTableConfig, DupTableLsHandler, RoleState, TabletId,
    };

    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    fn addr(port: u16) -> ReplicaAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    /// In-memory catalog with switchable classification and failure mode.
    struct MemCatalog {
        ls: LsId,
        leader: StdMutex<Option<ReplicaAddr>>,
        dups: StdMutex<HashSet<TabletId>>,
        hosted: StdMutex<Vec<TabletId>>,
        failing: AtomicBool,
    }

    impl MemCatalog {
        fn new(ls: LsId, leader: ReplicaAddr) -> Self {
            MemCatalog {
                ls,
                leader: StdMutex::new(Some(leader)),
                dups: StdMutex::new(HashSet::new()),
                hosted: StdMutex::new(Vec::new()),
                failing: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl TabletCatalog for MemCatalog {
        async fn dup_eligible_ls(&self) -> Result<Option<LsId>, DuplicaError> {
            Ok(Some(self.ls))
        }

        async fn ls_leader(
            &self,
            _ls: LsId,
        ) -> Result<Option<ReplicaAddr>, DuplicaError> {
            Ok(*self.leader.lock().unwrap())
        }

        async fn dup_tablet_set(
            &self,
        ) -> Result<HashSet<TabletId>, DuplicaError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(DuplicaError::msg("schema service down"));
            }
            Ok(self.dups.lock().unwrap().clone())
        }

        async fn hosted_tablets(
            &self,
            _ls: LsId,
        ) -> Result<Vec<TabletId>, DuplicaError> {
            Ok(self.hosted.lock().unwrap().clone())
        }
    }

    fn make_handler(
        worker: &LoopWorker,
        ls: LsId,
        me: ReplicaAddr,
    ) -> Arc<DupTableLsHandler> {
        Arc::new(
            DupTableLsHandler::new(
                ls,
                me,
                DupTableConfig::default(),
                Arc::new(NullLogStream::new()),
                Arc::new(NullGts),
                Arc::new(NullTransport),
                Arc::new(NullCheckpoint),
                worker.nudge_sender(),
            )
            .unwrap(),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn scan_classifies_and_activates() -> Result<(), DuplicaError> {
        let me = addr(7700);
        let worker = Arc::new(LoopWorker::new_and_setup(LoopWorkerConfig {
            loop_interval_ms: 25,
        })?);
        let handler = make_handler(&worker, LsId(1), me);
        handler.online(RoleState::Leader).await?;
        worker.register_handler(handler.clone());

        let catalog = Arc::new(MemCatalog::new(LsId(1), me));
        catalog.dups.lock().unwrap().insert(TabletId(101));
        *catalog.hosted.lock().unwrap() =
            vec![TabletId(101), TabletId(102)];

        let scanner = DupTabletScanner::new_and_setup(
            ScannerConfig {
                scan_interval_ms: 30,
            },
            me,
            catalog.clone(),
            worker.clone(),
        )?;

        time::sleep(Duration::from_millis(150)).await;
        // only the duplicate tablet got tracked, and the LS is now driven
        let diag = handler.tablet_diag().await;
        assert_eq!(diag.len(), 1);
        assert_eq!(diag[0].tablet, TabletId(101));
        assert!(worker.is_active(LsId(1)));

        // a whole-tick schema failure defers work without side effects
        catalog.failing.store(true, Ordering::SeqCst);
        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handler.tablet_diag().await.len(), 1);
        catalog.failing.store(false, Ordering::SeqCst);

        // tablet no longer duplicate: marked removing, then evicted once
        // absent past the adaptive grace window; the LS deregisters
        catalog.dups.lock().unwrap().clear();
        time::sleep(Duration::from_millis(400)).await;
        assert!(handler.tablet_diag().await.is_empty());
        assert!(!worker.is_active(LsId(1)));

        scanner.shutdown();
        worker.shutdown();
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn follower_replica_does_not_classify() -> Result<(), DuplicaError> {
        let me = addr(7700);
        let worker = Arc::new(LoopWorker::new_and_setup(LoopWorkerConfig {
            loop_interval_ms: 10_000,
        })?);
        let handler = make_handler(&worker, LsId(1), me);
        handler.online(RoleState::Follower).await?;
        worker.register_handler(handler.clone());

        // another replica leads the LS
        let catalog = Arc::new(MemCatalog::new(LsId(1), addr(7999)));
        catalog.dups.lock().unwrap().insert(TabletId(101));
        *catalog.hosted.lock().unwrap() = vec![TabletId(101)];

        let scanner = DupTabletScanner::new_and_setup(
            ScannerConfig {
                scan_interval_ms: 20,
            },
            me,
            catalog.clone(),
            worker.clone(),
        )?;

        time::sleep(Duration::from_millis(120)).await;
        assert!(handler.tablet_diag().await.is_empty());
        assert!(!worker.is_active(LsId(1)));

        scanner.shutdown();
        Ok(())
    }
}
