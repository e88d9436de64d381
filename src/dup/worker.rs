//! Per-tenant background loop worker driving the periodic protocol step of
//! every LS currently hosting duplicate tablets.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};

use crate::dup::handler::DupTableLsHandler;
use crate::dup::LsId;
use crate::utils::DuplicaError;

use serde::Deserialize;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, MissedTickBehavior};

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct LoopWorkerConfig {
    /// Interval of the per-LS periodic protocol sweep, in millisecs.
    pub loop_interval_ms: u64,
}

impl Default for LoopWorkerConfig {
    fn default() -> Self {
        LoopWorkerConfig {
            loop_interval_ms: 100,
        }
    }
}

/// Registry shared between the worker task and the registration API. The
/// mutex makes activation an atomic insert-or-exists, which the idempotent
/// registration contract relies on.
struct WorkerState {
    /// Every handler known to this tenant, driven or not.
    handlers: HashMap<LsId, Arc<DupTableLsHandler>>,

    /// The subset currently being driven each sweep.
    active: HashSet<LsId>,
}

/// The per-tenant loop worker. One background task sequentially drives
/// `ls_loop_handle()` for every active LS each tick; cross-LS there is no
/// shared lock beyond the brief registry snapshot.
pub struct LoopWorker {
    state: Arc<StdMutex<WorkerState>>,

    /// Cloned out to handlers so replay can activate an LS directly.
    nudge_tx: mpsc::UnboundedSender<LsId>,

    shutdown_tx: watch::Sender<bool>,

    /// Join handle of the worker task.
    _worker_handle: JoinHandle<()>,
}

impl LoopWorker {
    /// Creates a new loop worker. Spawns the sweep task.
    pub fn new_and_setup(
        config: LoopWorkerConfig,
    ) -> Result<Self, DuplicaError> {
        if config.loop_interval_ms == 0 {
            return logged_err!("invalid loop_interval_ms 0");
        }

        let state = Arc::new(StdMutex::new(WorkerState {
            handlers: HashMap::new(),
            active: HashSet::new(),
        }));
        let (nudge_tx, nudge_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let worker_handle = tokio::spawn(Self::worker_task(
            state.clone(),
            Duration::from_millis(config.loop_interval_ms),
            nudge_rx,
            shutdown_rx,
        ));

        Ok(LoopWorker {
            state,
            nudge_tx,
            shutdown_tx,
            _worker_handle: worker_handle,
        })
    }

    /// Makes a handler known to this worker. Registration alone does not
    /// start driving it; see `append_ls`.
    pub fn register_handler(&self, handler: Arc<DupTableLsHandler>) {
        let ls = handler.ls();
        self.state.lock().unwrap().handlers.insert(ls, handler);
    }

    /// Looks up a known handler by LS id.
    pub fn lookup(&self, ls: LsId) -> Option<Arc<DupTableLsHandler>> {
        self.state.lock().unwrap().handlers.get(&ls).cloned()
    }

    /// Activates periodic driving for an LS. Duplicate activation is
    /// idempotent and returns success.
    pub fn append_ls(&self, ls: LsId) -> Result<(), DuplicaError> {
        let mut state = self.state.lock().unwrap();
        if !state.handlers.contains_key(&ls) {
            return Err(DuplicaError::LsGone);
        }
        if state.active.insert(ls) {
            pf_info!("{} appended to loop worker", ls);
        } else {
            pf_debug!("{} already appended to loop worker", ls);
        }
        Ok(())
    }

    /// Stops driving an LS (the handler stays known). Returns true if it
    /// was active.
    pub fn remove_ls(&self, ls: LsId) -> bool {
        self.state.lock().unwrap().active.remove(&ls)
    }

    pub fn is_active(&self, ls: LsId) -> bool {
        self.state.lock().unwrap().active.contains(&ls)
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().unwrap().active.len()
    }

    /// Sender half cloned into handlers for replay-driven activation.
    pub fn nudge_sender(&self) -> mpsc::UnboundedSender<LsId> {
        self.nudge_tx.clone()
    }

    /// Signals the worker task to exit after the current sweep.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Loop worker task function.
    async fn worker_task(
        state: Arc<StdMutex<WorkerState>>,
        loop_interval: Duration,
        mut nudge_rx: mpsc::UnboundedReceiver<LsId>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        pf_debug!("loop_worker task spawned");

        let mut ticker = time::interval(loop_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut nudges_open = true;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    Self::sweep(&state).await;
                }

                nudge = nudge_rx.recv(), if nudges_open => {
                    match nudge {
                        Some(ls) => {
                            let mut state = state.lock().unwrap();
                            if state.handlers.contains_key(&ls)
                                && state.active.insert(ls)
                            {
                                pf_info!("{} activated by replay nudge", ls);
                            }
                        }
                        None => nudges_open = false,
                    }
                }

                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        pf_debug!("loop_worker task exitted");
    }

    /// One sequential sweep over all active handlers. Per-LS errors are
    /// non-fatal to the worker; terminal signals deregister that LS after
    /// the sweep.
    async fn sweep(state: &Arc<StdMutex<WorkerState>>) {
        let sweep: Vec<(LsId, Arc<DupTableLsHandler>)> = {
            let state = state.lock().unwrap();
            state
                .active
                .iter()
                .filter_map(|ls| {
                    state.handlers.get(ls).map(|h| (*ls, h.clone()))
                })
                .collect()
        };

        let mut dropped = Vec::new();
        for (ls, handler) in sweep {
            match handler.ls_loop_handle().await {
                Ok(()) => {}
                Err(
                    DuplicaError::NoDupTablets
                    | DuplicaError::NotInitialized
                    | DuplicaError::LsGone,
                ) => dropped.push(ls),
                Err(e) => {
                    pf_warn!("{} loop step error: {}", ls, e);
                }
            }
        }

        if !dropped.is_empty() {
            let mut state = state.lock().unwrap();
            for ls in dropped {
                if state.active.remove(&ls) {
                    pf_info!("{} deregistered from loop worker", ls);
                }
            }
        }
    }
}

impl Drop for LoopWorker {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}
