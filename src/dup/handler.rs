//! Per-LS duplicate-table handler: role state machine, periodic protocol
//! step, replay intake, and the read-path/commit-path gates.

use std::sync::Arc;

use crate::dup::logop::{self, DupTableLogBody};
use crate::dup::messages::{DupTableMsg, TxId};
use crate::dup::{
    wall_now_us, CheckpointMeta, CheckpointStore, DupTableConfig,
    GlobalTsSource, LeaseManager, LogEntryMerger, LogStreamClient, LsId, Lsn,
    MsgTransport, ReplicaAddr, RoleCtx, RoleState, Scn, TabletId,
    TabletSetMgr, TabletState, TsInfo, TsSyncManager,
};
use crate::utils::{DuplicaError, RetryBackoff};

use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::time::Duration;

/// Result of one commit-path redo-sync check.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct RedoSyncResult {
    /// True iff every currently leased follower has replayed through the
    /// transaction's redo point.
    pub finished: bool,

    /// Max of the replayed followers' reported read versions; the lower
    /// bound the transaction's commit version must exceed.
    pub total_max_read_version: Scn,
}

/// One leader-side lease grant row for operational tooling.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct LeaseDiag {
    pub addr: ReplicaAddr,
    pub grant_ts_us: u64,
    pub expire_ts_us: u64,
}

/// One tablet membership row for operational tooling.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct TabletDiag {
    pub tablet: TabletId,
    pub state: TabletState,
    pub last_refresh_us: u64,
}

/// Mutable protocol bookkeeping, all owned by composition and guarded by
/// one lock.
struct HandlerState {
    lease_mgr: LeaseManager,
    tsync_mgr: TsSyncManager,
    tablet_mgr: TabletSetMgr,
    merger: LogEntryMerger,

    /// My own progress triple, fed by the replay/transaction layers and
    /// piggybacked on follower-side lease requests.
    self_ts_info: TsInfo,

    /// Leader address as last learned from catalog or incoming messages.
    leader_addr: Option<ReplicaAddr>,

    /// Last restored checkpoint summary, consulted on takeover.
    ckpt_meta: Option<CheckpointMeta>,
}

/// The per-LS duplicate-table handler.
///
/// Lock order is `role` > `logging` > `state`; no method acquires an
/// earlier lock while holding a later one, and no lock is held across a
/// collaborator await except `logging` around its own submission (that is
/// the point: revoke and submission must serialize on it).
pub struct DupTableLsHandler {
    ls: LsId,
    me: ReplicaAddr,
    config: DupTableConfig,

    /// Role state machine; transitions are linearized under this lock.
    role: Mutex<RoleCtx>,

    /// Lsn of the snapshot submission currently in flight, if any.
    logging: RwLock<Option<Lsn>>,

    state: Mutex<HandlerState>,

    /// Flipped to true while offline/revoke is tearing the role down, so
    /// in-flight confirm/submission work aborts early.
    cancel_tx: watch::Sender<bool>,

    log_client: Arc<dyn LogStreamClient>,
    gts_source: Arc<dyn GlobalTsSource>,
    transport: Arc<dyn MsgTransport>,
    checkpoint: Arc<dyn CheckpointStore>,

    /// Nudges the loop worker to activate this LS when replay discovers
    /// duplicate tablets.
    worker_nudge: mpsc::UnboundedSender<LsId>,
}

impl DupTableLsHandler {
    /// Creates a handler for one LS with its collaborators injected.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ls: LsId,
        me: ReplicaAddr,
        config: DupTableConfig,
        log_client: Arc<dyn LogStreamClient>,
        gts_source: Arc<dyn GlobalTsSource>,
        transport: Arc<dyn MsgTransport>,
        checkpoint: Arc<dyn CheckpointStore>,
        worker_nudge: mpsc::UnboundedSender<LsId>,
    ) -> Result<Self, DuplicaError> {
        if config.gts_timeout_ms == 0 || config.gts_retry_base_ms == 0 {
            return logged_err!(
                "invalid gts timing config {:?} for {}",
                config,
                ls
            );
        }
        let lease_mgr = LeaseManager::new(
            ls,
            Duration::from_millis(config.lease_interval_ms),
        )?;

        let (cancel_tx, _) = watch::channel(false);
        Ok(DupTableLsHandler {
            ls,
            me,
            config,
            role: Mutex::new(RoleCtx::new()),
            logging: RwLock::new(None),
            state: Mutex::new(HandlerState {
                lease_mgr,
                tsync_mgr: TsSyncManager::new(ls),
                tablet_mgr: TabletSetMgr::new(ls),
                merger: LogEntryMerger::new(),
                self_ts_info: TsInfo::default(),
                leader_addr: None,
                ckpt_meta: None,
            }),
            cancel_tx,
            log_client,
            gts_source,
            transport,
            checkpoint,
            worker_nudge,
        })
    }

    pub fn ls(&self) -> LsId {
        self.ls
    }

    pub async fn current_role(&self) -> RoleState {
        self.role.lock().await.current()
    }

    /// Records the leader address learned out-of-band (e.g., by the scan
    /// task from the catalog).
    pub async fn note_leader(&self, addr: ReplicaAddr) {
        self.state.lock().await.leader_addr = Some(addr);
    }

    // ---------- role transitions ----------

    /// Brings the handler online from `Uninit` into the given role.
    pub async fn online(&self, target: RoleState) -> Result<(), DuplicaError> {
        let mut role = self.role.lock().await;
        let transition = match role.prepare(target)? {
            None => return Ok(()),
            Some(tr) => tr,
        };

        let applied = if target == RoleState::Leader {
            self.leader_takeover_(false).await
        } else {
            Ok(())
        };
        match applied {
            Ok(()) => {
                self.cancel_tx.send_replace(false);
                let (old, new) = role.commit(transition);
                pf_info!("{} online: {:?} -> {:?}", self.ls, old, new);
                Ok(())
            }
            Err(e) => {
                role.restore(transition);
                Err(e)
            }
        }
    }

    /// Takes the handler offline back to `Uninit`, revoking forcibly.
    pub async fn offline(&self) -> Result<(), DuplicaError> {
        // cancellation point for any in-flight confirm/submission work
        self.cancel_tx.send_replace(true);

        let mut role = self.role.lock().await;
        let transition = match role.prepare(RoleState::Uninit)? {
            None => return Ok(()),
            Some(tr) => tr,
        };

        if let Err(e) = self.leader_revoke_(true).await {
            // forced revoke logs sub-component errors instead of failing
            pf_warn!("{} revoke error during offline: {}", self.ls, e);
        }
        {
            let mut state = self.state.lock().await;
            state.lease_mgr.follower_reset();
            state.self_ts_info = TsInfo::default();
        }

        let (old, new) = role.commit(transition);
        pf_info!("{} offline: {:?} -> {:?}", self.ls, old, new);
        Ok(())
    }

    /// Switches to the leader role, rebuilding leader-side state.
    pub async fn switch_to_leader(
        &self,
        is_resume: bool,
    ) -> Result<(), DuplicaError> {
        let mut role = self.role.lock().await;
        let transition = match role.prepare(RoleState::Leader)? {
            None => return Ok(()),
            Some(tr) => tr,
        };

        match self.leader_takeover_(is_resume).await {
            Ok(()) => {
                self.cancel_tx.send_replace(false);
                let (old, new) = role.commit(transition);
                pf_info!("{} takeover: {:?} -> {:?}", self.ls, old, new);
                Ok(())
            }
            Err(e) => {
                role.restore(transition);
                Err(e)
            }
        }
    }

    /// Switches to the follower role. A non-forced revoke aborts retryably
    /// if a snapshot submission is in flight; a failed rollback escalates
    /// to forced revoke so the handler never straddles two roles.
    pub async fn switch_to_follower(&self) -> Result<(), DuplicaError> {
        self.cancel_tx.send_replace(true);

        let mut role = self.role.lock().await;
        let transition = match role.prepare(RoleState::Follower)? {
            None => {
                self.cancel_tx.send_replace(false);
                return Ok(());
            }
            Some(tr) => tr,
        };

        match self.leader_revoke_(false).await {
            Ok(()) => {
                let (old, new) = role.commit(transition);
                self.cancel_tx.send_replace(false);
                pf_info!("{} revoke: {:?} -> {:?}", self.ls, old, new);
                Ok(())
            }
            Err(e) if e.retryable() => {
                role.restore(transition);
                self.cancel_tx.send_replace(false);
                Err(e)
            }
            Err(e) => {
                // cannot roll back cleanly; escalate to forced revoke
                pf_warn!(
                    "{} revoke failed ({}), escalating to forced",
                    self.ls,
                    e
                );
                if let Err(e) = self.leader_revoke_(true).await {
                    pf_warn!("{} forced revoke error: {}", self.ls, e);
                }
                let (old, new) = role.commit(transition);
                self.cancel_tx.send_replace(false);
                pf_info!("{} forced revoke: {:?} -> {:?}", self.ls, old, new);
                Ok(())
            }
        }
    }

    /// Leader takeover side effects: reset the ts-sync cache, extend lease
    /// validity, re-derive tablet membership per checkpoint attestation.
    async fn leader_takeover_(
        &self,
        is_resume: bool,
    ) -> Result<(), DuplicaError> {
        let mut state = self.state.lock().await;
        state.tsync_mgr.reset();
        state.lease_mgr.leader_takeover(wall_now_us());

        let all_readable = state
            .ckpt_meta
            .as_ref()
            .map(|m| m.all_readable)
            .unwrap_or(false);
        let takeover_scn = state.self_ts_info.max_replayed_scn;
        state
            .tablet_mgr
            .leader_takeover(is_resume, all_readable, takeover_scn);
        Ok(())
    }

    /// Leader revoke side effects. Holding `logging` for reading keeps any
    /// new submission out while the revoke runs.
    async fn leader_revoke_(
        &self,
        is_forced: bool,
    ) -> Result<(), DuplicaError> {
        let logging = self.logging.read().await;
        if let Some(lsn) = *logging {
            if !is_forced {
                return Err(DuplicaError::InFlightLogging);
            }
            pf_warn!(
                "{} forced revoke with submission in flight at {:?}",
                self.ls,
                lsn
            );
        }

        let mut state = self.state.lock().await;
        state.lease_mgr.leader_revoke();
        state.tablet_mgr.leader_revoke();
        state.tsync_mgr.reset();
        Ok(())
    }

    // ---------- periodic protocol step ----------

    /// One periodic protocol step, invoked per tick by the loop worker.
    /// Returns `Err(NoDupTablets)` when the tablet set is empty so the
    /// caller deregisters this LS.
    pub async fn ls_loop_handle(&self) -> Result<(), DuplicaError> {
        let role = self.current_role().await;
        match role {
            RoleState::Uninit => return Err(DuplicaError::NotInitialized),
            RoleState::TransitionInProgress => {
                return Err(DuplicaError::Offline)
            }
            RoleState::Leader => self.leader_loop_().await,
            RoleState::Follower => self.follower_loop_().await,
        }
    }

    async fn leader_loop_(&self) -> Result<(), DuplicaError> {
        let mut logging = self.logging.write().await;

        let (payload, leased, leader_commit_scn) = {
            let mut state = self.state.lock().await;
            if !state.tablet_mgr.has_dup_tablets() {
                return Err(DuplicaError::NoDupTablets);
            }

            let now = wall_now_us();
            state.lease_mgr.update_granted_leases(now);
            let leased = state.lease_mgr.get_lease_valid_array(now);

            let payload = if logging.is_none() {
                let min_ts = state.tsync_mgr.get_min_lease_ts_info(&leased);
                let promoted = state
                    .tablet_mgr
                    .try_to_confirm(min_ts.max_replayed_scn);
                if promoted > 0 {
                    pf_debug!(
                        "{} confirmed {} tablets under floor {}",
                        self.ls,
                        promoted,
                        min_ts.max_replayed_scn
                    );
                }
                let body = DupTableLogBody {
                    lease_grants: state.lease_mgr.grants_snapshot(),
                    tablet_set: state.tablet_mgr.log_snapshot(),
                };
                Some(logop::serialize_entry(&body)?)
            } else {
                None
            };

            // the ts-sync cache is refreshed regardless of submission state
            state.tsync_mgr.retain_leased(&leased);
            (payload, leased, state.self_ts_info.max_commit_version)
        };

        if *self.cancel_tx.borrow() {
            // a concurrent offline/revoke won the race; abort early
            return Err(DuplicaError::Offline);
        }

        if let Some(payload) = payload {
            let (lsn, scn) =
                self.log_client.submit_entry(self.ls, payload).await?;
            pf_trace!("{} submitted snapshot at {:?} {}", self.ls, lsn, scn);
            *logging = Some(lsn);
        }
        drop(logging);

        for follower in leased {
            let msg = DupTableMsg::TsSyncRequest {
                ls: self.ls,
                leader_commit_scn,
            };
            if let Err(e) = self.transport.send_msg(follower, msg).await {
                pf_warn!("{} ts_sync send to {} failed: {}", self.ls, follower, e);
            }
        }
        Ok(())
    }

    async fn follower_loop_(&self) -> Result<(), DuplicaError> {
        let (leader, request) = {
            let state = self.state.lock().await;
            if !state.tablet_mgr.has_dup_tablets() {
                return Err(DuplicaError::NoDupTablets);
            }
            let request = DupTableMsg::LeaseRequest {
                ls: self.ls,
                src: self.me,
                request_ts_us: wall_now_us(),
                lease_interval_us: self.config.lease_interval_ms * 1_000,
                ts_info: state.self_ts_info,
            };
            (state.leader_addr, request)
        };

        match leader {
            Some(leader) => {
                if let Err(e) = self.transport.send_msg(leader, request).await
                {
                    pf_warn!(
                        "{} lease request to {} failed: {}",
                        self.ls,
                        leader,
                        e
                    );
                }
            }
            None => pf_debug!("{} leader unknown, lease refresh skipped", self.ls),
        }
        Ok(())
    }

    // ---------- log submission callbacks and replay ----------

    /// Durability callback for a previously submitted snapshot entry.
    pub async fn on_log_synced(&self, lsn: Lsn, scn: Scn) {
        let mut logging = self.logging.write().await;
        if *logging == Some(lsn) {
            *logging = None;
        }
        let mut state = self.state.lock().await;
        state.tablet_mgr.fold_changing_new();
        pf_trace!("{} snapshot synced at {:?} {}", self.ls, lsn, scn);
    }

    /// Abort callback for a previously submitted snapshot entry.
    pub async fn on_log_aborted(&self, lsn: Lsn) {
        let mut logging = self.logging.write().await;
        if *logging == Some(lsn) {
            *logging = None;
        }
        let mut state = self.state.lock().await;
        state.tablet_mgr.fold_changing_new();
        pf_warn!("{} snapshot submission aborted at {:?}", self.ls, lsn);
    }

    /// Replay intake from the log stream's apply context. Merges possibly
    /// fragmented records and applies complete entries deterministically.
    /// Returns true if this entry flipped the LS from no duplicate tablets
    /// to some (in which case the loop worker has been nudged).
    pub async fn replay(
        &self,
        record: &[u8],
        lsn: Lsn,
        scn: Scn,
    ) -> Result<bool, DuplicaError> {
        let mut state = self.state.lock().await;
        let had_tablets = state.tablet_mgr.has_dup_tablets();

        let body = match state.merger.feed(record, lsn, scn)? {
            None => return Ok(false),
            Some(body) => body,
        };

        let me = self.me;
        state.lease_mgr.apply_logged_grants(me, &body.lease_grants, scn);
        state
            .tablet_mgr
            .apply_logged_snapshot(&body.tablet_set, wall_now_us());
        state.self_ts_info.advance_to(&TsInfo {
            max_replayed_scn: scn,
            ..TsInfo::default()
        });

        let registered =
            !had_tablets && state.tablet_mgr.has_dup_tablets();
        if registered {
            pf_info!("{} discovered duplicate tablets via replay", self.ls);
            if let Err(e) = self.worker_nudge.send(self.ls) {
                pf_warn!("{} loop worker nudge failed: {}", self.ls, e);
            }
        }
        Ok(registered)
    }

    // ---------- message intake ----------

    /// Leader intake of a follower's lease request.
    pub async fn receive_lease_request(
        &self,
        msg: &DupTableMsg,
    ) -> Result<(), DuplicaError> {
        self.expect_role(RoleState::Leader).await?;
        let (src, request_ts_us, lease_interval_us, ts_info) = match msg {
            DupTableMsg::LeaseRequest {
                src,
                request_ts_us,
                lease_interval_us,
                ts_info,
                ..
            } => (*src, *request_ts_us, *lease_interval_us, *ts_info),
            _ => {
                return Err(DuplicaError::InvalidArgument(
                    "not a LeaseRequest".into(),
                ))
            }
        };

        let mut state = self.state.lock().await;
        state
            .lease_mgr
            .receive_lease_request(src, request_ts_us, lease_interval_us);
        state.tsync_mgr.update(src, &ts_info);
        Ok(())
    }

    /// Leader intake of a follower's explicit ts-sync report.
    pub async fn handle_ts_sync_response(
        &self,
        src: ReplicaAddr,
        ts_info: &TsInfo,
    ) -> Result<(), DuplicaError> {
        self.expect_role(RoleState::Leader).await?;
        self.state.lock().await.tsync_mgr.update(src, ts_info);
        Ok(())
    }

    /// Follower intake of the leader's ts-sync request; replies with my
    /// own progress triple.
    pub async fn handle_ts_sync_request(
        &self,
        from: ReplicaAddr,
        leader_commit_scn: Scn,
    ) -> Result<(), DuplicaError> {
        self.expect_role(RoleState::Follower).await?;
        let response = {
            let mut state = self.state.lock().await;
            state.leader_addr = Some(from);
            // reads here must not see below the leader's commit floor
            state.self_ts_info.advance_to(&TsInfo {
                max_read_version: leader_commit_scn,
                ..TsInfo::default()
            });
            DupTableMsg::TsSyncResponse {
                ls: self.ls,
                src: self.me,
                ts_info: state.self_ts_info,
            }
        };
        self.transport.send_msg(from, response).await
    }

    /// Follower intake of a before-prepare nudge for a lagging replica.
    pub async fn handle_before_prepare(
        &self,
        from: ReplicaAddr,
        before_prepare_scn: Scn,
        tx_id: TxId,
    ) -> Result<(), DuplicaError> {
        self.expect_role(RoleState::Follower).await?;
        let mut state = self.state.lock().await;
        state.leader_addr = Some(from);
        state.self_ts_info.advance_to(&TsInfo {
            max_read_version: before_prepare_scn,
            ..TsInfo::default()
        });
        pf_debug!(
            "{} before-prepare {} raised read floor to {}",
            self.ls,
            tx_id,
            before_prepare_scn
        );
        Ok(())
    }

    // ---------- scan/write intake ----------

    /// Leader intake of one scan-pass observation.
    pub async fn refresh_dup_table_tablet(
        &self,
        tablet: TabletId,
        is_dup: bool,
        now_us: u64,
    ) -> Result<(), DuplicaError> {
        self.expect_role(RoleState::Leader).await?;
        let is_logging = self.logging.read().await.is_some();
        self.state
            .lock()
            .await
            .tablet_mgr
            .refresh(tablet, is_dup, now_us, is_logging);
        Ok(())
    }

    /// Evicts tablets unseen for at least the adaptive grace interval.
    pub async fn gc_dup_tablets(
        &self,
        now_us: u64,
        grace: Duration,
    ) -> Result<usize, DuplicaError> {
        self.expect_role(RoleState::Leader).await?;
        Ok(self.state.lock().await.tablet_mgr.gc(now_us, grace))
    }

    /// Records a write scn against a tablet awaiting confirmation.
    pub async fn note_tablet_write(&self, tablet: TabletId, scn: Scn) {
        self.state.lock().await.tablet_mgr.note_write(tablet, scn);
    }

    /// Merges the replay/transaction layer's view of my own progress.
    pub async fn report_self_ts_info(&self, ts_info: &TsInfo) {
        self.state.lock().await.self_ts_info.advance_to(ts_info);
    }

    // ---------- read-path and commit-path gates ----------

    /// Follower-side serving check: replayed lease unexpired and replay
    /// progressed past the entry that granted it.
    pub async fn check_follower_lease_serving(
        &self,
        read_from_leader: bool,
        max_replayed_scn: Scn,
    ) -> Result<bool, DuplicaError> {
        match self.current_role().await {
            RoleState::Uninit => return Err(DuplicaError::NotInitialized),
            RoleState::TransitionInProgress => {
                return Err(DuplicaError::Offline)
            }
            _ => {}
        }
        let state = self.state.lock().await;
        Ok(state.lease_mgr.follower_lease_serving(
            wall_now_us(),
            read_from_leader,
            max_replayed_scn,
        ))
    }

    /// Read-path gate: true iff the tablet is READABLE, the lease is
    /// serving, and replay has reached the read snapshot. A false return
    /// means the caller reroutes the read to the leader.
    pub async fn check_dup_tablet_readable(
        &self,
        tablet: TabletId,
        read_snapshot: Scn,
        read_from_leader: bool,
        max_replayed_scn: Scn,
    ) -> Result<bool, DuplicaError> {
        match self.current_role().await {
            RoleState::Uninit => return Err(DuplicaError::NotInitialized),
            RoleState::TransitionInProgress => {
                return Err(DuplicaError::Offline)
            }
            _ => {}
        }

        let state = self.state.lock().await;
        if !state.tablet_mgr.tablet_readable(tablet) {
            return Ok(false);
        }
        if !state.lease_mgr.follower_lease_serving(
            wall_now_us(),
            read_from_leader,
            max_replayed_scn,
        ) {
            return Ok(false);
        }
        Ok(max_replayed_scn >= read_snapshot)
    }

    /// Commit-path gate: checks that every leased follower has replayed
    /// through the transaction's redo point. Lagging followers get a
    /// before-prepare nudge carrying a fresh global timestamp; the caller
    /// is expected to invoke the check again rather than block here.
    pub async fn check_redo_sync_completed(
        &self,
        tx_id: TxId,
        redo_completed_scn: Scn,
    ) -> Result<RedoSyncResult, DuplicaError> {
        self.expect_role(RoleState::Leader).await?;

        let (laggards, replayed_cnt, total_max_read_version) = {
            let state = self.state.lock().await;
            let leased =
                state.lease_mgr.get_lease_valid_array(wall_now_us());
            if leased.is_empty() {
                // no follower can be stale if none is leased
                return Ok(RedoSyncResult {
                    finished: true,
                    total_max_read_version: Scn::MIN,
                });
            }

            let mut laggards = Vec::new();
            let mut total_max = Scn::MIN;
            let mut replayed_cnt = 0;
            for follower in leased {
                let (replayed, max_read_version) = state
                    .tsync_mgr
                    .validate_replay_ts(follower, redo_completed_scn, tx_id);
                if replayed {
                    replayed_cnt += 1;
                    total_max = total_max.max(max_read_version);
                } else {
                    laggards.push(follower);
                }
            }
            (laggards, replayed_cnt, total_max)
        };

        if laggards.is_empty() {
            pf_trace!(
                "{} redo sync done for {} across {} followers",
                self.ls,
                tx_id,
                replayed_cnt
            );
            return Ok(RedoSyncResult {
                finished: true,
                total_max_read_version,
            });
        }

        // fetch a global timestamp under a bounded, cancellable retry and
        // nudge the laggards with it
        let gts = self.fetch_gts_bounded().await?;
        if gts > redo_completed_scn {
            for laggard in &laggards {
                let msg = DupTableMsg::BeforePrepare {
                    ls: self.ls,
                    before_prepare_scn: gts,
                    tx_id,
                };
                if let Err(e) = self.transport.send_msg(*laggard, msg).await {
                    pf_warn!(
                        "{} before-prepare to {} failed: {}",
                        self.ls,
                        laggard,
                        e
                    );
                }
            }
        }

        Ok(RedoSyncResult {
            finished: false,
            total_max_read_version,
        })
    }

    /// Fetches a global timestamp, retrying with jittered backoff within
    /// the configured budget and aborting on cancellation.
    async fn fetch_gts_bounded(&self) -> Result<Scn, DuplicaError> {
        let budget = Duration::from_millis(self.config.gts_timeout_ms);
        let base = Duration::from_millis(self.config.gts_retry_base_ms);
        let mut backoff = RetryBackoff::new(
            base,
            base * 8,
            budget,
            self.cancel_tx.subscribe(),
        )?;

        loop {
            match self.gts_source.fetch_gts(budget).await {
                Ok(scn) => return Ok(scn),
                Err(e) => {
                    pf_debug!("{} gts fetch failed: {}", self.ls, e);
                    if !backoff.wait().await? {
                        return Err(DuplicaError::GtsTimeout);
                    }
                }
            }
        }
    }

    // ---------- checkpoint ----------

    /// Restores the durable tablet-set summary, optionally persisting it
    /// right back (e.g., on rewrite during migration).
    pub async fn set_dup_table_ls_meta(
        &self,
        meta: CheckpointMeta,
        need_flush: bool,
    ) -> Result<(), DuplicaError> {
        {
            let mut state = self.state.lock().await;
            state.tablet_mgr.restore_from_meta(&meta, wall_now_us());
            state.ckpt_meta = Some(meta.clone());
        }
        if need_flush {
            self.checkpoint.flush(self.ls, meta).await?;
        }
        Ok(())
    }

    /// Persists the current tablet-set summary consistent up to `scn`.
    pub async fn flush(&self, scn: Scn) -> Result<(), DuplicaError> {
        let meta = {
            let state = self.state.lock().await;
            state.tablet_mgr.checkpoint_meta(scn)
        };
        self.checkpoint.flush(self.ls, meta).await
    }

    // ---------- diagnostics ----------

    /// Read-only lease table snapshot for operational tooling.
    pub async fn lease_diag(&self) -> Vec<LeaseDiag> {
        self.state
            .lock()
            .await
            .lease_mgr
            .grants_diag()
            .map(|(addr, grant_ts_us, expire_ts_us)| LeaseDiag {
                addr,
                grant_ts_us,
                expire_ts_us,
            })
            .collect()
    }

    /// Read-only tablet membership snapshot for operational tooling.
    pub async fn tablet_diag(&self) -> Vec<TabletDiag> {
        self.state
            .lock()
            .await
            .tablet_mgr
            .tablets_diag()
            .map(|(tablet, state, last_refresh_us)| TabletDiag {
                tablet,
                state,
                last_refresh_us,
            })
            .collect()
    }

    /// Read-only ts-sync cache snapshot for operational tooling.
    pub async fn ts_sync_diag(&self) -> Vec<(ReplicaAddr, TsInfo)> {
        self.state.lock().await.tsync_mgr.infos_diag().collect()
    }

    async fn expect_role(
        &self,
        want: RoleState,
    ) -> Result<(), DuplicaError> {
        let current = self.current_role().await;
        if current == want {
            return Ok(());
        }
        Err(match current {
            RoleState::Uninit => DuplicaError::NotInitialized,
            RoleState::TransitionInProgress => DuplicaError::Offline,
            _ if want == RoleState::Leader => DuplicaError::NotLeader,
            _ => DuplicaError::NotFollower,
        })
    }
}
