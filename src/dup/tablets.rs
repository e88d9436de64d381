//! Per-LS duplicate tablet membership state machine.

use std::collections::HashMap;

use crate::dup::{CheckpointMeta, LsId, Scn, TabletId};

use serde::{Deserialize, Serialize};

use tokio::time::Duration;

/// One tablet's duplicate-read status within its LS.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum TabletState {
    /// Observed as duplicate but its pending writes are not yet proven
    /// durable below a confirmation floor; not locally readable.
    NeedConfirm,

    /// Confirmed; lease-gated local reads may serve it.
    Readable,

    /// First observed while a snapshot log submission was in flight; folded
    /// into `NeedConfirm` once that submission completes, so a durable
    /// snapshot never silently includes a tablet the leader has not begun
    /// confirming.
    ChangingNew,

    /// No longer classified as duplicate; kept only until GC's grace
    /// window passes.
    Removing,
}

/// Membership bookkeeping for one tablet.
#[derive(Debug, Clone, Copy)]
struct TabletMembership {
    state: TabletState,

    /// Last time the scan pass saw this tablet classified as duplicate.
    last_refresh_us: u64,

    /// Highest write scn recorded against this tablet while awaiting
    /// confirmation; the promotion floor must cover it.
    max_write_scn: Scn,
}

/// Combined readable/pending tablet sets as carried in the replicated log.
#[derive(Debug, PartialEq, Eq, Clone, Default, Serialize, Deserialize)]
pub(crate) struct TabletSetSnapshot {
    pub(crate) readable: Vec<TabletId>,
    pub(crate) need_confirm: Vec<TabletId>,
}

/// The per-LS tablet-set manager.
pub(crate) struct TabletSetMgr {
    /// Owning log stream.
    ls: LsId,

    tablets: HashMap<TabletId, TabletMembership>,
}

impl TabletSetMgr {
    pub(crate) fn new(ls: LsId) -> Self {
        TabletSetMgr {
            ls,
            tablets: HashMap::new(),
        }
    }

    /// Records one scan-pass observation of a tablet. A newly observed
    /// duplicate enters `NeedConfirm` (or `ChangingNew` while a snapshot
    /// submission is in flight); a tablet no longer classified duplicate is
    /// marked `Removing` and left for GC's grace window.
    pub(crate) fn refresh(
        &mut self,
        tablet: TabletId,
        is_dup: bool,
        now_us: u64,
        is_logging: bool,
    ) {
        match (self.tablets.get_mut(&tablet), is_dup) {
            (Some(entry), true) => {
                entry.last_refresh_us = now_us;
                if entry.state == TabletState::Removing {
                    // re-classified as duplicate: needs a fresh confirm cycle
                    entry.state = TabletState::NeedConfirm;
                }
            }
            (Some(entry), false) => {
                if entry.state != TabletState::Removing {
                    pf_debug!("{} tablet {} marked removing", self.ls, tablet);
                    entry.state = TabletState::Removing;
                }
            }
            (None, true) => {
                let state = if is_logging {
                    TabletState::ChangingNew
                } else {
                    TabletState::NeedConfirm
                };
                pf_debug!("{} tablet {} inserted {:?}", self.ls, tablet, state);
                self.tablets.insert(
                    tablet,
                    TabletMembership {
                        state,
                        last_refresh_us: now_us,
                        max_write_scn: Scn::MIN,
                    },
                );
            }
            (None, false) => {}
        }
    }

    /// Records a write scn against a tablet still awaiting confirmation.
    pub(crate) fn note_write(&mut self, tablet: TabletId, scn: Scn) {
        if let Some(entry) = self.tablets.get_mut(&tablet) {
            if matches!(
                entry.state,
                TabletState::NeedConfirm | TabletState::ChangingNew
            ) && scn > entry.max_write_scn
            {
                entry.max_write_scn = scn;
            }
        }
    }

    /// Promotes every `NeedConfirm` tablet whose recorded writes all sit at
    /// or below `confirm_scn`. Never promotes past the floor: a tablet with
    /// a write above it stays pending. Returns the number promoted.
    pub(crate) fn try_to_confirm(&mut self, confirm_scn: Scn) -> usize {
        let mut promoted = 0;
        for (tablet, entry) in self.tablets.iter_mut() {
            if entry.state == TabletState::NeedConfirm
                && entry.max_write_scn <= confirm_scn
            {
                entry.state = TabletState::Readable;
                promoted += 1;
                pf_info!(
                    "{} tablet {} confirmed readable under {}",
                    self.ls,
                    tablet,
                    confirm_scn
                );
            }
        }
        promoted
    }

    /// Folds `ChangingNew` tablets into the normal confirm pipeline; called
    /// when the in-flight snapshot submission completes (or aborts).
    pub(crate) fn fold_changing_new(&mut self) {
        for entry in self.tablets.values_mut() {
            if entry.state == TabletState::ChangingNew {
                entry.state = TabletState::NeedConfirm;
            }
        }
    }

    /// Rebuilds membership on leader takeover. A resume keeps state as-is;
    /// a checkpoint attesting "all tablets readable" skips the rebuild;
    /// otherwise everything defensively re-enters `NeedConfirm` pending a
    /// confirm cycle that must also cover the takeover point.
    pub(crate) fn leader_takeover(
        &mut self,
        is_resume: bool,
        checkpoint_all_readable: bool,
        takeover_scn: Scn,
    ) {
        if is_resume {
            return;
        }
        for entry in self.tablets.values_mut() {
            if checkpoint_all_readable {
                entry.state = TabletState::Readable;
            } else {
                entry.state = TabletState::NeedConfirm;
                if takeover_scn > entry.max_write_scn {
                    entry.max_write_scn = takeover_scn;
                }
            }
        }
    }

    /// Discards unconfirmed in-memory state on leader revoke. Readable
    /// tablets survive so the follower can keep serving until replayed
    /// snapshots take over as the source of truth.
    pub(crate) fn leader_revoke(&mut self) {
        self.tablets
            .retain(|_, entry| entry.state == TabletState::Readable);
    }

    /// Evicts tablets not seen as duplicate for at least `grace`. Returns
    /// the number evicted.
    pub(crate) fn gc(&mut self, now_us: u64, grace: Duration) -> usize {
        let grace_us = grace.as_micros() as u64;
        let ls = self.ls;
        let before = self.tablets.len();
        self.tablets.retain(|tablet, entry| {
            let keep =
                now_us.saturating_sub(entry.last_refresh_us) < grace_us;
            if !keep {
                pf_debug!("{} tablet {} evicted by gc", ls, tablet);
            }
            keep
        });
        before - self.tablets.len()
    }

    pub(crate) fn has_dup_tablets(&self) -> bool {
        !self.tablets.is_empty()
    }

    pub(crate) fn tablet_readable(&self, tablet: TabletId) -> bool {
        self.tablets
            .get(&tablet)
            .map(|entry| entry.state == TabletState::Readable)
            .unwrap_or(false)
    }

    /// Snapshot of the readable and pending sets for log serialization, in
    /// deterministic tablet order. `ChangingNew` tablets are deliberately
    /// excluded until folded.
    pub(crate) fn log_snapshot(&self) -> TabletSetSnapshot {
        let mut snapshot = TabletSetSnapshot::default();
        for (&tablet, entry) in self.tablets.iter() {
            match entry.state {
                TabletState::Readable => snapshot.readable.push(tablet),
                TabletState::NeedConfirm => {
                    snapshot.need_confirm.push(tablet)
                }
                TabletState::ChangingNew | TabletState::Removing => {}
            }
        }
        snapshot.readable.sort();
        snapshot.need_confirm.sort();
        snapshot
    }

    /// Replaces membership with a replayed snapshot; wholesale replacement
    /// keeps replay idempotent under duplicate delivery.
    pub(crate) fn apply_logged_snapshot(
        &mut self,
        snapshot: &TabletSetSnapshot,
        now_us: u64,
    ) {
        self.tablets.clear();
        for &tablet in &snapshot.readable {
            self.tablets.insert(
                tablet,
                TabletMembership {
                    state: TabletState::Readable,
                    last_refresh_us: now_us,
                    max_write_scn: Scn::MIN,
                },
            );
        }
        for &tablet in &snapshot.need_confirm {
            self.tablets.insert(
                tablet,
                TabletMembership {
                    state: TabletState::NeedConfirm,
                    last_refresh_us: now_us,
                    max_write_scn: Scn::MIN,
                },
            );
        }
    }

    /// Durable summary of the current membership.
    pub(crate) fn checkpoint_meta(&self, flushed_scn: Scn) -> CheckpointMeta {
        let mut readable_tablets: Vec<TabletId> = self
            .tablets
            .iter()
            .filter(|(_, e)| e.state == TabletState::Readable)
            .map(|(&t, _)| t)
            .collect();
        readable_tablets.sort();
        let all_readable = self
            .tablets
            .values()
            .all(|e| e.state == TabletState::Readable);
        CheckpointMeta {
            readable_tablets,
            all_readable,
            flushed_scn,
        }
    }

    /// Restores membership from a durable summary at restart.
    pub(crate) fn restore_from_meta(
        &mut self,
        meta: &CheckpointMeta,
        now_us: u64,
    ) {
        for &tablet in &meta.readable_tablets {
            self.tablets.insert(
                tablet,
                TabletMembership {
                    state: TabletState::Readable,
                    last_refresh_us: now_us,
                    max_write_scn: Scn::MIN,
                },
            );
        }
    }

    /// Read-only view over membership for diagnostics, in tablet order.
    pub(crate) fn tablets_diag(
        &self,
    ) -> impl Iterator<Item = (TabletId, TabletState, u64)> + '_ {
        let mut rows: Vec<(TabletId, TabletState, u64)> = self
            .tablets
            .iter()
            .map(|(&t, e)| (t, e.state, e.last_refresh_us))
            .collect();
        rows.sort_by_key(|(t, _, _)| *t);
        rows.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_state_machine() {
        let mut mgr = TabletSetMgr::new(LsId(1));
        let t1 = TabletId(101);

        mgr.refresh(t1, true, 1_000, false);
        assert_eq!(
            mgr.tablets_diag().next().unwrap().1,
            TabletState::NeedConfirm
        );

        // no longer duplicate: marked removing, not erased
        mgr.refresh(t1, false, 2_000, false);
        assert_eq!(
            mgr.tablets_diag().next().unwrap().1,
            TabletState::Removing
        );
        assert!(mgr.has_dup_tablets());

        // re-classified: fresh confirm cycle
        mgr.refresh(t1, true, 3_000, false);
        assert_eq!(
            mgr.tablets_diag().next().unwrap().1,
            TabletState::NeedConfirm
        );

        // observed while a submission is in flight: parked as ChangingNew
        let t2 = TabletId(102);
        mgr.refresh(t2, true, 3_000, true);
        let states: Vec<TabletState> =
            mgr.tablets_diag().map(|(_, s, _)| s).collect();
        assert_eq!(
            states,
            vec![TabletState::NeedConfirm, TabletState::ChangingNew]
        );
        mgr.fold_changing_new();
        assert!(mgr
            .tablets_diag()
            .all(|(_, s, _)| s == TabletState::NeedConfirm));
    }

    #[test]
    fn confirm_requires_write_floor() {
        let mut mgr = TabletSetMgr::new(LsId(1));
        let t1 = TabletId(101);
        mgr.refresh(t1, true, 1_000, false);
        mgr.note_write(t1, Scn(100));

        // floor below the recorded write: must not promote
        assert_eq!(mgr.try_to_confirm(Scn(99)), 0);
        assert!(!mgr.tablet_readable(t1));

        // floor covering it: promotes
        assert_eq!(mgr.try_to_confirm(Scn(150)), 1);
        assert!(mgr.tablet_readable(t1));

        // writes against a readable tablet no longer feed the floor
        mgr.note_write(t1, Scn(999));
        assert!(mgr.tablet_readable(t1));
    }

    #[test]
    fn changing_new_excluded_from_snapshot() {
        let mut mgr = TabletSetMgr::new(LsId(1));
        mgr.refresh(TabletId(101), true, 1_000, false);
        mgr.refresh(TabletId(102), true, 1_000, true);
        mgr.try_to_confirm(Scn(10));

        let snapshot = mgr.log_snapshot();
        assert_eq!(snapshot.readable, vec![TabletId(101)]);
        assert!(snapshot.need_confirm.is_empty());
    }

    #[test]
    fn takeover_modes() {
        let mut mgr = TabletSetMgr::new(LsId(1));
        let t1 = TabletId(101);
        mgr.refresh(t1, true, 1_000, false);
        mgr.try_to_confirm(Scn(10));
        assert!(mgr.tablet_readable(t1));

        // resume keeps state
        mgr.leader_takeover(true, false, Scn(50));
        assert!(mgr.tablet_readable(t1));

        // checkpoint attesting all-readable skips the rebuild
        mgr.leader_takeover(false, true, Scn(50));
        assert!(mgr.tablet_readable(t1));

        // otherwise defensively rebuilt, confirm must cover takeover point
        mgr.leader_takeover(false, false, Scn(50));
        assert!(!mgr.tablet_readable(t1));
        assert_eq!(mgr.try_to_confirm(Scn(49)), 0);
        assert_eq!(mgr.try_to_confirm(Scn(50)), 1);
    }

    #[test]
    fn revoke_keeps_readable_only() {
        let mut mgr = TabletSetMgr::new(LsId(1));
        mgr.refresh(TabletId(101), true, 1_000, false);
        mgr.refresh(TabletId(102), true, 1_000, false);
        mgr.note_write(TabletId(102), Scn(100));
        mgr.try_to_confirm(Scn(50));

        mgr.leader_revoke();
        assert!(mgr.tablet_readable(TabletId(101)));
        assert_eq!(mgr.tablets_diag().count(), 1);
    }

    #[test]
    fn gc_grace_window() {
        let mut mgr = TabletSetMgr::new(LsId(1));
        let t1 = TabletId(101);
        mgr.refresh(t1, true, 1_000_000, false);

        let grace = Duration::from_secs(5);
        // absent for less than the grace window: retained
        assert_eq!(mgr.gc(5_000_000, grace), 0);
        assert!(mgr.has_dup_tablets());
        // absent for at least the grace window: evicted
        assert_eq!(mgr.gc(6_000_000, grace), 1);
        assert!(!mgr.has_dup_tablets());
    }

    #[test]
    fn snapshot_apply_idempotent() {
        let mut leader = TabletSetMgr::new(LsId(1));
        leader.refresh(TabletId(101), true, 1_000, false);
        leader.refresh(TabletId(102), true, 1_000, false);
        leader.try_to_confirm(Scn(10));
        leader.note_write(TabletId(102), Scn(99));
        let snapshot = leader.log_snapshot();

        let mut follower = TabletSetMgr::new(LsId(1));
        follower.apply_logged_snapshot(&snapshot, 2_000);
        follower.apply_logged_snapshot(&snapshot, 3_000); // duplicate delivery
        assert!(follower.tablet_readable(TabletId(101)));
        assert!(follower.tablet_readable(TabletId(102)));
        assert_eq!(follower.tablets_diag().count(), 2);
    }

    #[test]
    fn checkpoint_roundtrip() {
        let mut mgr = TabletSetMgr::new(LsId(1));
        mgr.refresh(TabletId(101), true, 1_000, false);
        mgr.refresh(TabletId(102), true, 1_000, false);
        mgr.try_to_confirm(Scn(10));

        let meta = mgr.checkpoint_meta(Scn(10));
        assert!(meta.all_readable);
        assert_eq!(
            meta.readable_tablets,
            vec![TabletId(101), TabletId(102)]
        );

        let mut restored = TabletSetMgr::new(LsId(1));
        restored.restore_from_meta(&meta, 2_000);
        assert!(restored.tablet_readable(TabletId(101)));
    }
}
