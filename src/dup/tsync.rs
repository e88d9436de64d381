//! Per-follower timestamp synchronization bookkeeping.

use std::collections::HashMap;

use crate::dup::{LsId, ReplicaAddr, Scn, TsInfo};
use crate::dup::messages::TxId;

/// Leader-side cache of every follower's replay/visibility progress,
/// updated from lease piggybacks and explicit ts-sync exchanges.
pub(crate) struct TsSyncManager {
    /// Owning log stream.
    ls: LsId,

    /// Per-follower progress triples; each component only ever advances
    /// until the cache is reset across a role change.
    infos: HashMap<ReplicaAddr, TsInfo>,
}

impl TsSyncManager {
    pub(crate) fn new(ls: LsId) -> Self {
        TsSyncManager {
            ls,
            infos: HashMap::new(),
        }
    }

    /// Folds a follower's report into the cache. Regressed components are
    /// ignored; the cache is a ratchet between resets.
    pub(crate) fn update(&mut self, addr: ReplicaAddr, ts_info: &TsInfo) {
        let entry = self.infos.entry(addr).or_default();
        if entry.advance_to(ts_info) {
            pf_trace!(
                "{} ts_sync {} replayed {} read {} commit {}",
                self.ls,
                addr,
                entry.max_replayed_scn,
                entry.max_read_version,
                entry.max_commit_version
            );
        }
    }

    /// Component-wise minimum progress across the given leased followers.
    /// A leased follower with no report yet pins the floor at `Scn::MIN`;
    /// the leader may only confirm tablets, or treat redo as visible
    /// everywhere, up to this pessimistic bound.
    pub(crate) fn get_min_lease_ts_info(
        &self,
        leased: &[ReplicaAddr],
    ) -> TsInfo {
        let mut floor = TsInfo {
            max_replayed_scn: Scn::MAX,
            max_read_version: Scn::MAX,
            max_commit_version: Scn::MAX,
        };
        for addr in leased {
            match self.infos.get(addr) {
                Some(info) => floor.min_with(info),
                None => floor.min_with(&TsInfo::default()),
            }
        }
        floor
    }

    /// Whether a specific follower has replayed through a specific scn;
    /// also hands back that follower's reported max read version for the
    /// caller's commit-version fold.
    pub(crate) fn validate_replay_ts(
        &self,
        addr: ReplicaAddr,
        redo_completed_scn: Scn,
        tx_id: TxId,
    ) -> (bool, Scn) {
        match self.infos.get(&addr) {
            Some(info) if info.max_replayed_scn >= redo_completed_scn => {
                (true, info.max_read_version)
            }
            _ => {
                pf_trace!(
                    "{} {} replay not reached {} on {}",
                    self.ls,
                    tx_id,
                    redo_completed_scn,
                    addr
                );
                (false, Scn::MIN)
            }
        }
    }

    /// Drops cached entries for followers no longer in the leased set, so
    /// departed followers cannot pin future validations.
    pub(crate) fn retain_leased(&mut self, leased: &[ReplicaAddr]) {
        self.infos.retain(|addr, _| leased.contains(addr));
    }

    /// Full cache reset across a leader takeover/revoke.
    pub(crate) fn reset(&mut self) {
        self.infos.clear();
    }

    /// Read-only view over cached progress for diagnostics, in address
    /// order.
    pub(crate) fn infos_diag(
        &self,
    ) -> impl Iterator<Item = (ReplicaAddr, TsInfo)> + '_ {
        let mut rows: Vec<(ReplicaAddr, TsInfo)> =
            self.infos.iter().map(|(&a, &i)| (a, i)).collect();
        rows.sort_by_key(|(a, _)| *a);
        rows.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> ReplicaAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn info(replayed: u64, read: u64, commit: u64) -> TsInfo {
        TsInfo {
            max_replayed_scn: Scn(replayed),
            max_read_version: Scn(read),
            max_commit_version: Scn(commit),
        }
    }

    #[test]
    fn updates_never_regress() {
        let mut mgr = TsSyncManager::new(LsId(1));
        let f1 = addr(7701);

        mgr.update(f1, &info(100, 90, 80));
        mgr.update(f1, &info(50, 95, 70));
        let (_, cached) = mgr.infos_diag().next().unwrap();
        assert_eq!(cached, info(100, 95, 80));
    }

    #[test]
    fn min_floor_pessimistic() {
        let mut mgr = TsSyncManager::new(LsId(1));
        let (f1, f2, f3) = (addr(7701), addr(7702), addr(7703));

        mgr.update(f1, &info(150, 140, 130));
        mgr.update(f2, &info(200, 100, 170));

        let floor = mgr.get_min_lease_ts_info(&[f1, f2]);
        assert_eq!(floor, info(150, 100, 130));

        // a leased follower that has never reported pins the floor at MIN
        let floor = mgr.get_min_lease_ts_info(&[f1, f2, f3]);
        assert_eq!(floor, TsInfo::default());
    }

    #[test]
    fn validate_replay_progress() {
        let mut mgr = TsSyncManager::new(LsId(1));
        let f1 = addr(7701);
        mgr.update(f1, &info(150, 140, 130));

        assert_eq!(
            mgr.validate_replay_ts(f1, Scn(100), TxId(1)),
            (true, Scn(140))
        );
        assert_eq!(
            mgr.validate_replay_ts(f1, Scn(151), TxId(1)),
            (false, Scn::MIN)
        );
        // unknown follower is never considered replayed
        assert_eq!(
            mgr.validate_replay_ts(addr(7799), Scn(0), TxId(1)),
            (false, Scn::MIN)
        );
    }

    #[test]
    fn retain_and_reset() {
        let mut mgr = TsSyncManager::new(LsId(1));
        let (f1, f2) = (addr(7701), addr(7702));
        mgr.update(f1, &info(1, 1, 1));
        mgr.update(f2, &info(2, 2, 2));

        mgr.retain_leased(&[f2]);
        assert_eq!(mgr.infos_diag().count(), 1);

        mgr.reset();
        assert_eq!(mgr.infos_diag().count(), 0);
    }
}
