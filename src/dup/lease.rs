//! Per-LS lease management: leader-side grant table plus follower-side
//! lease state derived purely from replayed log entries.

use std::collections::HashMap;

use crate::dup::{LsId, ReplicaAddr, Scn};
use crate::utils::DuplicaError;

use get_size::GetSize;

use serde::{Deserialize, Serialize};

use tokio::time::Duration;

/// One follower's lease grant, exactly as carried in the replicated log.
#[derive(
    Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize, GetSize,
)]
pub(crate) struct LeaseGrant {
    /// Leader wall-clock microseconds at grant time.
    pub(crate) grant_ts_us: u64,

    /// Validity window length in microseconds.
    pub(crate) lease_interval_us: u64,
}

impl LeaseGrant {
    pub(crate) fn expire_ts_us(&self) -> u64 {
        self.grant_ts_us.saturating_add(self.lease_interval_us)
    }
}

/// Leader-side cache of the most recent lease request from one follower.
#[derive(Debug, Clone, Copy)]
struct CachedLeaseRequest {
    /// Follower-side send timestamp; stale requests are deduped by it.
    request_ts_us: u64,

    /// Validity window the follower asked for.
    lease_interval_us: u64,

    /// True once folded into a grant by a periodic step.
    served: bool,
}

/// Follower-side lease state, a deterministic function of replicated
/// history only.
#[derive(Debug, Clone, Copy)]
struct FollowerLease {
    /// Expiry in leader wall-clock microseconds; only ever raised except on
    /// explicit reset.
    expire_ts_us: u64,

    /// Scn of the log entry that produced the current expiry; serving
    /// requires replay to have reached it.
    granted_at: Scn,
}

/// The per-LS lease manager.
///
/// The leader caches follower requests and folds them into granted leases
/// during the periodic step; the grants ride inside the combined snapshot
/// log entry. A follower never learns its lease from RPC: it derives
/// validity from replaying those entries, so there is no split-brain
/// between what RPC says and what the log says.
pub(crate) struct LeaseManager {
    /// Owning log stream.
    ls: LsId,

    /// Configured cap on any granted validity window.
    lease_interval: Duration,

    /// Leader side: freshest request per follower address.
    requests: HashMap<ReplicaAddr, CachedLeaseRequest>,

    /// Leader side: current grant per follower address.
    grants: HashMap<ReplicaAddr, LeaseGrant>,

    /// Follower side: my own lease as replayed from the leader's log.
    follower_lease: Option<FollowerLease>,
}

impl LeaseManager {
    /// Creates a new lease manager for one LS.
    pub(crate) fn new(
        ls: LsId,
        lease_interval: Duration,
    ) -> Result<Self, DuplicaError> {
        if lease_interval < Duration::from_millis(100)
            || lease_interval > Duration::from_secs(60)
        {
            return logged_err!(
                "invalid lease_interval {:?} for {}",
                lease_interval,
                ls
            );
        }

        Ok(LeaseManager {
            ls,
            lease_interval,
            requests: HashMap::new(),
            grants: HashMap::new(),
            follower_lease: None,
        })
    }

    /// Leader side: records/extends a follower's cached lease request.
    pub(crate) fn receive_lease_request(
        &mut self,
        addr: ReplicaAddr,
        request_ts_us: u64,
        lease_interval_us: u64,
    ) {
        let entry =
            self.requests.entry(addr).or_insert_with(|| CachedLeaseRequest {
                request_ts_us: 0,
                lease_interval_us,
                served: true,
            });
        if request_ts_us > entry.request_ts_us {
            entry.request_ts_us = request_ts_us;
            entry.lease_interval_us = lease_interval_us;
            entry.served = false;
        }
    }

    /// Leader side: folds unserved requests into granted leases. A grant is
    /// only ever replaced by one with a later expiry. Returns true if any
    /// grant changed (and so deserves a log submission).
    pub(crate) fn update_granted_leases(&mut self, now_us: u64) -> bool {
        let mut changed = false;
        for (&addr, req) in self.requests.iter_mut() {
            if req.served {
                continue;
            }
            req.served = true;

            let interval_us = req
                .lease_interval_us
                .min(self.lease_interval.as_micros() as u64);
            let grant = LeaseGrant {
                grant_ts_us: now_us,
                lease_interval_us: interval_us,
            };

            match self.grants.get(&addr) {
                Some(old) if old.expire_ts_us() >= grant.expire_ts_us() => {}
                _ => {
                    pf_trace!(
                        "{} lease grant -> {} expire_us {}",
                        self.ls,
                        addr,
                        grant.expire_ts_us()
                    );
                    self.grants.insert(addr, grant);
                    changed = true;
                }
            }
        }
        changed
    }

    /// Leader side: all followers holding a currently unexpired lease, in
    /// deterministic address order. This set is the quorum membership for
    /// both the confirm step and the redo-sync check.
    pub(crate) fn get_lease_valid_array(
        &self,
        now_us: u64,
    ) -> Vec<ReplicaAddr> {
        let mut valid: Vec<ReplicaAddr> = self
            .grants
            .iter()
            .filter(|(_, g)| g.expire_ts_us() > now_us)
            .map(|(&addr, _)| addr)
            .collect();
        valid.sort();
        valid
    }

    /// Leader side: snapshot of all grants for log serialization, in
    /// deterministic address order.
    pub(crate) fn grants_snapshot(&self) -> Vec<(ReplicaAddr, LeaseGrant)> {
        let mut grants: Vec<(ReplicaAddr, LeaseGrant)> =
            self.grants.iter().map(|(&a, &g)| (a, g)).collect();
        grants.sort_by_key(|(a, _)| *a);
        grants
    }

    /// Leader side: on takeover, pushes every existing grant's validity out
    /// to a full window from now, so followers granted by the predecessor
    /// are not cut off mid-transition.
    pub(crate) fn leader_takeover(&mut self, now_us: u64) {
        let interval_us = self.lease_interval.as_micros() as u64;
        for grant in self.grants.values_mut() {
            if grant.expire_ts_us() < now_us.saturating_add(interval_us) {
                grant.grant_ts_us = now_us;
                grant.lease_interval_us = interval_us;
            }
        }
    }

    /// Leader side: discards all leader-side lease state.
    pub(crate) fn leader_revoke(&mut self) {
        self.requests.clear();
        self.grants.clear();
    }

    /// Follower side: explicit reset of the replay-derived lease.
    pub(crate) fn follower_reset(&mut self) {
        self.follower_lease = None;
    }

    /// Follower side: applies the grants carried by a replayed log entry.
    /// Only the entry for `me` matters; expiry is a ratchet, so duplicate
    /// delivery and out-of-order replay of stale entries are harmless.
    pub(crate) fn apply_logged_grants(
        &mut self,
        me: ReplicaAddr,
        grants: &[(ReplicaAddr, LeaseGrant)],
        entry_scn: Scn,
    ) {
        for (addr, grant) in grants {
            if *addr != me {
                continue;
            }
            let expire = grant.expire_ts_us();
            match &mut self.follower_lease {
                Some(lease) if lease.expire_ts_us >= expire => {}
                slot => {
                    *slot = Some(FollowerLease {
                        expire_ts_us: expire,
                        granted_at: entry_scn,
                    });
                }
            }
        }
    }

    /// Follower side: true iff local reads may be served -- the replayed
    /// lease is unexpired and replay has progressed at least to the entry
    /// that granted it. Reads routed at the leader pass trivially.
    pub(crate) fn follower_lease_serving(
        &self,
        now_us: u64,
        read_from_leader: bool,
        max_replayed_scn: Scn,
    ) -> bool {
        if read_from_leader {
            return true;
        }
        match &self.follower_lease {
            Some(lease) => {
                lease.expire_ts_us > now_us
                    && max_replayed_scn >= lease.granted_at
            }
            None => false,
        }
    }

    /// Read-only view over leader-side grants for diagnostics, as
    /// (addr, grant_ts_us, expire_ts_us) tuples in address order.
    pub(crate) fn grants_diag(
        &self,
    ) -> impl Iterator<Item = (ReplicaAddr, u64, u64)> + '_ {
        let mut rows: Vec<(ReplicaAddr, u64, u64)> = self
            .grants
            .iter()
            .map(|(&a, g)| (a, g.grant_ts_us, g.expire_ts_us()))
            .collect();
        rows.sort_by_key(|(a, _, _)| *a);
        rows.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> ReplicaAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn mgr() -> LeaseManager {
        LeaseManager::new(LsId(1), Duration::from_secs(10)).unwrap()
    }

    #[test]
    fn interval_validation() {
        assert!(LeaseManager::new(LsId(1), Duration::from_millis(10)).is_err());
        assert!(LeaseManager::new(LsId(1), Duration::from_secs(100)).is_err());
    }

    #[test]
    fn grant_expiry_monotonic() {
        let mut mgr = mgr();
        let f1 = addr(7701);

        mgr.receive_lease_request(f1, 1_000, 10_000_000);
        assert!(mgr.update_granted_leases(50_000));
        let expire1 = mgr.grants_snapshot()[0].1.expire_ts_us();

        // a stale request (older request_ts) must not shrink the grant
        mgr.receive_lease_request(f1, 500, 1_000);
        assert!(!mgr.update_granted_leases(60_000));
        assert_eq!(mgr.grants_snapshot()[0].1.expire_ts_us(), expire1);

        // a fresh request extends it
        mgr.receive_lease_request(f1, 2_000, 10_000_000);
        assert!(mgr.update_granted_leases(70_000));
        assert!(mgr.grants_snapshot()[0].1.expire_ts_us() > expire1);
    }

    #[test]
    fn requested_interval_clamped() {
        let mut mgr = mgr();
        let f1 = addr(7701);
        mgr.receive_lease_request(f1, 1_000, u64::MAX);
        mgr.update_granted_leases(0);
        assert_eq!(
            mgr.grants_snapshot()[0].1.lease_interval_us,
            Duration::from_secs(10).as_micros() as u64
        );
    }

    #[test]
    fn valid_array_filters_expired() {
        let mut mgr = mgr();
        let (f1, f2) = (addr(7701), addr(7702));

        mgr.receive_lease_request(f1, 1_000, 10_000_000);
        mgr.update_granted_leases(0);
        mgr.receive_lease_request(f2, 1_000, 10_000_000);
        mgr.update_granted_leases(5_000_000);

        // both valid shortly after the second grant
        assert_eq!(mgr.get_lease_valid_array(6_000_000), vec![f1, f2]);
        // f1's window (0 + 10s) has passed, f2's (5s + 10s) has not
        assert_eq!(mgr.get_lease_valid_array(12_000_000), vec![f2]);
        // both gone
        assert!(mgr.get_lease_valid_array(20_000_000).is_empty());
    }

    #[test]
    fn takeover_extends_validity() {
        let mut mgr = mgr();
        let f1 = addr(7701);
        mgr.receive_lease_request(f1, 1_000, 10_000_000);
        mgr.update_granted_leases(0);

        // nearly expired at t=9s; takeover pushes a full window from now
        mgr.leader_takeover(9_000_000);
        assert_eq!(
            mgr.grants_snapshot()[0].1.expire_ts_us(),
            19_000_000
        );

        // revoke drops everything
        mgr.leader_revoke();
        assert!(mgr.grants_snapshot().is_empty());
    }

    #[test]
    fn follower_lease_from_replay_only() {
        let mut mgr = mgr();
        let me = addr(7702);
        let other = addr(7703);

        // an entry granting only to another follower does nothing for me
        let grant = LeaseGrant {
            grant_ts_us: 1_000_000,
            lease_interval_us: 10_000_000,
        };
        mgr.apply_logged_grants(me, &[(other, grant)], Scn(5));
        assert!(!mgr.follower_lease_serving(2_000_000, false, Scn(100)));

        mgr.apply_logged_grants(me, &[(me, grant), (other, grant)], Scn(5));
        // serving: unexpired and replayed past the granting entry
        assert!(mgr.follower_lease_serving(2_000_000, false, Scn(5)));
        // replay not yet caught up to the granting entry
        assert!(!mgr.follower_lease_serving(2_000_000, false, Scn(4)));
        // expired
        assert!(!mgr.follower_lease_serving(12_000_000, false, Scn(100)));
        // leader-routed reads pass regardless
        assert!(mgr.follower_lease_serving(12_000_000, true, Scn(0)));
    }

    #[test]
    fn follower_expiry_ratchets() {
        let mut mgr = mgr();
        let me = addr(7702);
        let newer = LeaseGrant {
            grant_ts_us: 5_000_000,
            lease_interval_us: 10_000_000,
        };
        let older = LeaseGrant {
            grant_ts_us: 1_000_000,
            lease_interval_us: 10_000_000,
        };

        mgr.apply_logged_grants(me, &[(me, newer)], Scn(9));
        // duplicate/stale replay must not shrink the lease nor bump the
        // granted_at requirement
        mgr.apply_logged_grants(me, &[(me, older)], Scn(3));
        assert!(mgr.follower_lease_serving(14_000_000, false, Scn(9)));

        // explicit reset drops it
        mgr.follower_reset();
        assert!(!mgr.follower_lease_serving(6_000_000, false, Scn(100)));
    }
}
