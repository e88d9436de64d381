//! Collaborator traits at the subsystem's seams.
//!
//! The handler, scanner, and worker never reach for ambient singletons;
//! every external service is injected at construction behind one of these
//! traits.

use std::collections::HashSet;

use crate::dup::messages::DupTableMsg;
use crate::dup::{CheckpointMeta, LsId, Lsn, ReplicaAddr, Scn, TabletId};
use crate::utils::DuplicaError;

use async_trait::async_trait;

use bytes::Bytes;

use tokio::time::Duration;

/// Submission side of the LS's underlying replicated log. Durability is
/// signalled back through the handler's `on_log_synced` / `on_log_aborted`
/// callbacks, not through this trait.
#[async_trait]
pub trait LogStreamClient: Send + Sync {
    /// Submits an opaque duplicate-table payload to the LS's log; returns
    /// the (lsn, scn) assigned to the entry.
    async fn submit_entry(
        &self,
        ls: LsId,
        payload: Bytes,
    ) -> Result<(Lsn, Scn), DuplicaError>;
}

/// Globally synchronized timestamp service bounding read staleness.
#[async_trait]
pub trait GlobalTsSource: Send + Sync {
    /// Fetches the current global timestamp, failing after `timeout`.
    async fn fetch_gts(&self, timeout: Duration) -> Result<Scn, DuplicaError>;
}

/// Outgoing side of the peer-to-peer message transport.
#[async_trait]
pub trait MsgTransport: Send + Sync {
    async fn send_msg(
        &self,
        to: ReplicaAddr,
        msg: DupTableMsg,
    ) -> Result<(), DuplicaError>;
}

/// Schema/catalog lookups backing tablet discovery.
#[async_trait]
pub trait TabletCatalog: Send + Sync {
    /// The tenant's at-most-one duplicate-eligible log stream.
    async fn dup_eligible_ls(&self) -> Result<Option<LsId>, DuplicaError>;

    /// Current leader address of the given LS, if known.
    async fn ls_leader(
        &self,
        ls: LsId,
    ) -> Result<Option<ReplicaAddr>, DuplicaError>;

    /// The tenant's current duplicate-table tablet set.
    async fn dup_tablet_set(&self)
        -> Result<HashSet<TabletId>, DuplicaError>;

    /// Tablets physically hosted on the given LS at this replica.
    async fn hosted_tablets(
        &self,
        ls: LsId,
    ) -> Result<Vec<TabletId>, DuplicaError>;
}

/// Persistence collaborator owning checkpoint format and storage; this
/// core defines only the logical summary it hands over.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn flush(
        &self,
        ls: LsId,
        meta: CheckpointMeta,
    ) -> Result<(), DuplicaError>;
}

/// Trivial collaborator stubs shared by the worker/scanner unit tests.
#[cfg(test)]
pub(crate) mod test_stubs {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Log stream stub assigning increasing (lsn, scn) pairs.
    pub(crate) struct NullLogStream {
        next: AtomicU64,
    }

    impl NullLogStream {
        pub(crate) fn new() -> Self {
            NullLogStream {
                next: AtomicU64::new(1),
            }
        }
    }

    #[async_trait]
    impl LogStreamClient for NullLogStream {
        async fn submit_entry(
            &self,
            _ls: LsId,
            _payload: Bytes,
        ) -> Result<(Lsn, Scn), DuplicaError> {
            let seq = self.next.fetch_add(1, Ordering::SeqCst);
            Ok((Lsn(seq), Scn(seq)))
        }
    }

    pub(crate) struct NullGts;

    #[async_trait]
    impl GlobalTsSource for NullGts {
        async fn fetch_gts(
            &self,
            _timeout: Duration,
        ) -> Result<Scn, DuplicaError> {
            Ok(Scn(1))
        }
    }

    pub(crate) struct NullTransport;

    #[async_trait]
    impl MsgTransport for NullTransport {
        async fn send_msg(
            &self,
            _to: ReplicaAddr,
            _msg: DupTableMsg,
        ) -> Result<(), DuplicaError> {
            Ok(())
        }
    }

    pub(crate) struct NullCheckpoint;

    #[async_trait]
    impl CheckpointStore for NullCheckpoint {
        async fn flush(
            &self,
            _ls: LsId,
            _meta: CheckpointMeta,
        ) -> Result<(), DuplicaError> {
            Ok(())
        }
    }
}
