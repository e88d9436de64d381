//! Duplicate-table peer-to-peer message payload definitions.
//!
//! Delivery belongs to the `MsgTransport` collaborator; this module only
//! defines the payloads and their serialization.

use std::fmt;

use crate::dup::{LsId, ReplicaAddr, Scn, TsInfo};

use get_size::GetSize;

use serde::{Deserialize, Serialize};

/// Transaction ID type, opaque to this subsystem.
#[derive(
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    GetSize,
)]
pub struct TxId(pub u64);

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "tx:{}", self.0)
    }
}

/// Duplicate-table protocol messages, used as a sub-category of the message
/// type of the embedding transport.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum DupTableMsg {
    /// Follower asking the leader to grant/extend its local-read lease.
    /// Carries the follower's current progress triple so the leader's
    /// ts-sync cache stays warm even between explicit syncs.
    LeaseRequest {
        ls: LsId,
        src: ReplicaAddr,
        /// Follower-side send timestamp; the leader dedupes stale requests
        /// by it.
        request_ts_us: u64,
        /// Validity window the follower is asking for.
        lease_interval_us: u64,
        ts_info: TsInfo,
    },

    /// Leader asking a follower for a fresh progress report.
    TsSyncRequest {
        ls: LsId,
        /// Leader's max commit version, letting the follower bump its own
        /// visibility floor.
        leader_commit_scn: Scn,
    },

    /// Follower's progress report back to the leader.
    TsSyncResponse {
        ls: LsId,
        src: ReplicaAddr,
        ts_info: TsInfo,
    },

    /// Leader's proactive nudge to a follower lagging behind a committing
    /// transaction's redo point; carries a global timestamp the follower
    /// raises its read-version floor to.
    BeforePrepare {
        ls: LsId,
        before_prepare_scn: Scn,
        tx_id: TxId,
    },
}

// no heap-owning fields in any variant, so stack size covers it
impl GetSize for DupTableMsg {}

impl DupTableMsg {
    /// The log stream this message belongs to.
    pub fn ls(&self) -> LsId {
        match self {
            DupTableMsg::LeaseRequest { ls, .. }
            | DupTableMsg::TsSyncRequest { ls, .. }
            | DupTableMsg::TsSyncResponse { ls, .. }
            | DupTableMsg::BeforePrepare { ls, .. } => *ls,
        }
    }
}
