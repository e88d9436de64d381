//! Duplicate-table lease and read-consistency protocol modules.

mod collab;
mod handler;
mod lease;
mod logop;
mod messages;
mod roles;
mod scanner;
mod tablets;
mod tsync;
mod worker;

use std::fmt;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use get_size::GetSize;

use serde::{Deserialize, Serialize};

pub use collab::{
    CheckpointStore, GlobalTsSource, LogStreamClient, MsgTransport,
    TabletCatalog,
};
pub use handler::{DupTableLsHandler, LeaseDiag, RedoSyncResult, TabletDiag};
pub use messages::{DupTableMsg, TxId};
pub use roles::RoleState;
pub use scanner::{DupTabletScanner, ScannerConfig};
pub use tablets::TabletState;
pub use worker::{LoopWorker, LoopWorkerConfig};

pub(crate) use lease::LeaseManager;
pub(crate) use logop::LogEntryMerger;
pub(crate) use roles::RoleCtx;
pub(crate) use tablets::TabletSetMgr;
pub(crate) use tsync::TsSyncManager;

/// Replica network address type.
pub type ReplicaAddr = SocketAddr;

/// Log stream ID uniquely identifying a replicated log group.
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
pub struct LsId(pub u64);

impl fmt::Display for LsId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "LS({})", self.0)
    }
}

/// Tablet ID uniquely identifying one physical tablet.
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
pub struct TabletId(pub u64);

impl fmt::Display for TabletId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "T({})", self.0)
    }
}

/// Log sequence number of a physical record within a log stream.
#[derive(
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Clone,
    Copy,
    Default,
    Serialize,
    Deserialize,
    GetSize,
)]
pub struct Lsn(pub u64);

/// Monotonic logical timestamp ordering log entries and snapshots.
#[derive(
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Clone,
    Copy,
    Default,
    Serialize,
    Deserialize,
    GetSize,
)]
pub struct Scn(pub u64);

impl Scn {
    pub const MIN: Scn = Scn(0);
    pub const MAX: Scn = Scn(u64::MAX);

    pub fn is_min(&self) -> bool {
        *self == Scn::MIN
    }
}

impl fmt::Display for Scn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "scn:{}", self.0)
    }
}

/// Replay/visibility progress report of one follower.
#[derive(
    Debug,
    PartialEq,
    Eq,
    Clone,
    Copy,
    Default,
    Serialize,
    Deserialize,
    GetSize,
)]
pub struct TsInfo {
    /// Highest scn this follower has replayed through.
    pub max_replayed_scn: Scn,

    /// Highest read version this follower has served or will serve next.
    pub max_read_version: Scn,

    /// Highest commit version this follower has observed applied.
    pub max_commit_version: Scn,
}

impl TsInfo {
    /// Component-wise ratchet towards `newer`; each field is only ever
    /// raised. Returns true if any field advanced.
    pub fn advance_to(&mut self, newer: &TsInfo) -> bool {
        let mut advanced = false;
        if newer.max_replayed_scn > self.max_replayed_scn {
            self.max_replayed_scn = newer.max_replayed_scn;
            advanced = true;
        }
        if newer.max_read_version > self.max_read_version {
            self.max_read_version = newer.max_read_version;
            advanced = true;
        }
        if newer.max_commit_version > self.max_commit_version {
            self.max_commit_version = newer.max_commit_version;
            advanced = true;
        }
        advanced
    }

    /// Component-wise minimum with `other`, mutating self.
    pub fn min_with(&mut self, other: &TsInfo) {
        self.max_replayed_scn = self.max_replayed_scn.min(other.max_replayed_scn);
        self.max_read_version = self.max_read_version.min(other.max_read_version);
        self.max_commit_version =
            self.max_commit_version.min(other.max_commit_version);
    }
}

/// Durable summary of an LS's duplicate tablet set, restored at restart to
/// skip re-deriving confirmation work already proven done.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    /// Tablets that had reached READABLE at flush time.
    pub readable_tablets: Vec<TabletId>,

    /// True if at flush time every known tablet was READABLE; lets a new
    /// leader skip the NEED_CONFIRM rebuild entirely.
    pub all_readable: bool,

    /// Scn up to which this summary is consistent.
    pub flushed_scn: Scn,
}

/// Configuration parameters struct for the duplicate-table core of one LS.
#[derive(Debug, Clone, Deserialize)]
pub struct DupTableConfig {
    /// Lease validity window granted to each requesting follower, in
    /// millisecs.
    pub lease_interval_ms: u64,

    /// Interval of the per-LS periodic protocol step, in millisecs.
    pub loop_interval_ms: u64,

    /// Overall budget for a bounded global timestamp wait, in millisecs.
    pub gts_timeout_ms: u64,

    /// Initial backoff delay between global timestamp attempts, in
    /// millisecs.
    pub gts_retry_base_ms: u64,
}

impl Default for DupTableConfig {
    fn default() -> Self {
        DupTableConfig {
            lease_interval_ms: 10_000,
            loop_interval_ms: 100,
            gts_timeout_ms: 1_000,
            gts_retry_base_ms: 10,
        }
    }
}

/// Current wall-clock in microseconds since epoch, the time base for lease
/// grant/expiry arithmetic.
pub(crate) fn wall_now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ts_info_ratchet() {
        let mut info = TsInfo::default();
        let newer = TsInfo {
            max_replayed_scn: Scn(100),
            max_read_version: Scn(90),
            max_commit_version: Scn(80),
        };
        assert!(info.advance_to(&newer));
        assert_eq!(info, newer);

        // regressions are ignored per component
        let older = TsInfo {
            max_replayed_scn: Scn(50),
            max_read_version: Scn(120),
            max_commit_version: Scn(70),
        };
        assert!(info.advance_to(&older));
        assert_eq!(info.max_replayed_scn, Scn(100));
        assert_eq!(info.max_read_version, Scn(120));
        assert_eq!(info.max_commit_version, Scn(80));
    }

    #[test]
    fn ts_info_min_fold() {
        let mut floor = TsInfo {
            max_replayed_scn: Scn::MAX,
            max_read_version: Scn::MAX,
            max_commit_version: Scn::MAX,
        };
        floor.min_with(&TsInfo {
            max_replayed_scn: Scn(150),
            max_read_version: Scn(140),
            max_commit_version: Scn(130),
        });
        floor.min_with(&TsInfo {
            max_replayed_scn: Scn(160),
            max_read_version: Scn(100),
            max_commit_version: Scn(170),
        });
        assert_eq!(floor.max_replayed_scn, Scn(150));
        assert_eq!(floor.max_read_version, Scn(100));
        assert_eq!(floor.max_commit_version, Scn(130));
    }
}
