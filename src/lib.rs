//! Duplicate-table lease and read-consistency protocol core.
//!
//! A table replicated to every member of a log-stream replica group can be
//! read locally from any follower, provided the follower holds an
//! unexpired leader-granted lease and has replayed far enough. This crate
//! implements the lease, timestamp-sync, and tablet-membership state
//! machines behind that guarantee, plus the periodic protocol step, the
//! discovery scan task, and the per-tenant loop worker driving it all.

#[macro_use]
mod utils;

mod dup;

pub use utils::{logger_init, DuplicaError, RetryBackoff, Timer, ME};

pub use dup::{
    CheckpointMeta, CheckpointStore, DupTableConfig, DupTableLsHandler,
    DupTableMsg, DupTabletScanner, GlobalTsSource, LeaseDiag,
    LogStreamClient, LoopWorker, LoopWorkerConfig, LsId, Lsn, MsgTransport,
    RedoSyncResult, ReplicaAddr, RoleState, ScannerConfig, Scn,
    TabletCatalog, TabletDiag, TabletId, TabletState, TsInfo, TxId,
};
