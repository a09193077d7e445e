//! Placement-group operation log: ordered entries with object and request
//! indices, the replica's missing set, and the reconciliation that brings a
//! divergent replica back in line with an authoritative peer log.

pub mod dirty;
pub mod entry;
pub mod log;
pub mod missing;
pub mod reconcile;
pub mod rollback;
pub mod version;

pub use dirty::{DirtyTracker, LogWriteDescriptor, LogWriteError, LogWriter};
pub use entry::{DupEntry, LogEntry, LogOp, ObjectId, RequestId};
pub use log::{DupMerge, IndexedLog, LogInvariantError, PgLogRecord, TrimOutcome};
pub use missing::{MissingItem, MissingObjectTracker};
pub use reconcile::{
    LastBackfill, PgInfo, PgLog, PgLogConfig, SharedPgLog, DEFAULT_DUPS_TRACKED,
};
pub use rollback::{NoopRollback, RollbackHandler};
pub use version::Eversion;
