//! Core library for placement-group replicas.
//! Reconciles a replica's operation log against an authoritative peer,
//! diffs per-snapshot object maps, and allocates extents from free space.

pub mod allocator;
pub mod objectmap;
pub mod pglog;
pub mod util;

pub use allocator::{AllocError, AllocatorConfig, Extent, ExtentAllocator};
pub use objectmap::{
    compute_divergence, BitmapFetchError, BitmapSource, CancelToken, DiffError, DiffRequest,
    DiffState, ObjectMap, ObjectState, SnapId, SnapshotCatalog, NOSNAP,
};
pub use pglog::{
    DupEntry, Eversion, IndexedLog, LastBackfill, LogEntry, LogOp, LogWriteDescriptor,
    LogWriteError, LogWriter, MissingItem, MissingObjectTracker, ObjectId, PgInfo, PgLog,
    PgLogConfig, PgLogRecord, RequestId, RollbackHandler, SharedPgLog,
};
pub use util::{ConfigError, PgCoreConfig, PgCoreError};
