//! Snapshot object-map diffing: per-object existence bitmaps folded across a
//! snapshot range into a change map.

pub mod diff;
pub mod driver;
pub mod state;

pub use diff::{
    BitmapFetchError, DiffError, DiffPhase, DiffRequest, DiffStep, SnapId, SnapshotCatalog,
    SnapshotInfo, NOSNAP,
};
pub use driver::{compute_divergence, BitmapSource, CancelToken, PinFuture};
pub use state::{BitmapError, DiffState, ObjectMap, ObjectState};
