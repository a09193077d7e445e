use super::diff::{BitmapFetchError, DiffError, DiffRequest, DiffStep, SnapId, SnapshotCatalog};
use super::state::DiffState;
use log::info;
use std::future::Future;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

pub type PinFuture<T> = std::pin::Pin<Box<dyn Future<Output = T> + Send>>;

/// Metadata store holding per-snapshot object maps.
pub trait BitmapSource: Send + Sync {
    /// Current snapshot set; consulted before every load so snapshots removed
    /// mid-walk are noticed.
    fn catalog(&self) -> SnapshotCatalog;
    /// Encoded object map for `snap`.
    fn load_bitmap(&self, snap: SnapId) -> PinFuture<Result<Vec<u8>, BitmapFetchError>>;
}

/// Caller-held cancellation flag, checked between fold steps.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Per-object change state of an image between two snapshots. `start == end`
/// yields an empty diff.
pub async fn compute_divergence(
    source: &dyn BitmapSource,
    start: SnapId,
    end: SnapId,
    cancel: &CancelToken,
) -> Result<Vec<DiffState>, DiffError> {
    let mut request = DiffRequest::new(start, end);
    let mut step = request.start(&source.catalog())?;
    while let DiffStep::Load(snap) = step {
        if cancel.is_cancelled() {
            info!("event=object_map_diff_cancelled start={start} end={end} snap={snap}");
            return Err(request.cancel());
        }
        let loaded = source.load_bitmap(snap).await;
        if cancel.is_cancelled() {
            info!("event=object_map_diff_cancelled start={start} end={end} snap={snap}");
            return Err(request.cancel());
        }
        step = request.on_loaded(loaded, &source.catalog())?;
    }
    Ok(request.into_diff())
}
