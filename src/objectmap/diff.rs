use super::state::{BitmapError, DiffState, ObjectMap, ObjectState};
use log::{debug, trace, warn};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

pub type SnapId = u64;

/// The live image head; sorts after every snapshot.
pub const NOSNAP: SnapId = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SnapshotInfo {
    pub object_count: usize,
    /// Object map known to be stale; diffs against it are refused.
    pub fast_diff_invalid: bool,
}

impl SnapshotInfo {
    pub fn new(object_count: usize) -> Self {
        Self {
            object_count,
            fast_diff_invalid: false,
        }
    }
}

/// Snapshots of one image, plus the head.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotCatalog {
    snapshots: BTreeMap<SnapId, SnapshotInfo>,
    head: SnapshotInfo,
}

impl SnapshotCatalog {
    pub fn new(head_object_count: usize) -> Self {
        Self {
            snapshots: BTreeMap::new(),
            head: SnapshotInfo::new(head_object_count),
        }
    }

    pub fn with_snapshot(mut self, snap: SnapId, object_count: usize) -> Self {
        self.insert(snap, SnapshotInfo::new(object_count));
        self
    }

    pub fn insert(&mut self, snap: SnapId, info: SnapshotInfo) {
        assert!(snap != NOSNAP, "the head is not a snapshot");
        self.snapshots.insert(snap, info);
    }

    pub fn remove(&mut self, snap: SnapId) -> Option<SnapshotInfo> {
        self.snapshots.remove(&snap)
    }

    pub fn set_head(&mut self, info: SnapshotInfo) {
        self.head = info;
    }

    pub fn mark_fast_diff_invalid(&mut self, snap: SnapId) {
        if snap == NOSNAP {
            self.head.fast_diff_invalid = true;
        } else if let Some(info) = self.snapshots.get_mut(&snap) {
            info.fast_diff_invalid = true;
        }
    }

    pub fn get(&self, snap: SnapId) -> Option<SnapshotInfo> {
        if snap == NOSNAP {
            Some(self.head)
        } else {
            self.snapshots.get(&snap).copied()
        }
    }

    /// Snapshot ids strictly between `start` and `end`.
    pub fn ids_between(&self, start: SnapId, end: SnapId) -> impl Iterator<Item = SnapId> + '_ {
        self.snapshots
            .range(start.saturating_add(1)..end)
            .map(|(snap, _)| *snap)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BitmapFetchError {
    #[error("object map does not exist")]
    NotFound,
    /// Store briefly unreachable; retrying later could succeed.
    #[error("object map temporarily unavailable: {0}")]
    Unavailable(String),
    #[error("object map load failed: {0}")]
    Failed(String),
}

impl BitmapFetchError {
    /// Whether an intermediate snapshot may be skipped after this error.
    pub fn is_tolerable(&self) -> bool {
        !matches!(self, BitmapFetchError::Failed(_))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DiffError {
    #[error("invalid snapshot range: start={start} end={end}")]
    InvalidArgument { start: SnapId, end: SnapId },
    #[error("snapshot {0} not found")]
    SnapshotNotFound(SnapId),
    #[error("object map for snapshot {0} is flagged invalid")]
    InvalidObjectMap(SnapId),
    #[error("malformed object map for snapshot {snap}: {source}")]
    Bitmap {
        snap: SnapId,
        #[source]
        source: BitmapError,
    },
    #[error("object map for snapshot {snap} too small: {actual} < {expected}")]
    ObjectMapTooSmall {
        snap: SnapId,
        actual: usize,
        expected: usize,
    },
    #[error("failed to load object map for snapshot {snap}: {reason}")]
    Fetch { snap: SnapId, reason: String },
    #[error("diff request cancelled")]
    Cancelled,
    #[error("diff request is not waiting for an object map")]
    NotLoading,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffPhase {
    Init,
    LoadingSnapshot(SnapId),
    Done,
    Failed,
}

/// What the driver must do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffStep {
    Load(SnapId),
    Done,
}

#[derive(Debug, Clone, Copy)]
struct Loading {
    snap: SnapId,
    object_count: usize,
    intermediate: bool,
}

/// Walks the snapshots in `[start, end]` oldest first, folding each object
/// map into a per-object diff. At most one load is outstanding; the fold
/// for a snapshot runs to completion before the next load is requested.
#[derive(Debug)]
pub struct DiffRequest {
    start: SnapId,
    end: SnapId,
    pending: BTreeSet<SnapId>,
    phase: DiffPhase,
    loading: Option<Loading>,
    diff: Vec<DiffState>,
    diff_valid: bool,
}

impl DiffRequest {
    pub fn new(start: SnapId, end: SnapId) -> Self {
        Self {
            start,
            end,
            pending: BTreeSet::new(),
            phase: DiffPhase::Init,
            loading: None,
            diff: Vec::new(),
            diff_valid: false,
        }
    }

    pub fn phase(&self) -> DiffPhase {
        self.phase
    }

    pub fn diff(&self) -> &[DiffState] {
        &self.diff
    }

    pub fn into_diff(self) -> Vec<DiffState> {
        self.diff
    }

    /// Validates the range and plans the walk against `catalog`.
    pub fn start(&mut self, catalog: &SnapshotCatalog) -> Result<DiffStep, DiffError> {
        if self.phase != DiffPhase::Init {
            return Err(DiffError::NotLoading);
        }
        if self.start == NOSNAP || self.start > self.end {
            return Err(self.fail(DiffError::InvalidArgument {
                start: self.start,
                end: self.end,
            }));
        }
        if self.start == self.end {
            debug!(
                "event=object_map_diff_empty start={} end={}",
                self.start, self.end
            );
            self.phase = DiffPhase::Done;
            return Ok(DiffStep::Done);
        }

        self.diff.clear();
        if self.start != 0 {
            self.pending.insert(self.start);
        }
        self.pending.extend(catalog.ids_between(self.start, self.end));
        self.pending.insert(self.end);
        debug!(
            "event=object_map_diff_start start={} end={} snapshots={}",
            self.start,
            self.end,
            self.pending.len()
        );
        self.advance(catalog)
    }

    /// Folds a completed load and moves on to the next snapshot.
    pub fn on_loaded(
        &mut self,
        result: Result<Vec<u8>, BitmapFetchError>,
        catalog: &SnapshotCatalog,
    ) -> Result<DiffStep, DiffError> {
        let Some(loading) = self.loading.take() else {
            return Err(DiffError::NotLoading);
        };
        let snap = loading.snap;
        let bytes = match result {
            Ok(bytes) => bytes,
            Err(err) if loading.intermediate && err.is_tolerable() => {
                debug!("event=object_map_diff_skip snap={snap} reason=\"{err}\"");
                return self.advance(catalog);
            }
            Err(BitmapFetchError::NotFound) => {
                return Err(self.fail(DiffError::SnapshotNotFound(snap)));
            }
            Err(err) => {
                return Err(self.fail(DiffError::Fetch {
                    snap,
                    reason: err.to_string(),
                }));
            }
        };
        let map = match ObjectMap::decode(&bytes) {
            Ok(map) => map,
            Err(source) => return Err(self.fail(DiffError::Bitmap { snap, source })),
        };
        trace!("event=object_map_diff_loaded snap={snap} objects={}", map.len());
        if let Err(err) = self.fold(snap, loading.object_count, map) {
            return Err(self.fail(err));
        }
        self.advance(catalog)
    }

    /// Abandons the walk; the partial diff is discarded by the caller.
    pub fn cancel(&mut self) -> DiffError {
        self.fail(DiffError::Cancelled)
    }

    fn advance(&mut self, catalog: &SnapshotCatalog) -> Result<DiffStep, DiffError> {
        while let Some(snap) = self.pending.pop_first() {
            // Deleted intermediate snapshots were merged into later ones.
            let intermediate = snap != self.start && snap != self.end;
            let Some(info) = catalog.get(snap) else {
                if intermediate {
                    debug!("event=object_map_diff_skip snap={snap} reason=deleted");
                    continue;
                }
                return Err(self.fail(DiffError::SnapshotNotFound(snap)));
            };
            if info.fast_diff_invalid {
                return Err(self.fail(DiffError::InvalidObjectMap(snap)));
            }
            trace!("event=object_map_diff_load snap={snap}");
            self.loading = Some(Loading {
                snap,
                object_count: info.object_count,
                intermediate,
            });
            self.phase = DiffPhase::LoadingSnapshot(snap);
            return Ok(DiffStep::Load(snap));
        }
        self.phase = DiffPhase::Done;
        debug!(
            "event=object_map_diff_done start={} end={} objects={}",
            self.start,
            self.end,
            self.diff.len()
        );
        Ok(DiffStep::Done)
    }

    fn fold(&mut self, snap: SnapId, object_count: usize, mut map: ObjectMap) -> Result<(), DiffError> {
        if map.len() < object_count {
            return Err(DiffError::ObjectMapTooSmall {
                snap,
                actual: map.len(),
                expected: object_count,
            });
        }
        map.resize(object_count);

        let previous_len = self.diff.len();
        if previous_len < object_count {
            self.diff.resize(object_count, DiffState::Hole);
        }
        // Shrunk image: trailing objects compare as nonexistent.
        if map.len() < self.diff.len() {
            map.resize(self.diff.len());
        }

        let overlap = map.len().min(previous_len);
        for (diff, state) in self.diff[..overlap].iter_mut().zip(&map.states()[..overlap]) {
            *diff = diff.fold(*state);
        }

        let from_origin = self.start == 0;
        for index in overlap..map.len() {
            let state = map.states()[index];
            self.diff[index] = if !state.exists() {
                DiffState::Hole
            } else if from_origin || (self.diff_valid && state != ObjectState::ExistsClean) {
                DiffState::DataUpdated
            } else {
                DiffState::Data
            };
        }
        self.diff_valid = true;
        Ok(())
    }

    fn fail(&mut self, err: DiffError) -> DiffError {
        warn!(
            "event=object_map_diff_failed start={} end={} error=\"{}\"",
            self.start, self.end, err
        );
        self.phase = DiffPhase::Failed;
        self.loading = None;
        self.pending.clear();
        err
    }
}
