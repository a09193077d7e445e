#![allow(dead_code)]

use parking_lot::Mutex;
use pgcore::objectmap::{
    BitmapFetchError, BitmapSource, ObjectMap, ObjectState, PinFuture, SnapId, SnapshotCatalog,
};
use std::collections::HashMap;

/// In-memory image metadata with scripted per-snapshot load results.
pub struct ScriptedImage {
    catalog: Mutex<SnapshotCatalog>,
    maps: Mutex<HashMap<SnapId, Result<Vec<u8>, BitmapFetchError>>>,
    /// Snapshot removed from the catalog once the keyed snapshot is loaded.
    delete_after_load: Mutex<HashMap<SnapId, SnapId>>,
    loads: Mutex<Vec<SnapId>>,
}

impl ScriptedImage {
    pub fn new(catalog: SnapshotCatalog) -> Self {
        Self {
            catalog: Mutex::new(catalog),
            maps: Mutex::new(HashMap::new()),
            delete_after_load: Mutex::new(HashMap::new()),
            loads: Mutex::new(Vec::new()),
        }
    }

    pub fn with_map(self, snap: SnapId, len: usize, states: &[(usize, ObjectState)]) -> Self {
        let mut map = ObjectMap::new(len);
        for (index, state) in states {
            map.set(*index, *state);
        }
        self.maps.lock().insert(snap, Ok(map.encode()));
        self
    }

    pub fn with_bytes(self, snap: SnapId, bytes: Vec<u8>) -> Self {
        self.maps.lock().insert(snap, Ok(bytes));
        self
    }

    pub fn with_error(self, snap: SnapId, err: BitmapFetchError) -> Self {
        self.maps.lock().insert(snap, Err(err));
        self
    }

    pub fn deleting_after_load(self, loaded: SnapId, deleted: SnapId) -> Self {
        self.delete_after_load.lock().insert(loaded, deleted);
        self
    }

    pub fn loads(&self) -> Vec<SnapId> {
        self.loads.lock().clone()
    }
}

impl BitmapSource for ScriptedImage {
    fn catalog(&self) -> SnapshotCatalog {
        self.catalog.lock().clone()
    }

    fn load_bitmap(&self, snap: SnapId) -> PinFuture<Result<Vec<u8>, BitmapFetchError>> {
        self.loads.lock().push(snap);
        if let Some(deleted) = self.delete_after_load.lock().get(&snap) {
            self.catalog.lock().remove(*deleted);
        }
        let result = self
            .maps
            .lock()
            .get(&snap)
            .cloned()
            .unwrap_or(Err(BitmapFetchError::NotFound));
        Box::pin(async move {
            tokio::task::yield_now().await;
            result
        })
    }
}
