use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::SyncError;
use crate::model::Collection;
use crate::storage::{LocalStore, read_versioned, write_versioned};
use crate::store::EntityStore;

pub const CACHE_FORMAT_VERSION: u32 = 1;

/// Last known rows per collection, for painting before the network answers.
#[derive(Clone)]
pub struct SnapshotCache {
    store: Arc<dyn LocalStore>,
}

impl SnapshotCache {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self { store }
    }

    /// Persist `rows`. Returns `false` when nothing was written: the
    /// collection is uncached, or the snapshot is empty and would clobber a
    /// useful cache.
    pub fn save(&self, collection: Collection, rows: &[Value]) -> Result<bool, SyncError> {
        let Some(key) = collection.cache_key() else {
            return Ok(false);
        };
        if rows.is_empty() {
            return Ok(false);
        }
        write_versioned(self.store.as_ref(), key, CACHE_FORMAT_VERSION, rows)?;
        Ok(true)
    }

    pub fn load(&self, collection: Collection) -> Result<Vec<Value>, SyncError> {
        let Some(key) = collection.cache_key() else {
            return Ok(Vec::new());
        };
        Ok(read_versioned(self.store.as_ref(), key, CACHE_FORMAT_VERSION)?.unwrap_or_default())
    }

    /// Fill empty store collections from the cache. Unreadable caches are
    /// skipped; they are rewritten on the next successful fetch.
    pub fn seed(&self, store: &EntityStore) -> Result<usize, SyncError> {
        let mut seeded = 0;
        for collection in Collection::SYNCED {
            if !store.is_empty(collection)? {
                continue;
            }
            match self.load(collection) {
                Ok(rows) if rows.is_empty() => {}
                Ok(rows) => {
                    debug!(collection = %collection, rows = rows.len(), "seeded from cache");
                    store.replace_collection(collection, rows)?;
                    seeded += 1;
                }
                Err(e) => warn!(collection = %collection, error = %e, "ignoring unreadable cache"),
            }
        }
        Ok(seeded)
    }

    /// Write every cached collection from the store.
    pub fn flush(&self, store: &EntityStore) -> Result<(), SyncError> {
        for collection in Collection::SYNCED {
            self.save(collection, &store.records(collection)?)?;
        }
        Ok(())
    }
}
