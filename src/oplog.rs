use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tracing::debug;

use crate::error::SyncError;
use crate::model::{Collection, OpType, new_id, record_id};
use crate::storage::{LocalStore, decode_versioned, encode_versioned, read_versioned};

/// Storage key holding the whole queue.
pub const QUEUE_KEY: &str = "offline_queue";
/// Bump when the persisted layout of [`QueuedOperation`] changes.
pub const QUEUE_FORMAT_VERSION: u32 = 1;

/// A mutation waiting for remote confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperation {
    pub id: String,
    pub kind: OpType,
    pub collection: Collection,
    /// Entity-shaped data. Always carries the entity id for updates and deletes.
    pub payload: Value,
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedOperation {
    pub fn entity_id(&self) -> Option<String> {
        record_id(&self.payload)
    }
}

/// An operation before it is assigned an id and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOperation {
    pub kind: OpType,
    pub collection: Collection,
    pub payload: Value,
}

impl PendingOperation {
    pub fn new(kind: OpType, collection: Collection, payload: Value) -> Self {
        Self { kind, collection, payload }
    }
}

/// Durable, ordered queue of local mutations.
///
/// Every enqueue and remove rewrites the full persisted array inside one
/// [`LocalStore::update`], so several logs over the same file never drop each
/// other's entries. The queue is expected to hold tens of entries, not millions.
pub struct OperationLog {
    store: Arc<dyn LocalStore>,
    len_tx: watch::Sender<usize>,
}

impl OperationLog {
    /// Bind the log to a store. Fails if persisted content cannot be read.
    pub fn open(store: Arc<dyn LocalStore>) -> Result<Self, SyncError> {
        let (len_tx, _) = watch::channel(0);
        let log = Self { store, len_tx };
        let len = log.list_all()?.len();
        log.len_tx.send_replace(len);
        Ok(log)
    }

    /// Assign an id and timestamp, persist, and return the stored record.
    pub fn enqueue(&self, op: PendingOperation) -> Result<QueuedOperation, SyncError> {
        if op.kind != OpType::Insert && record_id(&op.payload).is_none() {
            return Err(SyncError::InvalidOperation(format!(
                "{} on {} requires an entity id",
                op.kind.as_str(),
                op.collection
            )));
        }
        let queued = QueuedOperation {
            id: new_id(),
            kind: op.kind,
            collection: op.collection,
            payload: op.payload,
            enqueued_at: Utc::now(),
        };

        self.modify(|entries| {
            entries.push(queued.clone());
            true
        })?;
        debug!(
            op_id = %queued.id,
            collection = %queued.collection,
            kind = queued.kind.as_str(),
            "queued operation"
        );
        Ok(queued)
    }

    /// All entries in enqueue order.
    pub fn list_all(&self) -> Result<Vec<QueuedOperation>, SyncError> {
        self.read()
    }

    /// Remove by id. Removing an absent id is a no-op.
    pub fn remove(&self, id: &str) -> Result<(), SyncError> {
        self.modify(|entries| {
            let before = entries.len();
            entries.retain(|op| op.id != id);
            entries.len() != before
        })
    }

    /// Drop every entry. Administrative use only.
    pub fn clear(&self) -> Result<(), SyncError> {
        self.store.remove(QUEUE_KEY)?;
        self.len_tx.send_replace(0);
        Ok(())
    }

    pub fn len(&self) -> Result<usize, SyncError> {
        Ok(self.read()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, SyncError> {
        Ok(self.len()? == 0)
    }

    /// Whether any queued operation targets this entity.
    pub fn has_pending_for(
        &self,
        collection: Collection,
        entity_id: &str,
    ) -> Result<bool, SyncError> {
        Ok(self
            .read()?
            .iter()
            .any(|op| op.collection == collection && op.entity_id().as_deref() == Some(entity_id)))
    }

    /// Queue length as last written. Updated on every change.
    pub fn watch_len(&self) -> watch::Receiver<usize> {
        self.len_tx.subscribe()
    }

    fn read(&self) -> Result<Vec<QueuedOperation>, SyncError> {
        let entries = read_versioned(self.store.as_ref(), QUEUE_KEY, QUEUE_FORMAT_VERSION)?;
        Ok(entries.unwrap_or_default())
    }

    /// Apply `change` to the persisted array in one atomic step. `change`
    /// returns whether it modified anything; untouched arrays are not rewritten.
    fn modify(
        &self,
        mut change: impl FnMut(&mut Vec<QueuedOperation>) -> bool,
    ) -> Result<(), SyncError> {
        let mut len = None;
        self.store.update(QUEUE_KEY, &mut |raw| {
            let mut entries: Vec<QueuedOperation> = match raw {
                Some(raw) => decode_versioned(QUEUE_KEY, &raw, QUEUE_FORMAT_VERSION)?,
                None => Vec::new(),
            };
            let changed = change(&mut entries);
            len = Some(entries.len());
            if !changed {
                return Ok(None);
            }
            encode_versioned(QUEUE_FORMAT_VERSION, &entries).map(Some)
        })?;
        if let Some(len) = len {
            self.len_tx.send_replace(len);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, SqliteStore, UpdateFn};
    use serde_json::json;

    struct ReadOnlyStore(MemoryStore);

    impl LocalStore for ReadOnlyStore {
        fn get(&self, key: &str) -> Result<Option<String>, SyncError> {
            self.0.get(key)
        }
        fn set(&self, _key: &str, _value: &str) -> Result<(), SyncError> {
            Err(SyncError::Sqlite(rusqlite::Error::QueryReturnedNoRows))
        }
        fn remove(&self, _key: &str) -> Result<(), SyncError> {
            Err(SyncError::Sqlite(rusqlite::Error::QueryReturnedNoRows))
        }
        fn update(&self, _key: &str, _f: &mut UpdateFn<'_>) -> Result<(), SyncError> {
            Err(SyncError::Sqlite(rusqlite::Error::QueryReturnedNoRows))
        }
    }

    fn task_op(kind: OpType, id: &str) -> PendingOperation {
        PendingOperation::new(kind, Collection::Tasks, json!({"id": id, "title": id}))
    }

    #[test]
    fn enqueue_assigns_unique_ids_and_keeps_order() {
        let log = OperationLog::open(Arc::new(MemoryStore::new())).unwrap();
        let a = log.enqueue(task_op(OpType::Insert, "a")).unwrap();
        let b = log.enqueue(task_op(OpType::Update, "a")).unwrap();
        let c = log.enqueue(task_op(OpType::Delete, "a")).unwrap();
        assert_ne!(a.id, b.id);
        assert!(a.enqueued_at <= b.enqueued_at);

        let ids: Vec<_> = log.list_all().unwrap().into_iter().map(|op| op.id).collect();
        assert_eq!(ids, vec![a.id, b.id, c.id]);
        assert_eq!(*log.watch_len().borrow(), 3);
    }

    #[test]
    fn remove_is_idempotent() {
        let log = OperationLog::open(Arc::new(MemoryStore::new())).unwrap();
        let a = log.enqueue(task_op(OpType::Insert, "a")).unwrap();
        log.remove(&a.id).unwrap();
        log.remove(&a.id).unwrap();
        log.remove("never-queued").unwrap();
        assert!(log.is_empty().unwrap());
    }

    #[test]
    fn updates_and_deletes_require_an_entity_id() {
        let log = OperationLog::open(Arc::new(MemoryStore::new())).unwrap();
        let err = log
            .enqueue(PendingOperation::new(
                OpType::Update,
                Collection::Tasks,
                json!({"title": "x"}),
            ))
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidOperation(_)));
        assert!(log.is_empty().unwrap());
    }

    #[test]
    fn survives_restart_with_exactly_the_unremoved_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let kept = {
            let log = OperationLog::open(Arc::new(SqliteStore::open(&path).unwrap())).unwrap();
            let a = log.enqueue(task_op(OpType::Insert, "a")).unwrap();
            let b = log.enqueue(task_op(OpType::Insert, "b")).unwrap();
            let c = log.enqueue(task_op(OpType::Update, "a")).unwrap();
            log.remove(&b.id).unwrap();
            vec![a, c]
        };

        let reopened = OperationLog::open(Arc::new(SqliteStore::open(&path).unwrap())).unwrap();
        assert_eq!(reopened.list_all().unwrap(), kept);
        assert_eq!(*reopened.watch_len().borrow(), 2);
    }

    #[test]
    fn write_failures_propagate() {
        let log = OperationLog::open(Arc::new(ReadOnlyStore(MemoryStore::new()))).unwrap();
        let err = log.enqueue(task_op(OpType::Insert, "a")).unwrap_err();
        assert!(err.is_storage_failure());
    }

    #[test]
    fn corrupted_queue_is_surfaced() {
        let store = Arc::new(MemoryStore::new());
        store.set(QUEUE_KEY, "not json").unwrap();
        assert!(matches!(
            OperationLog::open(store),
            Err(SyncError::Corrupted { .. })
        ));
    }

    #[test]
    fn two_handles_on_one_file_keep_every_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.db");
        let first = OperationLog::open(Arc::new(SqliteStore::open(&path).unwrap())).unwrap();
        let second = OperationLog::open(Arc::new(SqliteStore::open(&path).unwrap())).unwrap();

        std::thread::scope(|s| {
            for (log, prefix) in [(&first, "a"), (&second, "b")] {
                s.spawn(move || {
                    for i in 0..100 {
                        log.enqueue(task_op(OpType::Insert, &format!("{prefix}{i}"))).unwrap();
                    }
                });
            }
        });

        let entries = first.list_all().unwrap();
        assert_eq!(entries.len(), 200);
        // Each handle's own entries stay in the order it queued them.
        let from_b: Vec<_> = entries
            .iter()
            .filter_map(|op| op.entity_id())
            .filter(|id| id.starts_with('b'))
            .collect();
        let expected: Vec<_> = (0..100).map(|i| format!("b{i}")).collect();
        assert_eq!(from_b, expected);
    }

    #[test]
    fn tracks_pending_entities() {
        let log = OperationLog::open(Arc::new(MemoryStore::new())).unwrap();
        log.enqueue(task_op(OpType::Update, "a")).unwrap();
        assert!(log.has_pending_for(Collection::Tasks, "a").unwrap());
        assert!(!log.has_pending_for(Collection::Jobs, "a").unwrap());
        log.clear().unwrap();
        assert!(!log.has_pending_for(Collection::Tasks, "a").unwrap());
        assert_eq!(*log.watch_len().borrow(), 0);
    }
}
