use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;

use crate::error::SyncError;
use crate::merge::{merge_fields, reflects};
use crate::model::{Collection, Entity, OpType, record_id};

/// Whether a resident entity matches the last known remote state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Confirmed,
    Pending,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntity {
    pub record: Value,
    pub state: SyncState,
}

impl StoredEntity {
    pub fn id(&self) -> Option<String> {
        record_id(&self.record)
    }
}

/// A change to one entity, from either side.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Insert(Value),
    Update { id: String, patch: Value },
    Delete { id: String },
}

impl Mutation {
    pub fn kind(&self) -> OpType {
        match self {
            Mutation::Insert(_) => OpType::Insert,
            Mutation::Update { .. } => OpType::Update,
            Mutation::Delete { .. } => OpType::Delete,
        }
    }

    pub fn entity_id(&self) -> Option<String> {
        match self {
            Mutation::Insert(record) => record_id(record),
            Mutation::Update { id, .. } | Mutation::Delete { id } => Some(id.clone()),
        }
    }

    /// Rebuild a mutation from entity-shaped data carrying its id.
    pub fn from_payload(kind: OpType, payload: Value) -> Result<Self, SyncError> {
        if kind == OpType::Insert {
            return Ok(Mutation::Insert(payload));
        }
        let id = record_id(&payload)
            .ok_or_else(|| {
                SyncError::InvalidOperation(format!("{} payload without id", kind.as_str()))
            })?;
        Ok(match kind {
            OpType::Update => Mutation::Update { id, patch: payload },
            _ => Mutation::Delete { id },
        })
    }

    /// Entity-shaped payload as queued: full row, patch with id, or bare id.
    pub fn to_payload(&self) -> Value {
        match self {
            Mutation::Insert(record) => record.clone(),
            Mutation::Update { id, patch } => {
                merge_fields(&serde_json::json!({ "id": id }), patch)
            }
            Mutation::Delete { id } => serde_json::json!({ "id": id }),
        }
    }
}

type Rows = HashMap<Collection, Vec<StoredEntity>>;

/// In-memory cache of every collection, the only owner of resident entities.
pub struct EntityStore {
    collections: RwLock<Rows>,
    revision: watch::Sender<u64>,
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityStore {
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Self { collections: RwLock::new(HashMap::new()), revision }
    }

    /// Apply a locally originated change ahead of remote confirmation.
    /// Returns whether the snapshot changed.
    pub fn apply_local_mutation(
        &self,
        collection: Collection,
        mutation: &Mutation,
    ) -> Result<bool, SyncError> {
        self.apply(collection, mutation, SyncState::Pending)
    }

    /// Apply a change pushed by the server. Applying the same event twice is a no-op.
    pub fn apply_remote_mutation(
        &self,
        collection: Collection,
        mutation: &Mutation,
    ) -> Result<bool, SyncError> {
        self.apply(collection, mutation, SyncState::Confirmed)
    }

    /// Swap in a full snapshot; every entity becomes confirmed.
    pub fn replace_collection(
        &self,
        collection: Collection,
        records: Vec<Value>,
    ) -> Result<(), SyncError> {
        let entities = records
            .into_iter()
            .map(|record| StoredEntity { record, state: SyncState::Confirmed })
            .collect();
        self.write()?.insert(collection, entities);
        self.bump();
        Ok(())
    }

    /// Flag an entity as matching remote state.
    pub fn mark_confirmed(&self, collection: Collection, id: &str) -> Result<bool, SyncError> {
        let mut guard = self.write()?;
        let Some(entity) = guard
            .get_mut(&collection)
            .and_then(|rows| rows.iter_mut().find(|e| e.id().as_deref() == Some(id)))
        else {
            return Ok(false);
        };
        if entity.state == SyncState::Confirmed {
            return Ok(false);
        }
        entity.state = SyncState::Confirmed;
        drop(guard);
        self.bump();
        Ok(true)
    }

    /// Whether the resident snapshot already shows the effect of `mutation`.
    pub fn reflects(&self, collection: Collection, mutation: &Mutation) -> Result<bool, SyncError> {
        let current = self.get(collection, mutation.entity_id().as_deref().unwrap_or_default())?;
        Ok(match (mutation, current) {
            (Mutation::Delete { .. }, current) => current.is_none(),
            (Mutation::Insert(incoming), Some(current)) => reflects(&current.record, incoming),
            (Mutation::Update { patch, .. }, Some(current)) => reflects(&current.record, patch),
            (_, None) => false,
        })
    }

    pub fn get(&self, collection: Collection, id: &str) -> Result<Option<StoredEntity>, SyncError> {
        Ok(self
            .read()?
            .get(&collection)
            .and_then(|rows| rows.iter().find(|e| e.id().as_deref() == Some(id)).cloned()))
    }

    pub fn snapshot(&self, collection: Collection) -> Result<Vec<StoredEntity>, SyncError> {
        Ok(self.read()?.get(&collection).cloned().unwrap_or_default())
    }

    pub fn records(&self, collection: Collection) -> Result<Vec<Value>, SyncError> {
        Ok(self.snapshot(collection)?.into_iter().map(|e| e.record).collect())
    }

    pub fn is_empty(&self, collection: Collection) -> Result<bool, SyncError> {
        Ok(self.read()?.get(&collection).is_none_or(|rows| rows.is_empty()))
    }

    /// Typed view of a collection. Rows that do not decode are skipped.
    pub fn list<E: Entity>(&self) -> Result<Vec<E>, SyncError> {
        Ok(self
            .snapshot(E::COLLECTION)?
            .iter()
            .filter_map(|e| match E::from_record(&e.record) {
                Ok(entity) => Some(entity),
                Err(err) => {
                    tracing::warn!(
                        collection = %E::COLLECTION,
                        error = %err,
                        "skipping undecodable row"
                    );
                    None
                }
            })
            .collect())
    }

    /// Bumped on every change; readers re-query the snapshot.
    pub fn watch_revision(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    fn apply(
        &self,
        collection: Collection,
        mutation: &Mutation,
        state: SyncState,
    ) -> Result<bool, SyncError> {
        let id = mutation
            .entity_id()
            .ok_or_else(|| {
                let kind = mutation.kind().as_str();
                SyncError::InvalidOperation(format!("{kind} on {collection} without id"))
            })?;

        let mut guard = self.write()?;
        let rows = guard.entry(collection).or_default();
        let position = rows.iter().position(|e| e.id().as_deref() == Some(id.as_str()));

        let changed = match (mutation, position) {
            (Mutation::Insert(record), Some(i))
            | (Mutation::Update { patch: record, .. }, Some(i)) => {
                let entity = &mut rows[i];
                let merged = merge_fields(&entity.record, record);
                let changed = merged != entity.record || entity.state != state;
                entity.record = merged;
                entity.state = state;
                changed
            }
            (Mutation::Insert(record), None) => {
                let entity = StoredEntity { record: record.clone(), state };
                if collection.inserts_at_front() {
                    rows.insert(0, entity);
                } else {
                    rows.push(entity);
                }
                true
            }
            (Mutation::Update { patch, .. }, None) => {
                // Local updates to unknown rows have nothing to patch. A remote
                // update carries the full row, so it is resident from now on.
                if state == SyncState::Pending {
                    false
                } else {
                    rows.push(StoredEntity { record: patch.clone(), state });
                    true
                }
            }
            (Mutation::Delete { .. }, Some(i)) => {
                rows.remove(i);
                true
            }
            (Mutation::Delete { .. }, None) => false,
        };
        drop(guard);

        if changed {
            self.bump();
        }
        Ok(changed)
    }

    fn bump(&self) {
        self.revision.send_modify(|rev| *rev += 1);
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Rows>, SyncError> {
        self.collections.read().map_err(|_| SyncError::State("entity store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Rows>, SyncError> {
        self.collections.write().map_err(|_| SyncError::State("entity store lock poisoned"))
    }
}
