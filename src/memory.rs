//! In-process [`RemoteStore`] for tests and local demos.
//!
//! Rows live in memory, every call is recorded, and failures can be
//! injected per entity or globally. Writes push change events to
//! subscribers the way a hosted backend would.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::audit::AuditEntry;
use crate::error::RemoteError;
use crate::merge::merge_fields;
use crate::model::{Collection, OpType, OrderBy, record_id};
use crate::remote::{ChangeEvent, ChangeHandler, RemoteStore, Subscription, TransportEvent};

#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCall {
    Fetch(Collection),
    Insert(Collection, Value),
    Update(Collection, String, Value),
    Delete(Collection, String),
    Subscribe(Collection),
}

#[derive(Default)]
struct State {
    tables: HashMap<Collection, Vec<Value>>,
    calls: Vec<RemoteCall>,
    audit: Vec<AuditEntry>,
    failing_ids: HashSet<String>,
    stalled_ids: HashSet<String>,
    subscribers: HashMap<Collection, Vec<(u64, ChangeHandler)>>,
}

pub struct MemoryRemote {
    state: Arc<Mutex<State>>,
    reachable: AtomicBool,
    stall_fetches: AtomicBool,
    actor_id: Mutex<Option<String>>,
    next_subscriber: AtomicU64,
    transport: broadcast::Sender<TransportEvent>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        let (transport, _) = broadcast::channel(8);
        Self {
            state: Arc::new(Mutex::new(State::default())),
            reachable: AtomicBool::new(true),
            stall_fetches: AtomicBool::new(false),
            actor_id: Mutex::new(None),
            next_subscriber: AtomicU64::new(1),
            transport,
        }
    }

    /// Replace the server-side rows of a collection.
    pub fn seed(&self, collection: Collection, rows: Vec<Value>) {
        self.lock().tables.insert(collection, rows);
    }

    pub fn rows(&self, collection: Collection) -> Vec<Value> {
        self.lock().tables.get(&collection).cloned().unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.lock().calls.clone()
    }

    /// Recorded write calls only (inserts, updates, deletes).
    pub fn writes(&self) -> Vec<RemoteCall> {
        self.calls()
            .into_iter()
            .filter(|c| {
                matches!(
                    c,
                    RemoteCall::Insert(..) | RemoteCall::Update(..) | RemoteCall::Delete(..)
                )
            })
            .collect()
    }

    pub fn audit_entries(&self) -> Vec<AuditEntry> {
        self.lock().audit.clone()
    }

    /// While unreachable, every call fails with a transport error.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Make writes touching this entity id fail.
    pub fn fail_writes_for(&self, id: &str) {
        self.lock().failing_ids.insert(id.to_string());
    }

    pub fn clear_failures(&self) {
        self.lock().failing_ids.clear();
    }

    /// Writes touching this entity id are recorded and then never resolve.
    pub fn stall_writes_for(&self, id: &str) {
        self.lock().stalled_ids.insert(id.to_string());
    }

    /// Fetches never resolve while set.
    pub fn stall_fetches(&self, stall: bool) {
        self.stall_fetches.store(stall, Ordering::SeqCst);
    }

    /// Actor stamped onto events produced by this handle's writes.
    pub fn act_as(&self, actor_id: Option<&str>) {
        if let Ok(mut actor) = self.actor_id.lock() {
            *actor = actor_id.map(str::to_string);
        }
    }

    pub fn subscriber_count(&self, collection: Collection) -> usize {
        self.lock().subscribers.get(&collection).map_or(0, Vec::len)
    }

    /// Deliver an event to current subscribers, as if another client wrote it.
    pub fn push(&self, event: ChangeEvent) {
        let handlers: Vec<ChangeHandler> = self
            .lock()
            .subscribers
            .get(&event.collection)
            .map(|subs| subs.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();
        for handler in handlers {
            handler(event.clone());
        }
    }

    /// Simulate a dropped push connection coming back: server-side
    /// subscriptions are lost and a `Connected` signal is emitted.
    pub fn reconnect(&self) {
        self.lock().subscribers.clear();
        let _ = self.transport.send(TransportEvent::Disconnected);
        let _ = self.transport.send(TransportEvent::Connected);
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panicking test thread must not wedge the remaining assertions.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_reachable(&self) -> Result<(), RemoteError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RemoteError::Transport("network unreachable".into()))
        }
    }

    async fn check_write(&self, id: Option<&str>) -> Result<(), RemoteError> {
        let stalled = id.is_some_and(|id| self.lock().stalled_ids.contains(id));
        if stalled {
            std::future::pending::<()>().await;
        }
        self.check_reachable()?;
        match id {
            Some(id) if self.lock().failing_ids.contains(id) => {
                Err(RemoteError::Rejected(format!("write to {id} rejected")))
            }
            _ => Ok(()),
        }
    }

    fn emit(&self, collection: Collection, kind: OpType, record: Value) {
        let actor_id = self.actor_id.lock().ok().and_then(|a| a.clone());
        self.push(ChangeEvent { collection, kind, record, actor_id });
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn fetch(
        &self,
        collection: Collection,
        order: OrderBy,
    ) -> Result<Vec<Value>, RemoteError> {
        self.lock().calls.push(RemoteCall::Fetch(collection));
        if self.stall_fetches.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.check_reachable()?;
        let mut rows = self.rows(collection);
        rows.sort_by(|a, b| {
            let key = |v: &Value| v.get(order.column).map(|c| c.to_string()).unwrap_or_default();
            let ord = key(a).cmp(&key(b));
            if order.ascending { ord } else { ord.reverse() }
        });
        Ok(rows)
    }

    async fn insert(&self, collection: Collection, record: &Value) -> Result<(), RemoteError> {
        let id = record_id(record);
        self.lock().calls.push(RemoteCall::Insert(collection, record.clone()));
        self.check_write(id.as_deref()).await?;
        {
            let mut state = self.lock();
            let rows = state.tables.entry(collection).or_default();
            if id.is_some() && rows.iter().any(|r| record_id(r) == id) {
                return Err(RemoteError::Rejected(format!(
                    "duplicate key {} in {collection}",
                    id.unwrap_or_default()
                )));
            }
            rows.push(record.clone());
        }
        self.emit(collection, OpType::Insert, record.clone());
        Ok(())
    }

    async fn update(
        &self,
        collection: Collection,
        id: &str,
        patch: &Value,
    ) -> Result<(), RemoteError> {
        self.lock().calls.push(RemoteCall::Update(collection, id.to_string(), patch.clone()));
        self.check_write(Some(id)).await?;
        let updated = {
            let mut state = self.lock();
            let rows = state.tables.entry(collection).or_default();
            rows.iter_mut().find(|r| record_id(r).as_deref() == Some(id)).map(|row| {
                *row = merge_fields(row, patch);
                row.clone()
            })
        };
        // Updating a missing row matches zero rows and is not an error.
        if let Some(row) = updated {
            self.emit(collection, OpType::Update, row);
        }
        Ok(())
    }

    async fn delete(&self, collection: Collection, id: &str) -> Result<(), RemoteError> {
        self.lock().calls.push(RemoteCall::Delete(collection, id.to_string()));
        self.check_write(Some(id)).await?;
        let removed = {
            let mut state = self.lock();
            let rows = state.tables.entry(collection).or_default();
            let before = rows.len();
            rows.retain(|r| record_id(r).as_deref() != Some(id));
            before != rows.len()
        };
        if removed {
            self.emit(collection, OpType::Delete, serde_json::json!({ "id": id }));
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        collection: Collection,
        handler: ChangeHandler,
    ) -> Result<Subscription, RemoteError> {
        self.lock().calls.push(RemoteCall::Subscribe(collection));
        self.check_reachable()?;
        let key = self.next_subscriber.fetch_add(1, Ordering::SeqCst);
        self.lock().subscribers.entry(collection).or_default().push((key, handler));

        let state = Arc::clone(&self.state);
        Ok(Subscription::new(collection, move || {
            let mut state = state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(subs) = state.subscribers.get_mut(&collection) {
                subs.retain(|(k, _)| *k != key);
            }
        }))
    }

    fn transport_events(&self) -> Option<broadcast::Receiver<TransportEvent>> {
        Some(self.transport.subscribe())
    }

    async fn record_audit(&self, entry: &AuditEntry) -> Result<(), RemoteError> {
        self.check_reachable()?;
        self.lock().audit.push(entry.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn writes_are_recorded_and_echoed_to_subscribers() {
        let remote = MemoryRemote::new();
        remote.act_as(Some("user-1"));
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let sub = remote
            .subscribe(Collection::Tasks, Arc::new(move |event: ChangeEvent| {
                assert_eq!(event.actor_id.as_deref(), Some("user-1"));
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .await
            .unwrap();

        remote.insert(Collection::Tasks, &json!({"id": "t1", "status": "pending"})).await.unwrap();
        remote.update(Collection::Tasks, "t1", &json!({"status": "completed"})).await.unwrap();
        remote.delete(Collection::Tasks, "t1").await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 3);
        assert_eq!(remote.writes().len(), 3);

        sub.unsubscribe();
        assert_eq!(remote.subscriber_count(Collection::Tasks), 0);
    }

    #[tokio::test]
    async fn duplicate_inserts_are_rejected() {
        let remote = MemoryRemote::new();
        remote.insert(Collection::Tasks, &json!({"id": "t1"})).await.unwrap();
        assert!(matches!(
            remote.insert(Collection::Tasks, &json!({"id": "t1"})).await,
            Err(RemoteError::Rejected(_))
        ));
        assert_eq!(remote.rows(Collection::Tasks).len(), 1);
    }

    #[tokio::test]
    async fn fetch_honours_sort_order() {
        let remote = MemoryRemote::new();
        remote.seed(
            Collection::TeamMembers,
            vec![json!({"id": "2", "name": "Zoe"}), json!({"id": "1", "name": "Ada"})],
        );
        let order = Collection::TeamMembers.order_by();
        let rows = remote.fetch(Collection::TeamMembers, order).await.unwrap();
        assert_eq!(rows[0]["name"], json!("Ada"));
    }
}
