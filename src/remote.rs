use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::audit::AuditEntry;
use crate::error::{RemoteError, SyncError};
use crate::model::{Collection, OpType, OrderBy, record_id};
use crate::store::Mutation;

/// A change pushed by the server for one collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub collection: Collection,
    pub kind: OpType,
    /// New row for inserts and updates, old row (at least the id) for deletes.
    pub record: Value,
    /// Actor whose write produced this event, when the backend reports one.
    pub actor_id: Option<String>,
}

impl ChangeEvent {
    pub fn entity_id(&self) -> Option<String> {
        record_id(&self.record)
    }

    pub fn to_mutation(&self) -> Result<Mutation, SyncError> {
        Mutation::from_payload(self.kind, self.record.clone())
    }
}

pub type ChangeHandler = Arc<dyn Fn(ChangeEvent) + Send + Sync>;

/// Transport lifecycle signals from the push channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    /// A fresh connection; earlier subscriptions may be gone.
    Connected,
    Disconnected,
}

/// Handle returned by [`RemoteStore::subscribe`]. Dropping it unsubscribes.
pub struct Subscription {
    collection: Collection,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(collection: Collection, cancel: impl FnOnce() + Send + 'static) -> Self {
        Self { collection, cancel: Some(Box::new(cancel)) }
    }

    pub fn collection(&self) -> Collection {
        self.collection
    }

    pub fn unsubscribe(mut self) {
        self.cancel_now();
    }

    fn cancel_now(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("collection", &self.collection)
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// The managed backend, reduced to what the sync core needs.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn fetch(&self, collection: Collection, order: OrderBy)
    -> Result<Vec<Value>, RemoteError>;

    async fn insert(&self, collection: Collection, record: &Value) -> Result<(), RemoteError>;

    async fn update(&self, collection: Collection, id: &str, patch: &Value)
    -> Result<(), RemoteError>;

    async fn delete(&self, collection: Collection, id: &str) -> Result<(), RemoteError>;

    async fn subscribe(
        &self,
        collection: Collection,
        handler: ChangeHandler,
    ) -> Result<Subscription, RemoteError>;

    /// Connection lifecycle of the push transport, if the backend exposes one.
    fn transport_events(&self) -> Option<broadcast::Receiver<TransportEvent>> {
        None
    }

    async fn record_audit(&self, _entry: &AuditEntry) -> Result<(), RemoteError> {
        Ok(())
    }
}

/// Issue the remote call matching a mutation.
pub(crate) async fn dispatch(
    remote: &dyn RemoteStore,
    collection: Collection,
    mutation: &Mutation,
) -> Result<(), RemoteError> {
    match mutation {
        Mutation::Insert(record) => remote.insert(collection, record).await,
        Mutation::Update { id, patch } => remote.update(collection, id, patch).await,
        Mutation::Delete { id } => remote.delete(collection, id).await,
    }
}
