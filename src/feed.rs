use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::model::{Collection, OpType};
use crate::remote::{ChangeEvent, ChangeHandler, RemoteStore, Subscription, TransportEvent};
use crate::store::EntityStore;
use crate::sync::{Notification, SyncEvent};

/// What happened to one pushed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedOutcome {
    /// Merged into the store.
    Applied,
    /// Our own write echoed back; the optimistic copy already showed it.
    SuppressedEcho,
    /// Already reflected in the store.
    Unchanged,
}

/// Folds server-pushed changes into the entity store.
pub struct ChangeFeedListener {
    remote: Arc<dyn RemoteStore>,
    store: Arc<EntityStore>,
    actor_id: String,
    events: broadcast::Sender<SyncEvent>,
    subscriptions: Mutex<HashMap<Collection, Subscription>>,
    inbox: mpsc::UnboundedSender<ChangeEvent>,
    outbox: Mutex<Option<mpsc::UnboundedReceiver<ChangeEvent>>>,
}

impl ChangeFeedListener {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        store: Arc<EntityStore>,
        actor_id: impl Into<String>,
        events: broadcast::Sender<SyncEvent>,
    ) -> Self {
        let (inbox, outbox) = mpsc::unbounded_channel();
        Self {
            remote,
            store,
            actor_id: actor_id.into(),
            events,
            subscriptions: Mutex::new(HashMap::new()),
            inbox,
            outbox: Mutex::new(Some(outbox)),
        }
    }

    /// Spawn delivery and subscribe to every synced collection. Events are
    /// applied one at a time in arrival order until `cancel` fires, at which
    /// point every subscription is released.
    pub async fn start(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> Result<Vec<JoinHandle<()>>, SyncError> {
        let mut outbox = self
            .outbox
            .lock()
            .map_err(|_| SyncError::State("feed outbox lock poisoned"))?
            .take()
            .ok_or(SyncError::State("change feed already started"))?;

        let mut handles = Vec::with_capacity(2);
        let listener = Arc::clone(self);
        let token = cancel.clone();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    Some(event) = outbox.recv() => {
                        if let Err(e) = listener.handle_event(&event) {
                            warn!(
                                collection = %event.collection,
                                error = %e,
                                "dropping undeliverable change event"
                            );
                        }
                    }
                }
            }
            listener.stop();
            debug!("change feed delivery stopped");
        }));

        if let Some(mut transport) = self.remote.transport_events() {
            let listener = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        event = transport.recv() => match event {
                            Ok(TransportEvent::Connected) => {
                                info!("push transport reconnected; resubscribing");
                                if let Err(e) = listener.subscribe_all().await {
                                    warn!(error = %e, "resubscribe failed");
                                }
                            }
                            Ok(TransportEvent::Disconnected) => {
                                debug!("push transport disconnected")
                            }
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!(skipped, "missed transport events; resubscribing");
                                if let Err(e) = listener.subscribe_all().await {
                                    warn!(error = %e, "resubscribe failed");
                                }
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }));
        }

        // Without a subscription the feed waits for the next transport
        // `Connected` signal; reads and writes keep working meanwhile.
        if let Err(e) = self.subscribe_all().await {
            warn!(error = %e, "initial change feed subscription failed");
        }
        Ok(handles)
    }

    /// (Re)establish one subscription per synced collection. Any previous
    /// handle for a collection is released first, so handlers never double up.
    pub async fn subscribe_all(&self) -> Result<(), SyncError> {
        for collection in Collection::SYNCED {
            let previous = self.lock_subscriptions()?.remove(&collection);
            if let Some(previous) = previous {
                previous.unsubscribe();
            }
            let inbox = self.inbox.clone();
            let handler: ChangeHandler = Arc::new(move |event: ChangeEvent| {
                // The receiver only goes away at teardown.
                let _ = inbox.send(event);
            });
            let subscription = self.remote.subscribe(collection, handler).await?;
            self.lock_subscriptions()?.insert(collection, subscription);
        }
        Ok(())
    }

    /// Release every subscription.
    pub fn stop(&self) {
        let drained: Vec<Subscription> = match self.subscriptions.lock() {
            Ok(mut subs) => subs.drain().map(|(_, s)| s).collect(),
            Err(poisoned) => poisoned.into_inner().drain().map(|(_, s)| s).collect(),
        };
        for subscription in drained {
            subscription.unsubscribe();
        }
    }

    pub fn active_subscriptions(&self) -> usize {
        self.subscriptions.lock().map_or(0, |subs| subs.len())
    }

    /// Merge one event into the store, suppressing echoes of our own writes.
    pub fn handle_event(&self, event: &ChangeEvent) -> Result<FeedOutcome, SyncError> {
        let mutation = event.to_mutation()?;
        let own = event.actor_id.as_deref() == Some(self.actor_id.as_str());

        if own && self.store.reflects(event.collection, &mutation)? {
            if let Some(id) = mutation.entity_id() {
                self.store.mark_confirmed(event.collection, &id)?;
            }
            debug!(
                collection = %event.collection,
                entity_id = ?event.entity_id(),
                "suppressed own echo"
            );
            return Ok(FeedOutcome::SuppressedEcho);
        }

        if !self.store.apply_remote_mutation(event.collection, &mutation)? {
            return Ok(FeedOutcome::Unchanged);
        }
        if !own {
            let _ = self.events.send(SyncEvent::Notification(remote_change_notice(event)));
        }
        Ok(FeedOutcome::Applied)
    }

    fn lock_subscriptions(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<Collection, Subscription>>, SyncError> {
        self.subscriptions.lock().map_err(|_| SyncError::State("feed subscription lock poisoned"))
    }
}

impl Drop for ChangeFeedListener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn remote_change_notice(event: &ChangeEvent) -> Notification {
    let noun = event.collection.display_name();
    let label = event
        .record
        .get("name")
        .or_else(|| event.record.get("title"))
        .and_then(|v| v.as_str())
        .unwrap_or("Untitled");
    match (event.kind, event.collection) {
        (OpType::Insert, Collection::TeamMembers) => {
            Notification::info("New Team Member", format!("{label} joined"))
        }
        (OpType::Insert, Collection::Tasks) => Notification::info("New Task Added", label),
        (OpType::Update, Collection::Tasks) => Notification::info("Task Updated", label),
        (OpType::Insert, _) => {
            Notification::info(format!("New {noun} Added"), format!("{label} was added"))
        }
        (OpType::Update, _) => {
            Notification::info(format!("{noun} Updated"), format!("{label} was updated"))
        }
        (OpType::Delete, Collection::TeamMembers) => {
            Notification::info("Team Member Removed", "A team member was removed")
        }
        (OpType::Delete, _) => Notification::info(
            format!("{noun} Deleted"),
            format!("A {} was deleted", noun.to_lowercase()),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRemote;
    use crate::store::{Mutation, SyncState};
    use serde_json::json;
    use std::time::Duration;

    type Fixture = (
        Arc<MemoryRemote>,
        Arc<EntityStore>,
        Arc<ChangeFeedListener>,
        broadcast::Receiver<SyncEvent>,
    );

    fn setup() -> Fixture {
        let remote = Arc::new(MemoryRemote::new());
        let store = Arc::new(EntityStore::new());
        let (events, rx) = broadcast::channel(16);
        let listener =
            Arc::new(ChangeFeedListener::new(remote.clone(), store.clone(), "me", events));
        (remote, store, listener, rx)
    }

    fn event(kind: OpType, record: serde_json::Value, actor: &str) -> ChangeEvent {
        ChangeEvent { collection: Collection::Tasks, kind, record, actor_id: Some(actor.into()) }
    }

    #[test]
    fn own_echo_is_suppressed_without_notification() {
        let (_, store, listener, mut rx) = setup();
        store
            .apply_local_mutation(
                Collection::Tasks,
                &Mutation::Insert(json!({"id": "t", "title": "T", "status": "pending"})),
            )
            .unwrap();
        store
            .apply_local_mutation(
                Collection::Tasks,
                &Mutation::Update { id: "t".into(), patch: json!({"status": "completed"}) },
            )
            .unwrap();
        let before = store.snapshot(Collection::Tasks).unwrap();

        let echo =
            event(OpType::Update, json!({"id": "t", "title": "T", "status": "completed"}), "me");
        assert_eq!(listener.handle_event(&echo).unwrap(), FeedOutcome::SuppressedEcho);

        let after = store.snapshot(Collection::Tasks).unwrap();
        assert_eq!(after[0].record, before[0].record);
        assert_eq!(after[0].state, SyncState::Confirmed);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn foreign_changes_apply_and_notify_once() {
        let (_, store, listener, mut rx) = setup();
        let insert = event(OpType::Insert, json!({"id": "t", "title": "Pre-Scan"}), "someone-else");
        assert_eq!(listener.handle_event(&insert).unwrap(), FeedOutcome::Applied);
        assert_eq!(listener.handle_event(&insert).unwrap(), FeedOutcome::Unchanged);
        assert_eq!(store.snapshot(Collection::Tasks).unwrap().len(), 1);

        let Ok(SyncEvent::Notification(n)) = rx.try_recv() else {
            panic!("expected a notification")
        };
        assert_eq!((n.title.as_str(), n.body.as_str()), ("New Task Added", "Pre-Scan"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn own_event_with_server_fields_is_applied_quietly() {
        let (_, store, listener, mut rx) = setup();
        store
            .apply_local_mutation(Collection::Tasks, &Mutation::Insert(json!({"id": "t"})))
            .unwrap();
        let echo =
            event(OpType::Insert, json!({"id": "t", "created_at": "2025-01-01T00:00:00Z"}), "me");
        assert_eq!(listener.handle_event(&echo).unwrap(), FeedOutcome::Applied);
        let stored = store.get(Collection::Tasks, "t").unwrap().unwrap();
        assert!(stored.record.get("created_at").is_some());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn resubscribes_on_reconnect_without_duplicate_handlers() {
        let (remote, store, listener, _rx) = setup();
        let cancel = CancellationToken::new();
        let handles = listener.start(cancel.clone()).await.unwrap();
        assert_eq!(remote.subscriber_count(Collection::Tasks), 1);

        remote.reconnect();
        for _ in 0..50 {
            if remote.subscriber_count(Collection::Tasks) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(remote.subscriber_count(Collection::Tasks), 1);

        remote.push(event(OpType::Insert, json!({"id": "x", "title": "X"}), "other"));
        for _ in 0..50 {
            if !store.is_empty(Collection::Tasks).unwrap() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.snapshot(Collection::Tasks).unwrap().len(), 1);

        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
        for collection in Collection::SYNCED {
            assert_eq!(remote.subscriber_count(collection), 0);
        }
    }

    #[tokio::test]
    async fn cannot_start_twice() {
        let (_, _, listener, _rx) = setup();
        let cancel = CancellationToken::new();
        listener.start(cancel.clone()).await.unwrap();
        assert!(matches!(listener.start(cancel.clone()).await, Err(SyncError::State(_))));
        cancel.cancel();
    }
}
