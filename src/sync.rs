use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::audit::Auditor;
use crate::cache::SnapshotCache;
use crate::config::SyncConfig;
use crate::connectivity::{Connectivity, ConnectivityMonitor, ReachabilityProbe};
use crate::error::{RemoteError, Result, SyncError};
use crate::feed::ChangeFeedListener;
use crate::model::{Collection, Entity, NewTask, OpType, Task, TaskPatch, new_id, record_id};
use crate::oplog::{OperationLog, PendingOperation, QueuedOperation};
use crate::reconciler::{ReconcileOutcome, ReconcileReport, Reconciler};
use crate::remote::{RemoteStore, dispatch};
use crate::storage::{LocalStore, MemoryStore, SqliteStore};
use crate::store::{EntityStore, Mutation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Success,
    Error,
}

/// A user-facing toast. Soft by default; only local storage failures are errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub severity: Severity,
}

impl Notification {
    pub fn info(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self { title: title.into(), body: body.into(), severity: Severity::Info }
    }

    pub fn success(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self { title: title.into(), body: body.into(), severity: Severity::Success }
    }

    pub fn error(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self { title: title.into(), body: body.into(), severity: Severity::Error }
    }
}

/// Everything the presentation layer may want to react to.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    ConnectivityChanged { state: Connectivity },
    Notification(Notification),
    ReconcileStarted { pending: usize },
    ReconcileFinished(ReconcileReport),
    StorageFailure { message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    /// The remote store confirmed the write.
    Synced,
    /// Saved locally; the reconciler will replay it.
    Queued(QueuedOperation),
}

impl WriteOutcome {
    pub fn is_queued(&self) -> bool {
        matches!(self, WriteOutcome::Queued(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackSource {
    /// What the entity store already held.
    Resident,
    /// The store was empty; rows came from the snapshot cache.
    Cache,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Fresh(Vec<Value>),
    /// The remote read failed or timed out. `rows` is the last known snapshot.
    Fallback { rows: Vec<Value>, source: FallbackSource, reason: RemoteError },
}

impl FetchOutcome {
    pub fn rows(&self) -> &[Value] {
        match self {
            FetchOutcome::Fresh(rows) | FetchOutcome::Fallback { rows, .. } => rows,
        }
    }

    pub fn is_fresh(&self) -> bool {
        matches!(self, FetchOutcome::Fresh(_))
    }
}

/// Shared collaborators a session is built from.
#[derive(Clone)]
pub struct SyncDeps {
    pub remote: Arc<dyn RemoteStore>,
    pub local: Arc<dyn LocalStore>,
    pub probe: Arc<dyn ReachabilityProbe>,
}

impl SyncDeps {
    /// Open local storage at `config.database_path`, or in memory when unset.
    pub fn from_config(
        config: &SyncConfig,
        remote: Arc<dyn RemoteStore>,
        probe: Arc<dyn ReachabilityProbe>,
    ) -> Result<Self> {
        let local: Arc<dyn LocalStore> = match &config.database_path {
            Some(path) => Arc::new(SqliteStore::open(path)?),
            None => Arc::new(MemoryStore::new()),
        };
        Ok(Self { remote, local, probe })
    }
}

/// Per-session sync service: owns the entity store, the operation log and
/// the background tasks that keep them converging with the remote store.
///
/// Background tasks hold the client alive; call [`SyncClient::shutdown`] to
/// end the session.
pub struct SyncClient {
    config: SyncConfig,
    actor_id: String,
    remote: Arc<dyn RemoteStore>,
    oplog: Arc<OperationLog>,
    store: Arc<EntityStore>,
    cache: SnapshotCache,
    connectivity: Arc<ConnectivityMonitor>,
    reconciler: Reconciler,
    feed: Arc<ChangeFeedListener>,
    auditor: Auditor,
    events: broadcast::Sender<SyncEvent>,
    cancel: CancellationToken,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncClient {
    /// Build a session for `actor_id`. The store is painted from the snapshot
    /// cache with queued changes laid over it; nothing touches the network.
    pub fn new(config: SyncConfig, actor_id: impl Into<String>, deps: SyncDeps) -> Result<Self> {
        config.validate()?;
        let actor_id = actor_id.into();
        let (events, _) = broadcast::channel(config.event_capacity);

        let oplog = Arc::new(OperationLog::open(deps.local.clone())?);
        let store = Arc::new(EntityStore::new());
        let cache = SnapshotCache::new(deps.local);
        cache.seed(&store)?;

        let auditor = Auditor::new(deps.remote.clone(), actor_id.clone());
        let client = Self {
            reconciler: Reconciler::new(oplog.clone(), deps.remote.clone(), auditor.clone()),
            feed: Arc::new(ChangeFeedListener::new(
                deps.remote.clone(),
                store.clone(),
                actor_id.clone(),
                events.clone(),
            )),
            connectivity: Arc::new(ConnectivityMonitor::new(deps.probe)),
            remote: deps.remote,
            config,
            actor_id,
            oplog,
            store,
            cache,
            auditor,
            events,
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        };
        for collection in Collection::SYNCED {
            client.reapply_pending(collection)?;
        }
        Ok(client)
    }

    /// Spawn the session's background work: connectivity polling, reconcile
    /// on reconnect, the change feed, cache flushing and a bounded bootstrap
    /// refetch.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SyncError::State("sync client already started"));
        }
        info!(actor_id = %self.actor_id, online = self.is_online(), "starting sync session");

        let mut handles = vec![
            self.connectivity.spawn_poll(self.config.poll_interval(), self.cancel.child_token()),
            self.spawn_connectivity_watcher(),
            self.spawn_reconcile_loop(),
            self.spawn_cache_flusher(),
        ];
        handles.extend(self.feed.start(self.cancel.child_token()).await?);
        handles.push(self.spawn_bootstrap());

        self.lock_tasks()?.extend(handles);
        Ok(())
    }

    /// Cancel every background task, release the feed subscriptions and wait
    /// for the tasks to exit. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.feed.stop();
        let handles: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "sync task ended abnormally");
            }
        }
        info!(actor_id = %self.actor_id, "sync session closed");
    }

    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }

    pub fn store(&self) -> &Arc<EntityStore> {
        &self.store
    }

    pub fn operation_log(&self) -> &Arc<OperationLog> {
        &self.oplog
    }

    pub fn connectivity(&self) -> &Arc<ConnectivityMonitor> {
        &self.connectivity
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    /// Feed a platform reachability signal.
    pub fn report_connectivity(&self, reachable: bool) -> Option<Connectivity> {
        self.connectivity.report(reachable)
    }

    pub fn is_syncing(&self) -> bool {
        self.reconciler.is_running()
    }

    /// Current length of the operation log.
    pub fn pending_changes(&self) -> Result<usize> {
        self.oplog.len()
    }

    pub fn watch_pending(&self) -> watch::Receiver<usize> {
        self.oplog.watch_len()
    }

    /// Insert a row. A missing id is generated here and `user_id` is stamped
    /// with the session actor.
    pub async fn insert(&self, collection: Collection, record: Value) -> Result<WriteOutcome> {
        let Value::Object(mut row) = record else {
            return Err(SyncError::InvalidOperation(format!(
                "insert into {collection} expects an object"
            )));
        };
        if record_id(&Value::Object(row.clone())).is_none() {
            row.insert("id".into(), Value::String(new_id()));
        }
        row.entry("user_id").or_insert_with(|| Value::String(self.actor_id.clone()));
        self.write(collection, Mutation::Insert(Value::Object(row))).await
    }

    pub async fn update(
        &self,
        collection: Collection,
        id: &str,
        patch: Value,
    ) -> Result<WriteOutcome> {
        let Value::Object(mut patch) = patch else {
            return Err(SyncError::InvalidOperation(format!(
                "update of {collection} expects an object"
            )));
        };
        patch.insert("updated_at".into(), Value::String(Utc::now().to_rfc3339()));
        let mutation = Mutation::Update { id: id.to_string(), patch: Value::Object(patch) };
        self.write(collection, mutation).await
    }

    pub async fn delete(&self, collection: Collection, id: &str) -> Result<WriteOutcome> {
        self.write(collection, Mutation::Delete { id: id.to_string() }).await
    }

    /// Create a task with a client-generated id. The task is visible in the
    /// store before this returns, whatever the network does.
    pub async fn add_task(&self, task: NewTask) -> Result<(Task, WriteOutcome)> {
        let mut task = task.into_task();
        task.user_id = Some(self.actor_id.clone());
        let outcome = self.insert(Collection::Tasks, task.to_record()?).await?;
        Ok((task, outcome))
    }

    pub async fn update_task(&self, id: &str, patch: TaskPatch) -> Result<WriteOutcome> {
        self.update(Collection::Tasks, id, serde_json::to_value(patch)?).await
    }

    pub async fn delete_task(&self, id: &str) -> Result<WriteOutcome> {
        self.delete(Collection::Tasks, id).await
    }

    /// Read a collection, bounded by the fetch timeout. A failed or slow read
    /// falls back to the last known snapshot instead of blocking.
    pub async fn fetch_collection(&self, collection: Collection) -> Result<FetchOutcome> {
        self.fetch_within(collection, self.config.fetch_timeout()).await
    }

    pub async fn fetch_fields(&self) -> Result<FetchOutcome> {
        self.fetch_collection(Collection::Jobs).await
    }

    pub async fn fetch_tasks(&self) -> Result<FetchOutcome> {
        self.fetch_collection(Collection::Tasks).await
    }

    pub async fn fetch_team_members(&self) -> Result<FetchOutcome> {
        self.fetch_collection(Collection::TeamMembers).await
    }

    pub async fn fetch_weather_data(&self) -> Result<FetchOutcome> {
        self.fetch_collection(Collection::Weather).await
    }

    /// Replay the operation log once, then resynchronize from the remote store.
    pub async fn reconcile(&self) -> Result<ReconcileOutcome> {
        let pending = self.oplog.len().inspect_err(|e| self.report_storage_failure(e))?;
        if pending > 0 && !self.reconciler.is_running() {
            let _ = self.events.send(SyncEvent::ReconcileStarted { pending });
        }

        let outcome = self
            .reconciler
            .run_pass(&self.cancel)
            .await
            .inspect_err(|e| self.report_storage_failure(e))?;
        let ReconcileOutcome::Completed(report) = outcome else {
            return Ok(outcome);
        };

        if report.attempted > 0 {
            let (jobs, tasks, team) = tokio::join!(
                self.fetch_collection(Collection::Jobs),
                self.fetch_collection(Collection::Tasks),
                self.fetch_collection(Collection::TeamMembers),
            );
            jobs?;
            tasks?;
            team?;
            let _ = self.events.send(SyncEvent::ReconcileFinished(report));
        }
        if report.succeeded > 0 {
            self.notify(Notification::success(
                "Sync Complete",
                format!("{} change(s) synced successfully", report.succeeded),
            ));
        }
        Ok(outcome)
    }

    async fn write(&self, collection: Collection, mutation: Mutation) -> Result<WriteOutcome> {
        self.ensure_open()?;
        if collection == Collection::Weather {
            return Err(SyncError::InvalidOperation("weather_data is read-only".into()));
        }
        let entity_id = mutation
            .entity_id()
            .ok_or_else(|| {
                SyncError::InvalidOperation(format!("write to {collection} without id"))
            })?;

        let previous = self.store.get(collection, &entity_id)?.map(|e| e.record);
        self.store.apply_local_mutation(collection, &mutation)?;

        // Anything already queued for this entity must reach the server first.
        let behind_queue = self.oplog.has_pending_for(collection, &entity_id)?;
        if self.is_online() && !behind_queue {
            let limit = self.config.write_timeout();
            let send = dispatch(self.remote.as_ref(), collection, &mutation);
            let sent = match timeout(limit, send).await {
                Ok(result) => result,
                Err(_) => Err(RemoteError::Timeout(limit.as_millis() as u64)),
            };
            match sent {
                Ok(()) => {
                    if mutation.kind() != OpType::Delete {
                        self.store.mark_confirmed(collection, &entity_id)?;
                    }
                    self.auditor.record(collection, &mutation, previous).await;
                    debug!(collection = %collection, entity_id = %entity_id, "write confirmed");
                    return Ok(WriteOutcome::Synced);
                }
                Err(e) => {
                    warn!(
                        collection = %collection,
                        entity_id = %entity_id,
                        error = %e,
                        "remote write failed; queueing"
                    )
                }
            }
        }

        let op = self
            .oplog
            .enqueue(PendingOperation::new(mutation.kind(), collection, mutation.to_payload()))
            .inspect_err(|e| self.report_storage_failure(e))?;
        self.notify(Notification::info("Saved Locally", queued_body(collection, mutation.kind())));
        if self.is_online() {
            self.connectivity.request_reconcile();
        }
        Ok(WriteOutcome::Queued(op))
    }

    async fn fetch_within(&self, collection: Collection, limit: Duration) -> Result<FetchOutcome> {
        self.ensure_open()?;
        let read = self.remote.fetch(collection, collection.order_by());
        let result = match timeout(limit, read).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout(limit.as_millis() as u64)),
        };
        // A read that finished after teardown must not touch the shared store.
        self.ensure_open()?;

        let reason = match result {
            Ok(rows) => {
                debug!(collection = %collection, rows = rows.len(), "fetched collection");
                self.store.replace_collection(collection, rows)?;
                self.reapply_pending(collection)?;
                let rows = self.store.records(collection)?;
                self.cache.save(collection, &rows)?;
                return Ok(FetchOutcome::Fresh(rows));
            }
            Err(reason) => reason,
        };

        warn!(
            collection = %collection,
            error = %reason,
            "fetch failed; serving last known snapshot"
        );
        if self.store.is_empty(collection)? {
            match self.cache.load(collection) {
                Ok(cached) if !cached.is_empty() => {
                    self.store.replace_collection(collection, cached)?;
                    self.reapply_pending(collection)?;
                    return Ok(FetchOutcome::Fallback {
                        rows: self.store.records(collection)?,
                        source: FallbackSource::Cache,
                        reason,
                    });
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(collection = %collection, error = %e, "snapshot cache unreadable");
                    self.report_storage_failure(&e);
                }
            }
        }
        Ok(FetchOutcome::Fallback {
            rows: self.store.records(collection)?,
            source: FallbackSource::Resident,
            reason,
        })
    }

    /// Lay queued changes over a freshly replaced collection so pending
    /// edits stay visible until they are confirmed.
    fn reapply_pending(&self, collection: Collection) -> Result<()> {
        for op in self.oplog.list_all()? {
            if op.collection != collection {
                continue;
            }
            let mutation = Mutation::from_payload(op.kind, op.payload)?;
            self.store.apply_local_mutation(collection, &mutation)?;
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::State("sync session closed"));
        }
        Ok(())
    }

    fn notify(&self, notification: Notification) {
        let _ = self.events.send(SyncEvent::Notification(notification));
    }

    fn report_storage_failure(&self, e: &SyncError) {
        if !e.is_storage_failure() {
            return;
        }
        error!(error = %e, "local storage failure");
        let _ = self.events.send(SyncEvent::StorageFailure { message: e.to_string() });
        self.notify(Notification::error("Storage Error", e.to_string()));
    }

    fn spawn_connectivity_watcher(self: &Arc<Self>) -> JoinHandle<()> {
        let client = Arc::clone(self);
        let mut state = self.connectivity.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = client.cancel.cancelled() => break,
                    changed = state.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let current = *state.borrow_and_update();
                        let changed = SyncEvent::ConnectivityChanged { state: current };
                        let _ = client.events.send(changed);
                        client.notify(match current {
                            Connectivity::Offline => Notification::info(
                                "Offline Mode",
                                "Changes will be synced when connection is restored",
                            ),
                            Connectivity::Online => {
                                Notification::info("Back Online", "Syncing pending changes...")
                            }
                        });
                    }
                }
            }
        })
    }

    /// Runs a pass when asked (reconnect, bootstrap, online enqueue) and on
    /// every poll tick while work is queued, so failed replays are retried
    /// without waiting for the next outage.
    fn spawn_reconcile_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let client = Arc::clone(self);
        let period = self.config.poll_interval();
        tokio::spawn(async move {
            let mut retry = interval_at(Instant::now() + period, period);
            retry.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = client.cancel.cancelled() => break,
                    _ = client.connectivity.reconcile_requested() => {}
                    _ = retry.tick() => {
                        match client.oplog.len() {
                            Ok(0) => continue,
                            Ok(_) => {}
                            Err(e) => {
                                client.report_storage_failure(&e);
                                continue;
                            }
                        }
                    }
                }
                if !client.is_online() {
                    continue;
                }
                if let Err(e) = client.reconcile().await {
                    error!(error = %e, "reconciliation pass aborted");
                }
            }
            debug!("reconcile loop stopped");
        })
    }

    fn spawn_cache_flusher(self: &Arc<Self>) -> JoinHandle<()> {
        let client = Arc::clone(self);
        let mut revision = self.store.watch_revision();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = client.cancel.cancelled() => break,
                    changed = revision.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        revision.borrow_and_update();
                        if let Err(e) = client.cache.flush(&client.store) {
                            client.report_storage_failure(&e);
                        }
                    }
                }
            }
        })
    }

    fn spawn_bootstrap(self: &Arc<Self>) -> JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let limit = client.config.bootstrap_timeout();
            let refetch = async {
                tokio::join!(
                    client.fetch_within(Collection::Jobs, limit),
                    client.fetch_within(Collection::Tasks, limit),
                    client.fetch_within(Collection::TeamMembers, limit),
                    client.fetch_within(Collection::Weather, limit),
                )
            };
            let results = tokio::select! {
                biased;
                _ = client.cancel.cancelled() => return,
                results = refetch => results,
            };
            let (jobs, tasks, team, weather) = results;
            for result in [jobs, tasks, team, weather] {
                if let Err(e) = result {
                    warn!(error = %e, "bootstrap refetch failed");
                }
            }

            // Changes queued by an earlier session go out as soon as we can.
            match client.oplog.len() {
                Ok(pending) if pending > 0 && client.is_online() => {
                    client.connectivity.request_reconcile()
                }
                Ok(_) => {}
                Err(e) => client.report_storage_failure(&e),
            }
        })
    }

    fn lock_tasks(&self) -> Result<std::sync::MutexGuard<'_, Vec<JoinHandle<()>>>> {
        self.tasks.lock().map_err(|_| SyncError::State("sync task list lock poisoned"))
    }
}

fn queued_body(collection: Collection, kind: OpType) -> String {
    let what = match (collection, kind) {
        (Collection::Tasks, OpType::Insert) => "Task",
        (_, OpType::Update) => "Update",
        _ => "Change",
    };
    format!("{what} queued (offline)")
}
