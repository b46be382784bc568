use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audit::Auditor;
use crate::error::{RemoteError, SyncError};
use crate::model::Collection;
use crate::oplog::{OperationLog, QueuedOperation};
use crate::remote::{RemoteStore, dispatch};
use crate::store::Mutation;

/// Counts from one replay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Remote calls issued.
    pub attempted: usize,
    pub succeeded: usize,
    /// Left queued because an earlier operation on the same entity failed.
    pub deferred: usize,
}

impl ReconcileReport {
    pub fn failed(&self) -> usize {
        self.attempted - self.succeeded
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Completed(ReconcileReport),
    /// Another pass was in flight; this request was dropped.
    AlreadyRunning,
    /// Teardown interrupted the pass. Unfinished operations stay queued.
    Cancelled(ReconcileReport),
}

/// Replays the operation log against the remote store.
pub struct Reconciler {
    oplog: Arc<OperationLog>,
    remote: Arc<dyn RemoteStore>,
    auditor: Auditor,
    running: AtomicBool,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Reconciler {
    pub fn new(oplog: Arc<OperationLog>, remote: Arc<dyn RemoteStore>, auditor: Auditor) -> Self {
        Self { oplog, remote, auditor, running: AtomicBool::new(false) }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run one pass over a snapshot of the log.
    ///
    /// Each operation is removed as soon as its remote call succeeds. Failures
    /// stay queued and do not stop the pass. Only storage errors abort it.
    pub async fn run_pass(
        &self,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome, SyncError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("reconciliation already in flight; dropping request");
            return Ok(ReconcileOutcome::AlreadyRunning);
        }
        let _guard = RunningGuard(&self.running);

        let queue = self.oplog.list_all()?;
        let mut report = ReconcileReport::default();
        if queue.is_empty() {
            return Ok(ReconcileOutcome::Completed(report));
        }
        info!(queued = queue.len(), "replaying queued operations");

        let mut blocked: HashSet<(Collection, String)> = HashSet::new();
        for op in queue {
            if cancel.is_cancelled() {
                return Ok(ReconcileOutcome::Cancelled(report));
            }
            let key = op.entity_id().map(|id| (op.collection, id));
            if key.as_ref().is_some_and(|k| blocked.contains(k)) {
                report.deferred += 1;
                continue;
            }

            report.attempted += 1;
            let result = tokio::select! {
                _ = cancel.cancelled() => return Ok(ReconcileOutcome::Cancelled(report)),
                result = self.replay(&op) => result,
            };
            match result {
                Ok(mutation) => {
                    self.oplog.remove(&op.id)?;
                    report.succeeded += 1;
                    self.auditor.record(op.collection, &mutation, None).await;
                }
                Err(e) => {
                    warn!(
                        op_id = %op.id,
                        collection = %op.collection,
                        kind = op.kind.as_str(),
                        error = %e,
                        "failed to replay queued operation"
                    );
                    if let Some(key) = key {
                        blocked.insert(key);
                    }
                }
            }
        }

        info!(
            attempted = report.attempted,
            succeeded = report.succeeded,
            deferred = report.deferred,
            "reconciliation pass finished"
        );
        Ok(ReconcileOutcome::Completed(report))
    }

    async fn replay(&self, op: &QueuedOperation) -> Result<Mutation, RemoteError> {
        let mutation = Mutation::from_payload(op.kind, op.payload.clone())
            .map_err(|e| RemoteError::Rejected(e.to_string()))?;
        dispatch(self.remote.as_ref(), op.collection, &mutation).await?;
        Ok(mutation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryRemote, RemoteCall};
    use crate::model::OpType;
    use crate::oplog::PendingOperation;
    use crate::storage::MemoryStore;
    use serde_json::json;

    fn setup() -> (Arc<MemoryRemote>, Arc<OperationLog>, Reconciler) {
        let remote = Arc::new(MemoryRemote::new());
        let oplog = Arc::new(OperationLog::open(Arc::new(MemoryStore::new())).unwrap());
        let auditor = Auditor::new(remote.clone(), "user-1");
        let reconciler = Reconciler::new(oplog.clone(), remote.clone(), auditor);
        (remote, oplog, reconciler)
    }

    fn insert(id: &str) -> PendingOperation {
        PendingOperation::new(OpType::Insert, Collection::Tasks, json!({"id": id, "title": id}))
    }

    #[tokio::test]
    async fn empty_log_makes_no_remote_calls() {
        let (remote, _, reconciler) = setup();
        let outcome = reconciler.run_pass(&CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Completed(ReconcileReport::default()));
        assert!(remote.calls().is_empty());
    }

    #[tokio::test]
    async fn partial_failure_keeps_the_failed_operation() {
        let (remote, oplog, reconciler) = setup();
        let first = oplog.enqueue(insert("a")).unwrap();
        oplog.enqueue(insert("b")).unwrap();
        remote.fail_writes_for("a");

        let outcome = reconciler.run_pass(&CancellationToken::new()).await.unwrap();
        let ReconcileOutcome::Completed(report) = outcome else { panic!("unexpected {outcome:?}") };
        assert_eq!((report.attempted, report.succeeded), (2, 1));
        assert_eq!(report.failed(), 1);
        assert_eq!(oplog.list_all().unwrap(), vec![first]);
        assert_eq!(remote.audit_entries().len(), 1);
    }

    #[tokio::test]
    async fn later_operations_on_a_failed_entity_are_deferred() {
        let (remote, oplog, reconciler) = setup();
        oplog.enqueue(insert("a")).unwrap();
        oplog
            .enqueue(PendingOperation::new(
                OpType::Update,
                Collection::Tasks,
                json!({"id": "a", "status": "completed"}),
            ))
            .unwrap();
        remote.fail_writes_for("a");

        let outcome = reconciler.run_pass(&CancellationToken::new()).await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Completed(ReconcileReport { attempted: 1, succeeded: 0, deferred: 1 })
        );
        assert_eq!(oplog.len().unwrap(), 2);
        assert_eq!(remote.writes().len(), 1);

        remote.clear_failures();
        reconciler.run_pass(&CancellationToken::new()).await.unwrap();
        assert!(oplog.is_empty().unwrap());
        assert_eq!(
            remote.rows(Collection::Tasks),
            vec![json!({"id": "a", "title": "a", "status": "completed"})]
        );
    }

    #[tokio::test]
    async fn replays_in_enqueue_order() {
        let (remote, oplog, reconciler) = setup();
        oplog.enqueue(insert("a")).unwrap();
        oplog
            .enqueue(PendingOperation::new(OpType::Delete, Collection::Tasks, json!({"id": "a"})))
            .unwrap();
        reconciler.run_pass(&CancellationToken::new()).await.unwrap();
        assert!(matches!(
            remote.writes().as_slice(),
            [RemoteCall::Insert(..), RemoteCall::Delete(..)]
        ));
        assert!(remote.rows(Collection::Tasks).is_empty());
    }

    #[tokio::test]
    async fn update_and_delete_replays_are_safe_to_repeat() {
        let (remote, oplog, reconciler) = setup();
        remote.seed(Collection::Tasks, vec![json!({"id": "a", "status": "pending"})]);
        let update = PendingOperation::new(
            OpType::Update,
            Collection::Tasks,
            json!({"id": "a", "status": "completed"}),
        );
        let delete = PendingOperation::new(OpType::Delete, Collection::Tasks, json!({"id": "a"}));

        // Same operations delivered twice, as after a crash between the remote
        // call and the log removal.
        for _ in 0..2 {
            oplog.enqueue(update.clone()).unwrap();
            oplog.enqueue(delete.clone()).unwrap();
            let outcome = reconciler.run_pass(&CancellationToken::new()).await.unwrap();
            assert!(matches!(outcome, ReconcileOutcome::Completed(r) if r.succeeded == 2));
        }
        assert!(remote.rows(Collection::Tasks).is_empty());
        assert!(oplog.is_empty().unwrap());
    }

    #[tokio::test]
    async fn concurrent_requests_are_dropped() {
        let (_, oplog, reconciler) = setup();
        oplog.enqueue(insert("a")).unwrap();
        reconciler.running.store(true, Ordering::SeqCst);
        let outcome = reconciler.run_pass(&CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::AlreadyRunning);
        assert_eq!(oplog.len().unwrap(), 1);
    }

    #[tokio::test]
    async fn cancelling_mid_pass_keeps_unfinished_operations() {
        let (remote, oplog, reconciler) = setup();
        let reconciler = Arc::new(reconciler);
        oplog.enqueue(insert("a")).unwrap();
        let stuck = oplog.enqueue(insert("b")).unwrap();
        let untouched = oplog.enqueue(insert("c")).unwrap();
        remote.stall_writes_for("b");

        let cancel = CancellationToken::new();
        let pass = {
            let reconciler = reconciler.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { reconciler.run_pass(&cancel).await })
        };
        while remote.writes().len() < 2 {
            tokio::task::yield_now().await;
        }
        assert!(reconciler.is_running());

        cancel.cancel();
        let outcome = pass.await.unwrap().unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Cancelled(ReconcileReport { attempted: 2, succeeded: 1, deferred: 0 })
        );
        assert_eq!(oplog.list_all().unwrap(), vec![stuck, untouched]);
        assert_eq!(remote.writes().len(), 2);
        assert_eq!(remote.rows(Collection::Tasks), vec![json!({"id": "a", "title": "a"})]);
        assert!(!reconciler.is_running());
    }

    #[tokio::test]
    async fn cancelled_pass_leaves_the_log_untouched() {
        let (remote, oplog, reconciler) = setup();
        oplog.enqueue(insert("a")).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = reconciler.run_pass(&cancel).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Cancelled(ReconcileReport::default()));
        assert!(remote.writes().is_empty());
        assert!(!reconciler.is_running());
    }
}
