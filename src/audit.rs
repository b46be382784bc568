use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::model::Collection;
use crate::remote::RemoteStore;
use crate::store::Mutation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    Create,
    Update,
    Delete,
    StatusChange,
    Assign,
    Unassign,
}

impl AuditAction {
    /// Classify a mutation the way the audit log viewer groups them.
    pub fn for_mutation(mutation: &Mutation) -> Self {
        match mutation {
            Mutation::Insert(_) => AuditAction::Create,
            Mutation::Delete { .. } => AuditAction::Delete,
            Mutation::Update { patch, .. } => {
                let keys: Vec<&str> = patch
                    .as_object()
                    .map(|obj| {
                        obj.keys()
                            .map(String::as_str)
                            .filter(|k| !matches!(*k, "id" | "updated_at"))
                            .collect()
                    })
                    .unwrap_or_default();
                match keys.as_slice() {
                    ["status"] => AuditAction::StatusChange,
                    ["assigned_to"] if patch["assigned_to"].is_null() => AuditAction::Unassign,
                    ["assigned_to"] => AuditAction::Assign,
                    _ => AuditAction::Update,
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub action: AuditAction,
    pub table: Collection,
    pub record_id: Option<String>,
    pub old_data: Option<Value>,
    pub new_data: Option<Value>,
    pub actor_id: String,
    pub recorded_at: DateTime<Utc>,
}

/// Best-effort audit trail for confirmed writes.
#[derive(Clone)]
pub struct Auditor {
    remote: Arc<dyn RemoteStore>,
    actor_id: String,
}

impl Auditor {
    pub fn new(remote: Arc<dyn RemoteStore>, actor_id: impl Into<String>) -> Self {
        Self { remote, actor_id: actor_id.into() }
    }

    pub fn entry(
        &self,
        collection: Collection,
        mutation: &Mutation,
        old_data: Option<Value>,
    ) -> AuditEntry {
        let new_data = match mutation {
            Mutation::Insert(record) => Some(record.clone()),
            Mutation::Update { patch, .. } => Some(patch.clone()),
            Mutation::Delete { .. } => None,
        };
        AuditEntry {
            action: AuditAction::for_mutation(mutation),
            table: collection,
            record_id: mutation.entity_id(),
            old_data,
            new_data,
            actor_id: self.actor_id.clone(),
            recorded_at: Utc::now(),
        }
    }

    /// Failures are logged and dropped; auditing never fails a write.
    pub async fn record(
        &self,
        collection: Collection,
        mutation: &Mutation,
        old_data: Option<Value>,
    ) {
        let entry = self.entry(collection, mutation, old_data);
        if let Err(e) = self.remote.record_audit(&entry).await {
            warn!(
                collection = %collection,
                record_id = ?entry.record_id,
                error = %e,
                "failed to record audit entry"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn update(patch: Value) -> Mutation {
        Mutation::Update { id: "t1".into(), patch }
    }

    #[test]
    fn classifies_mutations() {
        assert_eq!(
            AuditAction::for_mutation(&Mutation::Insert(json!({"id": "t1"}))),
            AuditAction::Create
        );
        assert_eq!(
            AuditAction::for_mutation(&Mutation::Delete { id: "t1".into() }),
            AuditAction::Delete
        );
        assert_eq!(
            AuditAction::for_mutation(&update(
                json!({"id": "t1", "status": "completed", "updated_at": "x"})
            )),
            AuditAction::StatusChange
        );
        assert_eq!(
            AuditAction::for_mutation(&update(json!({"assigned_to": "m1"}))),
            AuditAction::Assign
        );
        assert_eq!(
            AuditAction::for_mutation(&update(json!({"assigned_to": null}))),
            AuditAction::Unassign
        );
        assert_eq!(
            AuditAction::for_mutation(&update(json!({"status": "completed", "title": "B"}))),
            AuditAction::Update
        );
    }

    #[test]
    fn serializes_with_audit_log_action_names() {
        assert_eq!(
            serde_json::to_value(AuditAction::StatusChange).unwrap(),
            json!("STATUS_CHANGE")
        );
    }
}
