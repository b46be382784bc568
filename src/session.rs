use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;

use crate::config::SyncConfig;
use crate::error::Result;
use crate::storage::ScopedStore;
use crate::sync::{SyncClient, SyncDeps};

/// The authenticated identity a sync session runs as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub actor_id: String,
    #[serde(default)]
    pub email: Option<String>,
}

impl Session {
    pub fn new(actor_id: impl Into<String>) -> Self {
        Self { actor_id: actor_id.into(), email: None }
    }
}

/// Lifecycle signals from the identity provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    SignedIn(Session),
    /// A persisted session picked up at process start.
    Restored(Session),
    SignedOut,
}

/// Keeps exactly one [`SyncClient`] alive per authenticated session.
pub struct SessionScope {
    config: SyncConfig,
    deps: SyncDeps,
    active: Mutex<Option<Arc<SyncClient>>>,
}

impl SessionScope {
    pub fn new(config: SyncConfig, deps: SyncDeps) -> Self {
        Self { config, deps, active: Mutex::new(None) }
    }

    /// React to a session change. Returns the client now in charge, if any.
    pub async fn handle(&self, event: SessionEvent) -> Result<Option<Arc<SyncClient>>> {
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            previous.shutdown().await;
        }

        let session = match event {
            SessionEvent::SignedIn(session) | SessionEvent::Restored(session) => session,
            SessionEvent::SignedOut => {
                info!("signed out; sync stopped");
                return Ok(None);
            }
        };

        // Queue and caches belong to the signed-in account.
        let deps = SyncDeps {
            local: Arc::new(ScopedStore::new(self.deps.local.clone(), &session.actor_id)),
            ..self.deps.clone()
        };
        let client =
            Arc::new(SyncClient::new(self.config.clone(), session.actor_id.clone(), deps)?);
        client.start().await?;
        info!(actor_id = %session.actor_id, "sync session started");
        *active = Some(client.clone());
        Ok(Some(client))
    }

    pub async fn client(&self) -> Option<Arc<SyncClient>> {
        self.active.lock().await.clone()
    }
}
