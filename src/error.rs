use thiserror::Error;

/// Failure reported by the remote data store collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("transport: {0}")]
    Transport(String),
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("not authenticated")]
    Unauthenticated,
    #[error("timed out after {0} ms")]
    Timeout(u64),
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("corrupted local data under `{key}`: {source}")]
    Corrupted {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("unsupported format version {found} under `{key}` (expected {expected})")]
    UnsupportedVersion { key: String, found: u32, expected: u32 },
    #[error("remote: {0}")]
    Remote(#[from] RemoteError),
    #[error("config: {0}")]
    Config(String),
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("invalid state: {0}")]
    State(&'static str),
}

impl SyncError {
    /// Local durability failures. These are never converted into a fallback.
    pub fn is_storage_failure(&self) -> bool {
        matches!(
            self,
            SyncError::Sqlite(_)
                | SyncError::Serde(_)
                | SyncError::Corrupted { .. }
                | SyncError::UnsupportedVersion { .. }
        )
    }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_failures_are_classified() {
        let corrupted = SyncError::Corrupted {
            key: "offline_queue".into(),
            source: serde_json::from_str::<serde_json::Value>("{").unwrap_err(),
        };
        assert!(corrupted.is_storage_failure());
        assert!(!SyncError::Remote(RemoteError::Unauthenticated).is_storage_failure());
        assert!(!SyncError::InvalidOperation("missing id".into()).is_storage_failure());
    }

    #[test]
    fn remote_errors_render_their_cause() {
        let err = SyncError::from(RemoteError::Timeout(3000));
        assert_eq!(err.to_string(), "remote: timed out after 3000 ms");
    }
}
