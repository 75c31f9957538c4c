// ABOUTME: Error taxonomy for sync round trips and replica provisioning
// ABOUTME: Distinguishes fatal schema errors from retryable transport failures

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Malformed input (room name, schema params, requestor id). Rejected
    /// before touching storage.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The replica was created under a different schema name. Fatal, never
    /// retried.
    #[error("schema conflict: replica was created for schema '{stored}', requested '{requested}'")]
    SchemaConflict { stored: String, requested: String },

    /// Client and server disagree on the identity of the schema text.
    /// Fatal, never retried.
    #[error("schema version mismatch: server fingerprint {server}, client requested {requested}")]
    SchemaVersionMismatch { server: u32, requested: u32 },

    /// The backing store cannot be opened or created. The caller may retry
    /// after remediation.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Transport-level failure; no local state was mutated. Retry is the
    /// caller's responsibility.
    #[error("network failure: {0}")]
    Network(String),

    /// The remote rejected the round trip with an error body.
    #[error("server error (status {status}): {message}")]
    Server { status: u16, message: String },

    /// A payload decoded to an unexpected message tag.
    #[error("unexpected message tag: {0}")]
    DecodeMismatch(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl SyncError {
    /// Fatal errors are surfaced verbatim and must not be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::SchemaConflict { .. } | SyncError::SchemaVersionMismatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(SyncError::SchemaConflict {
            stored: "a".into(),
            requested: "b".into()
        }
        .is_fatal());
        assert!(SyncError::SchemaVersionMismatch {
            server: 1,
            requested: 2
        }
        .is_fatal());
        assert!(!SyncError::Network("connection refused".into()).is_fatal());
        assert!(!SyncError::StorageUnavailable("read-only".into()).is_fatal());
    }
}
