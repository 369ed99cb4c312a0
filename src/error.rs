//! Crate-wide error type
//!
//! Every fallible replicator operation returns [`ReplicationResult`]. Errors
//! crossing the wire are mapped to JSON-RPC error codes and back so a remote
//! caller sees the same variant the server produced.

use crate::security::AuthError;
use crate::storage::StoreError;

/// Result type for replicator operations
pub type ReplicationResult<T> = Result<T, ReplicationError>;

/// JSON-RPC error codes used by the service surface
pub mod codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
    pub const UNAUTHENTICATED: i32 = -32001;
    pub const ACCESS_DENIED: i32 = -32003;
    pub const NOT_FOUND: i32 = -32004;
    pub const STORAGE_ERROR: i32 = -32010;
}

/// Errors that can occur while replicating
#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    /// Invalid server configuration; fatal at construction
    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("access denied for '{method}'")]
    AccessDenied { method: String },

    #[error("authentication failed: {0}")]
    Unauthenticated(#[from] AuthError),

    #[error("key not found: {0}")]
    NotFound(String),

    /// The peer answered with something this side does not understand
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Error reported by the remote end of an RPC session
    #[error("remote error {code}: {message}")]
    Remote { code: i32, message: String },

    #[error("incompatible peer version {remote} (local {local})")]
    Incompatible { local: String, remote: String },

    #[error("server is closed")]
    Closed,
}

impl ReplicationError {
    /// JSON-RPC error code for this error
    pub fn code(&self) -> i32 {
        match self {
            ReplicationError::NotFound(_) => codes::NOT_FOUND,
            ReplicationError::AccessDenied { .. } => codes::ACCESS_DENIED,
            ReplicationError::Unauthenticated(_) => codes::UNAUTHENTICATED,
            ReplicationError::Storage(_) => codes::STORAGE_ERROR,
            ReplicationError::Json(_) => codes::INVALID_PARAMS,
            ReplicationError::Remote { code, .. } => *code,
            _ => codes::INTERNAL_ERROR,
        }
    }

    /// Rebuild an error from a JSON-RPC error object received from a peer
    pub fn from_remote(code: i32, message: String, data: Option<&serde_json::Value>) -> Self {
        let detail = |field: &str| {
            data.and_then(|d| d.get(field))
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };

        match code {
            codes::NOT_FOUND => ReplicationError::NotFound(detail("key").unwrap_or(message)),
            codes::ACCESS_DENIED => ReplicationError::AccessDenied {
                method: detail("method").unwrap_or_default(),
            },
            codes::UNAUTHENTICATED => ReplicationError::Unauthenticated(AuthError::Rejected(
                detail("details").unwrap_or(message),
            )),
            _ => ReplicationError::Remote { code, message },
        }
    }

    /// True for errors that a later retry may not hit again
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ReplicationError::Io(_) | ReplicationError::Tls(_) | ReplicationError::Remote { .. }
        )
    }
}
