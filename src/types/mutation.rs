//! Mutations observed on the primary store

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ChangeType;

/// Where a write came from
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "origin", rename_all = "snake_case")]
pub enum MutationOrigin {
    /// Issued by a local caller
    #[default]
    Local,
    /// Applied by the replication driver from a peer's change log
    Replicated { peer: String },
}

impl MutationOrigin {
    pub fn replicated(peer: impl Into<String>) -> Self {
        MutationOrigin::Replicated { peer: peer.into() }
    }

    pub fn is_replicated(&self) -> bool {
        matches!(self, MutationOrigin::Replicated { .. })
    }
}

/// A write to apply to a store
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Put { key: String, value: Value },
    Delete { key: String },
}

impl WriteOp {
    pub fn put(key: impl Into<String>, value: Value) -> Self {
        WriteOp::Put {
            key: key.into(),
            value,
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        WriteOp::Delete { key: key.into() }
    }

    pub fn key(&self) -> &str {
        match self {
            WriteOp::Put { key, .. } | WriteOp::Delete { key } => key,
        }
    }

    pub fn change_type(&self) -> ChangeType {
        match self {
            WriteOp::Put { .. } => ChangeType::Put,
            WriteOp::Delete { .. } => ChangeType::Delete,
        }
    }
}

/// Post-mutation notification delivered to store observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    pub change_type: ChangeType,
    pub key: String,
    pub origin: MutationOrigin,
}

impl Mutation {
    pub fn from_op(op: &WriteOp, origin: MutationOrigin) -> Self {
        Self {
            change_type: op.change_type(),
            key: op.key().to_string(),
            origin,
        }
    }
}
