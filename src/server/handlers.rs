//! Request helpers for RPC sessions
//!
//! Parameter extraction and result payloads shared by the session loop.

use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::error::{ReplicationError, ReplicationResult};
use crate::types::PeerIdentity;

/// Decode method params; absent params read as an empty object
pub fn extract_params<T: DeserializeOwned>(params: &Value) -> ReplicationResult<T> {
    let params = match params {
        Value::Null => Value::Object(serde_json::Map::new()),
        other => other.clone(),
    };
    serde_json::from_value(params).map_err(ReplicationError::from)
}

/// Final response of a streamed method
pub fn stream_done(count: usize) -> Value {
    json!({ "done": true, "count": count })
}

/// Result of a successful `auth` call
pub fn identity_response(peer: &PeerIdentity) -> Value {
    json!({
        "subject": peer.subject,
        "fingerprint": peer.fingerprint,
        "claims": peer.claims,
    })
}
