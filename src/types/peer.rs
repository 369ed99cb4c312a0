//! Peer identity attached to each connection

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Subject used before any authentication step has run
pub const ANONYMOUS: &str = "anonymous";

/// An authenticated (or anonymous) remote party
///
/// Produced by the secure channel handshake and refined by the `auth`
/// method; consumed by the access predicate on every invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerIdentity {
    /// Name the peer is known by (user name, certificate label, ...)
    pub subject: String,

    /// SHA-256 fingerprint of the peer's leaf certificate, in secure mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,

    /// Whatever claims the authentication step produced
    #[serde(default)]
    pub claims: Value,
}

impl PeerIdentity {
    pub fn new(subject: impl Into<String>, claims: Value) -> Self {
        Self {
            subject: subject.into(),
            fingerprint: None,
            claims,
        }
    }

    pub fn anonymous() -> Self {
        Self::new(ANONYMOUS, Value::Null)
    }

    /// Identity established by a verified client certificate
    pub fn from_certificate(fingerprint: String) -> Self {
        let short = fingerprint.chars().take(16).collect::<String>();
        Self {
            subject: format!("cert:{}", short),
            claims: serde_json::json!({ "fingerprint": fingerprint }),
            fingerprint: Some(fingerprint),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.subject == ANONYMOUS && self.fingerprint.is_none()
    }

    /// Keep the transport-level fingerprint when an `auth` call replaces the identity
    pub fn with_fingerprint(mut self, fingerprint: Option<String>) -> Self {
        if self.fingerprint.is_none() {
            self.fingerprint = fingerprint;
        }
        self
    }

    /// Check a permission claim (`"*"` grants everything)
    pub fn has_permission(&self, permission: &str) -> bool {
        self.claims
            .get("permissions")
            .and_then(|p| p.as_array())
            .map(|perms| {
                perms
                    .iter()
                    .filter_map(|p| p.as_str())
                    .any(|p| p == permission || p == "*")
            })
            .unwrap_or(false)
    }
}

impl Default for PeerIdentity {
    fn default() -> Self {
        Self::anonymous()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_certificate_identity() {
        let id = PeerIdentity::from_certificate("ab".repeat(32));
        assert_eq!(id.subject, format!("cert:{}", "ab".repeat(8)));
        assert!(!id.is_anonymous());
        assert_eq!(id.claims["fingerprint"], json!("ab".repeat(32)));
    }

    #[test]
    fn test_permissions() {
        let reader = PeerIdentity::new("alice", json!({ "permissions": ["read"] }));
        assert!(reader.has_permission("read"));
        assert!(!reader.has_permission("write"));

        let admin = PeerIdentity::new("admin", json!({ "permissions": ["*"] }));
        assert!(admin.has_permission("anything"));

        assert!(!PeerIdentity::anonymous().has_permission("read"));
    }

    #[test]
    fn test_fingerprint_survives_auth() {
        let user = PeerIdentity::new("alice", Value::Null).with_fingerprint(Some("ff".to_string()));
        assert_eq!(user.fingerprint.as_deref(), Some("ff"));
    }
}
