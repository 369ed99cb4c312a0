//! Credential verification for the `auth` method
//!
//! A peer calls `auth` with a JSON credential; the configured
//! [`Authenticator`] turns it into a [`PeerIdentity`] that replaces the
//! connection's current identity.
//!
//! ## JWT usage
//! ```bash
//! REPLICATOR_JWT_SECRET=your-super-secret-key-at-least-32-chars
//! REPLICATOR_USERS=alice:password123,replica:secret456:read,admin:admin-pass:*
//! ```
//!
//! A peer then authenticates with either
//! `{"username":"alice","password":"password123"}` or `{"token":"eyJ..."}`.
//! Tokens are HS256-signed with the shared secret by whoever provisions the
//! replicas; this side only verifies them.

use std::collections::HashMap;
use std::sync::Arc;

use bcrypt::{hash, verify, DEFAULT_COST};
use jsonwebtoken::{decode, DecodingKey, TokenData, Validation};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::types::{PeerIdentity, ANONYMOUS};

/// Turns a credential into a verified identity
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, credential: &Value) -> Result<PeerIdentity, AuthError>;
}

impl<F> Authenticator for F
where
    F: Fn(&Value) -> Result<PeerIdentity, AuthError> + Send + Sync,
{
    fn authenticate(&self, credential: &Value) -> Result<PeerIdentity, AuthError> {
        self(credential)
    }
}

/// Shared authenticator handle held by the server configuration
pub type SharedAuthenticator = Arc<dyn Authenticator>;

/// Accepts any credential as the identity it describes
///
/// The subject is taken from `username`, `user` or `subject` (or the
/// credential itself when it is a string). A `password` field is dropped
/// from the claims.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThroughAuth;

impl Authenticator for PassThroughAuth {
    fn authenticate(&self, credential: &Value) -> Result<PeerIdentity, AuthError> {
        let subject = match credential {
            Value::String(s) => s.clone(),
            Value::Object(map) => ["username", "user", "subject"]
                .iter()
                .find_map(|field| map.get(*field).and_then(|v| v.as_str()))
                .unwrap_or(ANONYMOUS)
                .to_string(),
            _ => ANONYMOUS.to_string(),
        };

        let mut claims = credential.clone();
        if let Value::Object(map) = &mut claims {
            map.remove("password");
        }
        Ok(PeerIdentity::new(subject, claims))
    }
}

/// JWT Claims structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (username)
    pub sub: String,
    /// User permissions
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Issued at (Unix timestamp)
    #[serde(default)]
    pub iat: i64,
    /// Expiration (Unix timestamp)
    pub exp: i64,
}

impl Claims {
    /// Check if token is expired
    pub fn is_expired(&self) -> bool {
        chrono::Utc::now().timestamp() > self.exp
    }

    /// Identity carried into the session
    pub fn to_identity(&self) -> PeerIdentity {
        PeerIdentity::new(
            self.sub.clone(),
            json!({ "sub": self.sub, "permissions": self.permissions }),
        )
    }
}

/// User information for authentication
#[derive(Debug, Clone)]
pub struct UserInfo {
    pub username: String,
    pub password_hash: String,
    pub permissions: Vec<String>,
}

/// JWT Authentication manager
pub struct JwtAuth {
    decoding_key: DecodingKey,
    /// User store (username -> UserInfo)
    users: HashMap<String, UserInfo>,
}

impl JwtAuth {
    /// Minimum accepted secret length
    pub const MIN_SECRET_LEN: usize = 32;

    /// Create new JwtAuth with secret key
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            users: HashMap::new(),
        }
    }

    /// Create from environment variables, `None` when no secret is set
    ///
    /// Environment:
    /// - REPLICATOR_JWT_SECRET: Secret key for signing (min 32 chars)
    /// - REPLICATOR_USERS: Comma-separated `user:password[:perm|perm]` entries
    pub fn from_env() -> Result<Option<Self>, AuthError> {
        let secret = match std::env::var("REPLICATOR_JWT_SECRET") {
            Ok(s) => s,
            Err(_) => return Ok(None),
        };
        let users = std::env::var("REPLICATOR_USERS").unwrap_or_default();

        let auth = Self::from_parts(&secret, &users)?;
        tracing::info!(users = auth.user_count(), "JWT authentication enabled");
        Ok(Some(auth))
    }

    /// Build from a secret and a `user:password[:perm|perm]` list
    ///
    /// Users without explicit permissions get `read`.
    pub fn from_parts(secret: &str, users: &str) -> Result<Self, AuthError> {
        if secret.len() < Self::MIN_SECRET_LEN {
            return Err(AuthError::InvalidSecret(format!(
                "secret must be at least {} characters",
                Self::MIN_SECRET_LEN
            )));
        }

        let mut auth = Self::new(secret);
        for user_entry in users.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let parts: Vec<&str> = user_entry.split(':').collect();
            if parts.len() < 2 {
                tracing::warn!(entry = user_entry, "ignoring malformed user entry");
                continue;
            }
            let permissions = match parts.get(2) {
                Some(perms) => perms.split('|').map(|s| s.to_string()).collect(),
                None => vec!["read".to_string()],
            };
            auth.add_user(parts[0], parts[1], permissions)?;
        }
        Ok(auth)
    }

    /// Add a user with password and permissions
    pub fn add_user(
        &mut self,
        username: &str,
        password: &str,
        permissions: Vec<String>,
    ) -> Result<(), AuthError> {
        let password_hash =
            hash(password, DEFAULT_COST).map_err(|e| AuthError::HashError(e.to_string()))?;

        self.users.insert(
            username.to_string(),
            UserInfo {
                username: username.to_string(),
                password_hash,
                permissions,
            },
        );

        Ok(())
    }

    /// Authenticate user with username/password
    pub fn check_password(&self, username: &str, password: &str) -> Result<&UserInfo, AuthError> {
        let user = self.users.get(username).ok_or(AuthError::InvalidCredentials)?;

        if verify(password, &user.password_hash).unwrap_or(false) {
            Ok(user)
        } else {
            Err(AuthError::InvalidCredentials)
        }
    }

    /// Validate a token and return claims
    pub fn validate_token(&self, token: &str) -> Result<Claims, AuthError> {
        let token_data: TokenData<Claims> =
            decode(token, &self.decoding_key, &Validation::default())
                .map_err(|e| AuthError::TokenError(e.to_string()))?;

        if token_data.claims.is_expired() {
            return Err(AuthError::TokenExpired);
        }

        Ok(token_data.claims)
    }

    /// Get user count
    pub fn user_count(&self) -> usize {
        self.users.len()
    }
}

impl Authenticator for JwtAuth {
    fn authenticate(&self, credential: &Value) -> Result<PeerIdentity, AuthError> {
        if let Some(token) = credential.get("token").and_then(|t| t.as_str()) {
            let token = token.strip_prefix("Bearer ").unwrap_or(token);
            return Ok(self.validate_token(token)?.to_identity());
        }

        let username = credential.get("username").and_then(|u| u.as_str());
        let password = credential.get("password").and_then(|p| p.as_str());
        match (username, password) {
            (Some(username), Some(password)) => {
                let user = self.check_password(username, password)?;
                Ok(PeerIdentity::new(
                    user.username.clone(),
                    json!({ "sub": user.username, "permissions": user.permissions }),
                ))
            }
            _ => Err(AuthError::MissingToken),
        }
    }
}

impl std::fmt::Debug for JwtAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtAuth")
            .field("users", &self.users.len())
            .finish()
    }
}

/// Authentication errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("invalid username or password")]
    InvalidCredentials,
    #[error("invalid secret: {0}")]
    InvalidSecret(String),
    #[error("token error: {0}")]
    TokenError(String),
    #[error("token has expired")]
    TokenExpired,
    #[error("hash error: {0}")]
    HashError(String),
    #[error("missing credential: expected token or username/password")]
    MissingToken,
    /// Rejected by a custom authenticator or the `identify` hook
    #[error("rejected: {0}")]
    Rejected(String),
}
