//! Peer authentication and authorization
//!
//! Two independent layers protect the service surface:
//!
//! - Transport: with a credential bundle configured, every connection goes
//!   through [`SecureChannelGate`] (mutual TLS, then `identify`) before the
//!   RPC session sees a byte.
//! - Session: the `auth` method runs the configured [`Authenticator`] and
//!   replaces the connection's identity; the `access` predicate is consulted
//!   on every data method.

mod auth;
mod tls;

pub use auth::{
    AuthError, Authenticator, Claims, JwtAuth, PassThroughAuth, SharedAuthenticator, UserInfo,
};
pub use tls::{
    fingerprint, CredentialBundle, SecureChannelGate, SecureConnector, CA_FILE, CERT_FILE,
    HANDSHAKE_TIMEOUT, KEY_FILE,
};
