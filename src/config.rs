//! Server configuration
//!
//! Options are resolved once, before the server is constructed, and shared
//! read-only afterwards.
//!
//! ## Environment
//! ```bash
//! REPLICATOR_PORT=8000                # listen port (0 picks a free port)
//! REPLICATOR_LISTEN=skip              # construct without binding a socket
//! REPLICATOR_HOST=0.0.0.0             # bind address
//! REPLICATOR_SEP='!'                  # key separator for metadata partitions
//! REPLICATOR_PEMS=/etc/replicator     # cert.pem, key.pem, ca.pem; enables mTLS
//! REPLICATOR_INTERVAL_MS=1000         # replication period
//! REPLICATOR_BATCH_SIZE=512           # change records pulled per request
//! REPLICATOR_CAPTURE_REPLICATED=false # re-capture writes applied from peers
//! REPLICATOR_ON_INCOMPATIBLE=skip     # or `proceed`
//! REPLICATOR_JWT_SECRET=...           # enables JWT `auth` (see security)
//! REPLICATOR_DATA_DIR=data            # binary only
//! REPLICATOR_PEER=10.0.0.2:8000       # binary only: peer to pull from
//! REPLICATOR_PEER_CREDENTIAL='{...}'  # binary only: sent with `auth`
//! ```

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::error::{ReplicationError, ReplicationResult};
use crate::replication::{CapturePolicy, DriverConfig, DEFAULT_SEPARATOR};
use crate::security::{Authenticator, JwtAuth, PassThroughAuth, SharedAuthenticator};
use crate::storage::KvStore;
use crate::types::PeerIdentity;

/// Default listen port
pub const DEFAULT_PORT: u16 = 8000;

/// Access predicate: (peer, method, params) -> allowed
pub type AccessFn = Arc<dyn Fn(&PeerIdentity, &str, &Value) -> bool + Send + Sync>;

/// Identification hook run after a successful secure handshake
pub type IdentifyFn = Arc<dyn Fn(&PeerIdentity) -> bool + Send + Sync>;

/// Where the server listens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Listen {
    Port(u16),
    /// Construct without binding; the caller serves connections manually
    Skip,
}

impl Default for Listen {
    fn default() -> Self {
        Listen::Port(DEFAULT_PORT)
    }
}

/// Resolved server options
#[derive(Clone)]
pub struct ServerConfig {
    /// Key separator; falls back to the primary store's, then `\u{ff}`
    pub sep: Option<String>,
    /// Credential bundle directory; enables secure mode
    pub pems: Option<PathBuf>,
    pub access: AccessFn,
    pub auth: SharedAuthenticator,
    /// Mandatory in secure mode
    pub identify: Option<IdentifyFn>,
    pub listen: Listen,
    pub host: String,
    pub capture: CapturePolicy,
    pub driver: DriverConfig,
    /// Version written to the marker at startup
    pub version: String,
    pub event_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            sep: None,
            pems: None,
            access: Arc::new(|_: &PeerIdentity, _: &str, _: &Value| true),
            auth: Arc::new(PassThroughAuth),
            identify: None,
            listen: Listen::default(),
            host: "0.0.0.0".to_string(),
            capture: CapturePolicy::default(),
            driver: DriverConfig::default(),
            version: crate::VERSION.to_string(),
            event_capacity: crate::events::DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sep(mut self, sep: impl Into<String>) -> Self {
        self.sep = Some(sep.into());
        self
    }

    pub fn with_pems(mut self, dir: impl Into<PathBuf>) -> Self {
        self.pems = Some(dir.into());
        self
    }

    pub fn with_access<F>(mut self, access: F) -> Self
    where
        F: Fn(&PeerIdentity, &str, &Value) -> bool + Send + Sync + 'static,
    {
        self.access = Arc::new(access);
        self
    }

    pub fn with_auth<A: Authenticator + 'static>(mut self, auth: A) -> Self {
        self.auth = Arc::new(auth);
        self
    }

    pub fn with_identify<F>(mut self, identify: F) -> Self
    where
        F: Fn(&PeerIdentity) -> bool + Send + Sync + 'static,
    {
        self.identify = Some(Arc::new(identify));
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.listen = Listen::Port(port);
        self
    }

    pub fn skip_listen(mut self) -> Self {
        self.listen = Listen::Skip;
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_capture_policy(mut self, policy: CapturePolicy) -> Self {
        self.capture = policy;
        self
    }

    pub fn with_driver(mut self, driver: DriverConfig) -> Self {
        self.driver = driver;
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn is_secure(&self) -> bool {
        self.pems.is_some()
    }

    /// Reject combinations that must never reach a socket
    pub fn validate(&self) -> ReplicationResult<()> {
        if self.pems.is_some() && self.identify.is_none() {
            return Err(ReplicationError::Config(
                "a secure connection requires an identify callback".to_string(),
            ));
        }
        if self.sep.as_deref() == Some("") {
            return Err(ReplicationError::Config(
                "key separator must not be empty".to_string(),
            ));
        }
        if self.driver.batch_size == 0 {
            return Err(ReplicationError::Config(
                "replication batch size must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Separator for the metadata partitions
    pub fn resolve_separator<S: KvStore + ?Sized>(&self, primary: &S) -> String {
        self.sep
            .clone()
            .or_else(|| primary.separator().map(str::to_string))
            .unwrap_or_else(|| DEFAULT_SEPARATOR.to_string())
    }

    /// Build from `REPLICATOR_*` environment variables
    pub fn from_env() -> ReplicationResult<Self> {
        let mut config = Self::default();

        if let Ok(sep) = std::env::var("REPLICATOR_SEP") {
            config.sep = Some(sep);
        }
        if let Ok(pems) = std::env::var("REPLICATOR_PEMS") {
            config.pems = Some(PathBuf::from(pems));
        }
        if let Ok(host) = std::env::var("REPLICATOR_HOST") {
            config.host = host;
        }

        let skip = std::env::var("REPLICATOR_LISTEN")
            .map(|v| v.eq_ignore_ascii_case("skip"))
            .unwrap_or(false);
        config.listen = if skip {
            Listen::Skip
        } else {
            Listen::Port(env_parse("REPLICATOR_PORT")?.unwrap_or(DEFAULT_PORT))
        };

        if let Some(ms) = env_parse::<u64>("REPLICATOR_INTERVAL_MS")? {
            config.driver.interval = Duration::from_millis(ms.max(1));
        }
        if let Some(batch) = env_parse::<usize>("REPLICATOR_BATCH_SIZE")? {
            config.driver.batch_size = batch;
        }
        if let Some(capture) = env_parse::<bool>("REPLICATOR_CAPTURE_REPLICATED")? {
            config.capture.capture_replicated = capture;
        }
        if let Ok(policy) = std::env::var("REPLICATOR_ON_INCOMPATIBLE") {
            config.driver.on_incompatible = policy.parse().map_err(ReplicationError::Config)?;
        }

        if let Some(jwt) = JwtAuth::from_env().map_err(|e| ReplicationError::Config(e.to_string()))? {
            config.auth = Arc::new(jwt);
        }

        Ok(config)
    }
}

/// Parse an optional environment variable
fn env_parse<T>(name: &str) -> ReplicationResult<Option<T>>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| ReplicationError::Config(format!("{}={}: {}", name, raw, e))),
        Err(_) => Ok(None),
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("sep", &self.sep)
            .field("pems", &self.pems)
            .field("identify", &self.identify.is_some())
            .field("listen", &self.listen)
            .field("host", &self.host)
            .field("capture", &self.capture)
            .field("driver", &self.driver)
            .field("version", &self.version)
            .finish()
    }
}

/// Process-level options used only by the binary
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub data_dir: PathBuf,
    /// `host:port` of the peer to replicate from
    pub peer: Option<String>,
    /// Credential sent with `auth` after connecting to the peer
    pub peer_credential: Option<Value>,
}

impl RuntimeOptions {
    pub fn from_env() -> ReplicationResult<Self> {
        let peer_credential = match std::env::var("REPLICATOR_PEER_CREDENTIAL") {
            Ok(raw) => Some(serde_json::from_str(&raw).map_err(|e| {
                ReplicationError::Config(format!("REPLICATOR_PEER_CREDENTIAL: {}", e))
            })?),
            Err(_) => None,
        };

        Ok(Self {
            data_dir: std::env::var("REPLICATOR_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data")),
            peer: std::env::var("REPLICATOR_PEER").ok().filter(|p| !p.is_empty()),
            peer_credential,
        })
    }

    pub fn primary_dir(&self) -> PathBuf {
        self.data_dir.join("primary")
    }

    pub fn metadata_dir(&self) -> PathBuf {
        self.data_dir.join("replication-set")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::IncompatiblePolicy;
    use crate::storage::{Store, StoreConfig};
    use serde_json::json;

    #[test]
    fn test_secure_mode_requires_identify() {
        let config = ServerConfig::new().with_pems("/tmp/pems");
        assert!(matches!(config.validate(), Err(ReplicationError::Config(_))));

        let config = config.with_identify(|_| true);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.listen, Listen::Port(DEFAULT_PORT));
        assert!(!config.is_secure());
        assert!(!config.capture.capture_replicated);
        assert_eq!(config.driver.on_incompatible, IncompatiblePolicy::Skip);
        assert!((config.access)(&PeerIdentity::anonymous(), "fetch", &json!({"key": "a"})));
    }

    #[test]
    fn test_separator_resolution() {
        let plain = Store::in_memory();
        let with_sep = Store::open_with(StoreConfig::default().with_separator("#")).unwrap();

        assert_eq!(ServerConfig::new().resolve_separator(&plain), DEFAULT_SEPARATOR);
        assert_eq!(ServerConfig::new().resolve_separator(&with_sep), "#");
        assert_eq!(ServerConfig::new().with_sep("!").resolve_separator(&with_sep), "!");
    }

    #[test]
    fn test_empty_separator_rejected() {
        assert!(ServerConfig::new().with_sep("").validate().is_err());
    }
}
