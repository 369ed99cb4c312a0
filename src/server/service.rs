//! ServiceSurface - the operations a peer can invoke
//!
//! Every data method takes the caller's [`PeerIdentity`] and consults the
//! `access` predicate before touching a store. Denials are errors, never
//! empty results.

use std::sync::Arc;

use futures::Stream;
use serde_json::{json, Value};

use crate::config::AccessFn;
use crate::error::{ReplicationError, ReplicationResult};
use crate::events::{EventBus, ServerEvent};
use crate::protocol::Method;
use crate::replication::{ReadStreamOptions, ReplicationMetadataStore};
use crate::security::SharedAuthenticator;
use crate::storage::{KvStore, ObservableStore};
use crate::types::{ChangeRecord, PeerIdentity};

/// Remotely invokable replication API bound to one server's stores
pub struct ServiceSurface {
    primary: Arc<dyn ObservableStore>,
    metadata: Arc<ReplicationMetadataStore>,
    events: EventBus,
    access: AccessFn,
    auth: SharedAuthenticator,
}

impl ServiceSurface {
    pub fn new(
        primary: Arc<dyn ObservableStore>,
        metadata: Arc<ReplicationMetadataStore>,
        events: EventBus,
        access: AccessFn,
        auth: SharedAuthenticator,
    ) -> Self {
        Self {
            primary,
            metadata,
            events,
            access,
            auth,
        }
    }

    /// Run the `access` predicate for methods that require it
    pub fn check_access(&self, peer: &PeerIdentity, method: Method, params: &Value) -> ReplicationResult<()> {
        if !method.requires_access() || (self.access)(peer, method.name(), params) {
            return Ok(());
        }
        tracing::info!(peer = %peer.subject, method = %method, "access denied");
        Err(ReplicationError::AccessDenied {
            method: method.name().to_string(),
        })
    }

    /// Current value of `key` in the primary store
    pub fn fetch(&self, peer: &PeerIdentity, key: &str) -> ReplicationResult<Value> {
        self.check_access(peer, Method::Fetch, &json!({ "key": key }))?;
        self.events.emit(ServerEvent::Fetch {
            key: key.to_string(),
        });

        match self.primary.get(key) {
            Ok(Some(value)) => Ok(value),
            Ok(None) => Err(ReplicationError::NotFound(key.to_string())),
            Err(e) => {
                let err = ReplicationError::from(e);
                self.events.error("fetch", &err);
                Err(err)
            }
        }
    }

    /// Version marker of this server
    pub fn version(&self, peer: &PeerIdentity) -> ReplicationResult<String> {
        self.check_access(peer, Method::Version, &Value::Null)?;

        let result = self.metadata.version().and_then(|marker| {
            marker.ok_or_else(|| ReplicationError::NotFound("version".to_string()))
        });
        if let Err(e) = &result {
            self.events.error("version", e);
        }
        result
    }

    /// Ascending stream over the change log
    pub fn create_read_stream(
        &self,
        peer: &PeerIdentity,
        options: ReadStreamOptions,
    ) -> ReplicationResult<impl Stream<Item = ReplicationResult<ChangeRecord>> + Send + 'static> {
        self.check_access(peer, Method::CreateReadStream, &serde_json::to_value(options)?)?;
        Ok(self.metadata.changes(options))
    }

    /// Verify a credential, keeping the transport fingerprint if any
    pub fn authenticate(&self, current: &PeerIdentity, credential: &Value) -> ReplicationResult<PeerIdentity> {
        let identity = self.auth.authenticate(credential)?;
        tracing::info!(peer = %identity.subject, "peer authenticated");
        Ok(identity.with_fingerprint(current.fingerprint.clone()))
    }

    pub fn primary(&self) -> &Arc<dyn ObservableStore> {
        &self.primary
    }

    pub fn metadata(&self) -> &Arc<ReplicationMetadataStore> {
        &self.metadata
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }
}

impl std::fmt::Debug for ServiceSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceSurface")
            .field("metadata", &self.metadata)
            .finish()
    }
}
