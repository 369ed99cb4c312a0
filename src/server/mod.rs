//! Replication server
//!
//! Owns the primary store handle, the metadata store, change capture, the
//! optional secure channel gate and any running drivers. Each accepted
//! connection runs one RPC session in its own task.
//!
//! ```text
//! accept ──► Connection ──► [gate: TLS + identify] ──► RpcSession ──► ServiceSurface
//! ```

mod handlers;
mod service;
mod session;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

use crate::config::{Listen, ServerConfig};
use crate::error::{ReplicationError, ReplicationResult};
use crate::events::{EventBus, ServerEvent};
use crate::replication::{
    ChangeCaptureLog, DriverHandle, ReplicationDriver, ReplicationMetadataStore, ReplicationPeer,
};
use crate::security::{CredentialBundle, SecureChannelGate};
use crate::storage::{KvStore, ObservableStore, Store};
use crate::types::PeerIdentity;

pub use service::ServiceSurface;
pub use session::serve;

/// Serves one raw connection, through the gate when secure mode is on
#[derive(Clone)]
pub struct ConnectionHandler {
    service: Arc<ServiceSurface>,
    gate: Option<Arc<SecureChannelGate>>,
    events: EventBus,
}

impl ConnectionHandler {
    pub fn is_secure(&self) -> bool {
        self.gate.is_some()
    }

    /// Run the connection to completion; failures go to the error channel
    pub async fn handle<S>(&self, stream: S, remote: String)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        tracing::debug!(%remote, "connection accepted");
        self.events.emit(ServerEvent::Connection {
            remote: remote.clone(),
        });

        let result = match &self.gate {
            Some(gate) => match gate.accept(stream).await {
                Ok((tls, peer)) => {
                    tracing::info!(%remote, peer = %peer.subject, "peer identified");
                    self.events.emit(ServerEvent::Identified { peer: peer.clone() });
                    serve(self.service.clone(), tls, peer).await
                }
                Err(e) => {
                    tracing::warn!(%remote, error = %e, "connection rejected");
                    self.events.emit(ServerEvent::Rejected {
                        remote,
                        reason: e.to_string(),
                    });
                    return;
                }
            },
            None => serve(self.service.clone(), stream, PeerIdentity::anonymous()).await,
        };

        if let Err(e) = result {
            self.events.error("connection", &e);
        }
    }
}

impl std::fmt::Debug for ConnectionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandler")
            .field("secure", &self.is_secure())
            .finish()
    }
}

#[derive(Default)]
struct Lifecycle {
    started: bool,
    closed: bool,
    local_addr: Option<SocketAddr>,
    shutdown: Option<watch::Sender<bool>>,
    acceptor: Option<JoinHandle<()>>,
    drivers: Vec<DriverHandle>,
}

/// A replication server bound to one primary store
pub struct ReplicationServer {
    config: Arc<ServerConfig>,
    primary: Arc<dyn ObservableStore>,
    metadata: Arc<ReplicationMetadataStore>,
    events: EventBus,
    service: Arc<ServiceSurface>,
    handler: ConnectionHandler,
    capture: ChangeCaptureLog,
    lifecycle: Mutex<Lifecycle>,
}

impl ReplicationServer {
    /// Validate the configuration and wire the components together
    ///
    /// Nothing is bound here; configuration errors surface before any
    /// socket exists.
    pub fn new(
        primary: Arc<dyn ObservableStore>,
        metadata_store: Arc<dyn KvStore>,
        config: ServerConfig,
    ) -> ReplicationResult<Self> {
        config.validate()?;

        let gate = match (&config.pems, &config.identify) {
            (Some(dir), Some(identify)) => {
                let bundle = CredentialBundle::load(dir)?;
                tracing::info!(pems = %dir.display(), "secure mode enabled");
                Some(Arc::new(SecureChannelGate::new(&bundle, identify.clone())?))
            }
            (Some(_), None) => {
                return Err(ReplicationError::Config(
                    "a secure connection requires an identify callback".to_string(),
                ));
            }
            (None, _) => {
                tracing::warn!("no credential bundle configured; serving peers unauthenticated");
                None
            }
        };

        let sep = config.resolve_separator(primary.as_ref());
        let metadata = Arc::new(ReplicationMetadataStore::new(metadata_store, &sep)?);
        let events = EventBus::with_capacity(config.event_capacity);

        let service = Arc::new(ServiceSurface::new(
            primary.clone(),
            metadata.clone(),
            events.clone(),
            config.access.clone(),
            config.auth.clone(),
        ));
        let capture = ChangeCaptureLog::attach(
            primary.clone(),
            metadata.clone(),
            events.clone(),
            config.capture,
        );
        let handler = ConnectionHandler {
            service: service.clone(),
            gate,
            events: events.clone(),
        };

        Ok(Self {
            config: Arc::new(config),
            primary,
            metadata,
            events,
            service,
            handler,
            capture,
            lifecycle: Mutex::new(Lifecycle::default()),
        })
    }

    /// Open durable stores under the given directories
    pub fn open<P: AsRef<Path>, M: AsRef<Path>>(
        primary_dir: P,
        metadata_dir: M,
        config: ServerConfig,
    ) -> ReplicationResult<Self> {
        config.validate()?;
        let primary = Arc::new(Store::open(primary_dir)?);
        let sep = config.resolve_separator(primary.as_ref());
        let metadata = Arc::new(Store::open_with(
            crate::storage::StoreConfig::new(metadata_dir).with_separator(sep),
        )?);
        Self::new(primary, metadata, config)
    }

    /// Write the version marker, then bind (unless skipped)
    ///
    /// Emits `Listening` with the bound port before `Ready`. Returns the
    /// bound address.
    pub async fn start(&self) -> ReplicationResult<Option<SocketAddr>> {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.closed {
                return Err(ReplicationError::Closed);
            }
            if lifecycle.started {
                return Err(ReplicationError::Config("server already started".to_string()));
            }
            lifecycle.started = true;
        }

        let version = self.metadata.write_version(&self.config.version)?;
        tracing::info!(%version, "version marker written");

        let port = match self.config.listen {
            Listen::Skip => {
                tracing::info!("listening skipped; connections are served by the caller");
                self.events.emit(ServerEvent::Ready {
                    service: self.service.clone(),
                });
                return Ok(None);
            }
            Listen::Port(port) => port,
        };

        let listener = TcpListener::bind((self.config.host.as_str(), port)).await?;
        let addr = listener.local_addr()?;

        // `close` may have run while binding; it must stay the last event
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.closed {
                tracing::debug!(%addr, "closed while binding; dropping listener");
                return Err(ReplicationError::Closed);
            }
            tracing::info!(%addr, secure = self.handler.is_secure(), "listening");
            self.events.emit(ServerEvent::Listening { port: addr.port() });

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let acceptor = tokio::spawn(accept_loop(listener, self.handler.clone(), shutdown_rx));
            lifecycle.local_addr = Some(addr);
            lifecycle.shutdown = Some(shutdown_tx);
            lifecycle.acceptor = Some(acceptor);

            self.events.emit(ServerEvent::Ready {
                service: self.service.clone(),
            });
        }
        Ok(Some(addr))
    }

    /// A driver over this server's stores, for running cycles by hand
    pub fn driver(&self) -> ReplicationDriver {
        ReplicationDriver::new(
            self.primary.clone(),
            self.metadata.clone(),
            self.events.clone(),
            self.config.driver.clone(),
            self.config.version.clone(),
        )
    }

    /// Start pulling from `peer` on the configured interval
    pub fn replicate_from<P: ReplicationPeer + 'static>(&self, peer: P) -> ReplicationResult<()> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.closed {
            return Err(ReplicationError::Closed);
        }
        lifecycle.drivers.push(self.driver().spawn(peer));
        Ok(())
    }

    /// Shut down in order: drivers, listener and sessions, capture, primary
    /// store, metadata store, then `Closed`. Later calls do nothing.
    ///
    /// A failing store close is reported on the error channel and returned,
    /// after the remaining steps have run and `Closed` has been emitted.
    pub async fn close(&self) -> ReplicationResult<()> {
        let (drivers, shutdown, acceptor) = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.closed {
                return Ok(());
            }
            lifecycle.closed = true;
            (
                std::mem::take(&mut lifecycle.drivers),
                lifecycle.shutdown.take(),
                lifecycle.acceptor.take(),
            )
        };

        for driver in drivers {
            tracing::debug!(peer = %driver.peer(), "stopping driver");
            driver.stop().await;
        }

        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(true);
        }
        if let Some(acceptor) = acceptor {
            if let Err(e) = acceptor.await {
                if e.is_panic() {
                    tracing::error!("accept loop panicked");
                }
            }
        }

        self.capture.detach();

        // Every store gets closed even when an earlier one fails
        let mut first_error = None;
        if let Err(e) = self.primary.close() {
            let err = ReplicationError::from(e);
            self.events.error("close", &err);
            first_error.get_or_insert(err);
        }
        if let Err(e) = self.metadata.close() {
            self.events.error("close", &e);
            first_error.get_or_insert(e);
        }

        tracing::info!(clean = first_error.is_none(), "replication server closed");
        self.events.emit(ServerEvent::Closed);
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lifecycle.lock().closed
    }

    /// Bound address once started with a port
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lifecycle.lock().local_addr
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn service(&self) -> &Arc<ServiceSurface> {
        &self.service
    }

    pub fn metadata(&self) -> &Arc<ReplicationMetadataStore> {
        &self.metadata
    }

    pub fn primary(&self) -> &Arc<dyn ObservableStore> {
        &self.primary
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Handler for connections the caller accepts itself (`Listen::Skip`)
    pub fn connection_handler(&self) -> ConnectionHandler {
        self.handler.clone()
    }
}

impl std::fmt::Debug for ReplicationServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationServer")
            .field("config", &self.config)
            .field("local_addr", &self.local_addr())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Accept until shutdown, then abort every live session
async fn accept_loop(listener: TcpListener, handler: ConnectionHandler, mut shutdown: watch::Receiver<bool>) {
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let _ = stream.set_nodelay(true);
                    let handler = handler.clone();
                    sessions.spawn(async move { handler.handle(stream, addr.to_string()).await });
                }
                Err(e) => {
                    handler.events.error("accept", &e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            _ = shutdown.changed() => break,
        }
    }

    tracing::debug!(sessions = sessions.len(), "closing live sessions");
    sessions.abort_all();
    while sessions.join_next().await.is_some() {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AccessFn;
    use serde_json::{json, Value};
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn server(config: ServerConfig) -> (Arc<Store>, Arc<Store>, ReplicationServer) {
        let primary = Arc::new(Store::in_memory());
        let metadata = Arc::new(Store::in_memory());
        let server = ReplicationServer::new(primary.clone(), metadata.clone(), config).unwrap();
        (primary, metadata, server)
    }

    #[tokio::test]
    async fn test_skip_listen_emits_ready_only() {
        let (_, _, server) = server(ServerConfig::new().skip_listen().with_version("1.0.0"));
        let mut rx = server.events().subscribe();

        assert_eq!(server.start().await.unwrap(), None);
        assert!(server.local_addr().is_none());
        assert_eq!(rx.recv().await.unwrap().event.name(), "ready");
        assert_eq!(server.metadata().version().unwrap().as_deref(), Some("1.0.0"));
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let (_, _, server) = server(ServerConfig::new().skip_listen());
        server.start().await.unwrap();
        assert!(matches!(server.start().await, Err(ReplicationError::Config(_))));
    }

    #[tokio::test]
    async fn test_listening_precedes_ready() {
        let (_, _, server) = server(ServerConfig::new().with_host("127.0.0.1").with_port(0));
        let mut rx = server.events().subscribe();

        let addr = server.start().await.unwrap().unwrap();
        match rx.recv().await.unwrap().event {
            ServerEvent::Listening { port } => assert_eq!(port, addr.port()),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(rx.recv().await.unwrap().event.name(), "ready");
        server.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_order_and_idempotence() {
        let (primary, metadata, server) = server(ServerConfig::new().skip_listen());
        server.start().await.unwrap();
        let mut rx = server.events().subscribe();

        server.close().await.unwrap();
        assert!(primary.is_closed());
        assert!(metadata.is_closed());
        assert_eq!(rx.recv().await.unwrap().event.name(), "closed");

        server.close().await.unwrap();
        assert!(rx.try_recv().is_err());
        assert!(matches!(server.start().await, Err(ReplicationError::Closed)));
    }

    #[tokio::test]
    async fn test_manual_connection_handling() {
        let access: AccessFn = Arc::new(|_: &PeerIdentity, _: &str, _: &Value| true);
        let mut config = ServerConfig::new().skip_listen();
        config.access = access;
        let (primary, _, server) = server(config);
        server.start().await.unwrap();
        primary.put("a", json!("x")).unwrap();

        let (client, conn) = duplex(4096);
        let handler = server.connection_handler();
        assert!(!handler.is_secure());
        let task = tokio::spawn(async move { handler.handle(conn, "memory".to_string()).await });

        let (read_half, mut write_half) = tokio::io::split(client);
        write_half
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"fetch\",\"params\":{\"key\":\"a\"}}\n")
            .await
            .unwrap();
        let mut lines = BufReader::new(read_half).lines();
        let response: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(response["result"], "x");

        write_half.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[test]
    fn test_secure_mode_without_identify_fails_construction() {
        let dir = tempfile::tempdir().unwrap();
        let primary = Arc::new(Store::in_memory());
        let result = ReplicationServer::new(
            primary,
            Arc::new(Store::in_memory()),
            ServerConfig::new().with_pems(dir.path()),
        );
        assert!(matches!(result, Err(ReplicationError::Config(_))));
    }
}
