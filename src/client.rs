//! RPC client for a remote replication server
//!
//! Connects lazily on first use, optionally over mutual TLS, and sends the
//! configured credential with `auth` right after connecting. Requests on
//! one client are serialized over a single connection; a transport or
//! framing failure drops it and the next call reconnects.

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{json, Value};
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, Lines, ReadHalf,
    WriteHalf,
};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::error::{ReplicationError, ReplicationResult};
use crate::protocol::{FetchParams, JsonRpcRequest, Method, ServerFrame};
use crate::replication::{ReadStreamOptions, ReplicationPeer};
use crate::security::SecureConnector;
use crate::types::{ChangeRecord, PeerIdentity, Timestamp};

trait Io: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

type BoxedIo = Box<dyn Io>;

struct Connection {
    lines: Lines<BufReader<ReadHalf<BoxedIo>>>,
    writer: BufWriter<WriteHalf<BoxedIo>>,
}

impl Connection {
    fn new(io: BoxedIo) -> Self {
        let (read_half, write_half) = tokio::io::split(io);
        Self {
            lines: BufReader::new(read_half).lines(),
            writer: BufWriter::new(write_half),
        }
    }

    async fn send(&mut self, request: &JsonRpcRequest) -> ReplicationResult<()> {
        let mut line = serde_json::to_vec(request)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn next_frame(&mut self) -> ReplicationResult<ServerFrame> {
        match self.lines.next_line().await? {
            Some(line) => ServerFrame::parse(&line),
            None => Err(ReplicationError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed by server",
            ))),
        }
    }

    /// Send a request and collect stream items until its final response
    async fn exchange(&mut self, request: JsonRpcRequest) -> ReplicationResult<(Vec<Value>, Value)> {
        let id = request.id.clone().unwrap_or(Value::Null);
        self.send(&request).await?;

        let mut items = Vec::new();
        loop {
            let frame = self.next_frame().await?;
            if frame.id() != &id && !frame.id().is_null() {
                return Err(ReplicationError::Protocol(format!(
                    "response id {} does not match request {}",
                    frame.id(),
                    id
                )));
            }
            match frame {
                ServerFrame::Item { item, .. } => items.push(item),
                ServerFrame::Result { result, .. } => return Ok((items, result)),
                ServerFrame::Error { error, .. } => return Err(error.into_error()),
            }
        }
    }
}

/// Errors after which the connection state is unknown
fn breaks_connection(err: &ReplicationError) -> bool {
    matches!(
        err,
        ReplicationError::Io(_)
            | ReplicationError::Tls(_)
            | ReplicationError::Json(_)
            | ReplicationError::Protocol(_)
    )
}

/// Client side of the replication RPC protocol
pub struct RpcClient {
    addr: String,
    name: String,
    tls: Option<SecureConnector>,
    credential: Option<Value>,
    next_id: AtomicU64,
    connection: Mutex<Option<Connection>>,
}

impl RpcClient {
    /// `addr` is `host:port`; the peer is named after it unless renamed
    pub fn new(addr: impl Into<String>) -> Self {
        let addr = addr.into();
        Self {
            name: addr.clone(),
            addr,
            tls: None,
            credential: None,
            next_id: AtomicU64::new(1),
            connection: Mutex::new(None),
        }
    }

    /// Name used for this peer's watermark
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_tls(mut self, connector: SecureConnector) -> Self {
        self.tls = Some(connector);
        self
    }

    /// Credential sent with `auth` on every new connection
    pub fn with_credential(mut self, credential: Value) -> Self {
        self.credential = Some(credential);
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Host part of the address, checked against the server certificate
    fn host(&self) -> &str {
        let host = self
            .addr
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(&self.addr);
        host.trim_start_matches('[').trim_end_matches(']')
    }

    fn request(&self, method: Method, params: Option<Value>) -> JsonRpcRequest {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        JsonRpcRequest::new(id, method.name(), params)
    }

    async fn connect(&self) -> ReplicationResult<Connection> {
        let tcp = TcpStream::connect(&self.addr).await?;
        tcp.set_nodelay(true)?;

        let io: BoxedIo = match &self.tls {
            Some(connector) => Box::new(connector.connect(self.host(), tcp).await?),
            None => Box::new(tcp),
        };
        let mut connection = Connection::new(io);
        tracing::debug!(addr = %self.addr, secure = self.tls.is_some(), "connected to peer");

        if let Some(credential) = &self.credential {
            let request = self.request(Method::Auth, Some(credential.clone()));
            connection.exchange(request).await?;
            tracing::debug!(addr = %self.addr, "authenticated with peer");
        }
        Ok(connection)
    }

    /// Run one request on the shared connection, connecting if needed
    async fn exchange(&self, method: Method, params: Option<Value>) -> ReplicationResult<(Vec<Value>, Value)> {
        let mut guard = self.connection.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect().await?);
        }
        let Some(connection) = guard.as_mut() else {
            return Err(ReplicationError::Protocol("no connection".to_string()));
        };

        let result = connection.exchange(self.request(method, params)).await;
        if let Err(e) = &result {
            if breaks_connection(e) {
                tracing::debug!(addr = %self.addr, error = %e, "dropping connection");
                *guard = None;
            }
        }
        result
    }

    async fn call(&self, method: Method, params: Option<Value>) -> ReplicationResult<Value> {
        self.exchange(method, params).await.map(|(_, result)| result)
    }

    pub async fn fetch(&self, key: &str) -> ReplicationResult<Value> {
        let params = serde_json::to_value(FetchParams {
            key: key.to_string(),
        })?;
        self.call(Method::Fetch, Some(params)).await
    }

    pub async fn version(&self) -> ReplicationResult<String> {
        match self.call(Method::Version, None).await? {
            Value::String(version) => Ok(version),
            other => Err(ReplicationError::Protocol(format!(
                "version is not a string: {}",
                other
            ))),
        }
    }

    /// Collect a `createReadStream` call
    pub async fn read_stream(&self, options: ReadStreamOptions) -> ReplicationResult<Vec<ChangeRecord>> {
        let (items, done) = self
            .exchange(Method::CreateReadStream, Some(serde_json::to_value(options)?))
            .await?;

        let expected = done.get("count").and_then(Value::as_u64);
        if expected != Some(items.len() as u64) {
            return Err(ReplicationError::Protocol(format!(
                "stream ended with {} but {} items arrived",
                done,
                items.len()
            )));
        }

        items
            .into_iter()
            .map(|item| serde_json::from_value(item).map_err(ReplicationError::from))
            .collect()
    }

    /// Re-authenticate the current connection
    pub async fn auth(&self, credential: Value) -> ReplicationResult<PeerIdentity> {
        let result = self.call(Method::Auth, Some(credential)).await?;
        Ok(serde_json::from_value(result)?)
    }

    pub async fn methods(&self) -> ReplicationResult<Value> {
        self.call(Method::Methods, None).await
    }

    pub async fn ping(&self) -> ReplicationResult<()> {
        self.call(Method::Ping, Some(json!({}))).await.map(|_| ())
    }

    /// Drop the connection; the next call reconnects
    pub async fn disconnect(&self) {
        if let Some(mut connection) = self.connection.lock().await.take() {
            let _ = connection.writer.shutdown().await;
        }
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("addr", &self.addr)
            .field("name", &self.name)
            .field("secure", &self.tls.is_some())
            .finish()
    }
}

impl ReplicationPeer for RpcClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn version(&self) -> ReplicationResult<String> {
        RpcClient::version(self).await
    }

    async fn fetch(&self, key: &str) -> ReplicationResult<Value> {
        RpcClient::fetch(self, key).await
    }

    async fn changes_since(&self, after: Option<Timestamp>, limit: usize) -> ReplicationResult<Vec<ChangeRecord>> {
        self.read_stream(ReadStreamOptions {
            gt: after,
            limit: Some(limit),
        })
        .await
    }
}
