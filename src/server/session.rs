//! RPC session over one connection
//!
//! Reads newline-delimited JSON-RPC requests and answers them in order.
//! The byte stream may be a raw TCP socket, a TLS stream, or an in-memory
//! duplex pipe.

use std::sync::Arc;

use futures::StreamExt;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};

use super::handlers::{extract_params, identity_response, stream_done};
use super::ServiceSurface;
use crate::error::{ReplicationError, ReplicationResult};
use crate::protocol::{
    FetchParams, JsonRpcError, JsonRpcRequest, JsonRpcResponse, JsonRpcStreamItem, Method,
};
use crate::replication::ReadStreamOptions;
use crate::types::PeerIdentity;

/// One connection's RPC session
struct RpcSession<W> {
    service: Arc<ServiceSurface>,
    peer: PeerIdentity,
    writer: BufWriter<W>,
}

/// Serve `stream` with the given starting identity until the peer disconnects
pub async fn serve<S>(service: Arc<ServiceSurface>, stream: S, peer: PeerIdentity) -> ReplicationResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut session = RpcSession {
        service,
        peer,
        writer: BufWriter::new(write_half),
    };
    session.serve(BufReader::new(read_half)).await
}

impl<W: AsyncWrite + Unpin> RpcSession<W> {
    async fn serve<R: AsyncRead + Unpin>(&mut self, reader: BufReader<R>) -> ReplicationResult<()> {
        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await? {
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                self.handle_request(trimmed).await?;
            }
        }
        tracing::debug!(peer = %self.peer.subject, "session ended");
        Ok(())
    }

    /// Handle a single JSON-RPC request
    async fn handle_request(&mut self, request_str: &str) -> ReplicationResult<()> {
        let request: JsonRpcRequest = match serde_json::from_str(request_str) {
            Ok(req) => req,
            Err(e) => {
                return self
                    .send(&JsonRpcError::parse_error(Value::Null, e.to_string()))
                    .await;
            }
        };

        if !request.is_valid() {
            return self
                .send(&JsonRpcError::invalid_request(
                    request.id.unwrap_or(Value::Null),
                    "jsonrpc must be '2.0'".to_string(),
                ))
                .await;
        }

        if request.is_notification() {
            tracing::debug!(method = %request.method, "ignoring notification");
            return Ok(());
        }

        let id = request.id.clone().unwrap_or(Value::Null);
        let method = match request.method.parse::<Method>() {
            Ok(method) => method,
            Err(name) => return self.send(&JsonRpcError::method_not_found(id, name)).await,
        };
        let params = request.params.unwrap_or(Value::Null);

        match self.dispatch(id.clone(), method, &params).await {
            Ok(()) => Ok(()),
            Err(ReplicationError::Io(e)) => Err(ReplicationError::Io(e)),
            Err(ReplicationError::Json(e)) => {
                self.send(&JsonRpcError::invalid_params(id, e.to_string())).await
            }
            Err(e) => {
                tracing::debug!(method = %method, error = %e, "request failed");
                self.send(&JsonRpcError::from_error(id, &e)).await
            }
        }
    }

    async fn dispatch(&mut self, id: Value, method: Method, params: &Value) -> ReplicationResult<()> {
        let result = match method {
            Method::Fetch => {
                let FetchParams { key } = extract_params(params)?;
                self.service.fetch(&self.peer, &key)?
            }
            Method::Version => Value::String(self.service.version(&self.peer)?),
            Method::CreateReadStream => {
                let options: ReadStreamOptions = extract_params(params)?;
                return self.stream_changes(id, options).await;
            }
            Method::Auth => {
                let identity = self.service.authenticate(&self.peer, params)?;
                let response = identity_response(&identity);
                self.peer = identity;
                response
            }
            Method::Methods => Method::describe(),
            Method::Ping => json!({}),
        };

        self.send(&JsonRpcResponse::new(id, result)).await
    }

    /// Write every record as a stream item, then the terminating response
    async fn stream_changes(&mut self, id: Value, options: ReadStreamOptions) -> ReplicationResult<()> {
        let stream = self.service.create_read_stream(&self.peer, options)?;
        futures::pin_mut!(stream);

        let mut count = 0;
        while let Some(record) = stream.next().await {
            let record = match record {
                Ok(record) => record,
                Err(e) => {
                    self.service.events().error("createReadStream", &e);
                    return self.send(&JsonRpcError::from_error(id, &e)).await;
                }
            };
            let item = JsonRpcStreamItem::new(id.clone(), serde_json::to_value(&record)?);
            self.write_frame(&item).await?;
            count += 1;
        }

        self.send(&JsonRpcResponse::new(id, stream_done(count))).await
    }

    async fn write_frame<T: Serialize>(&mut self, frame: &T) -> ReplicationResult<()> {
        let mut line = serde_json::to_vec(frame)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        Ok(())
    }

    /// Write a final frame and flush
    async fn send<T: Serialize>(&mut self, frame: &T) -> ReplicationResult<()> {
        self.write_frame(frame).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AccessFn;
    use crate::events::EventBus;
    use crate::replication::{ReplicationMetadataStore, DEFAULT_SEPARATOR};
    use crate::security::PassThroughAuth;
    use crate::error::codes;
    use crate::storage::{KvStore, Store};
    use tokio::io::duplex;

    fn service(access: AccessFn) -> (Arc<Store>, Arc<ServiceSurface>) {
        let primary = Arc::new(Store::in_memory());
        let metadata = Arc::new(ReplicationMetadataStore::in_memory(DEFAULT_SEPARATOR).unwrap());
        metadata.write_version("1.3.0").unwrap();
        let service = ServiceSurface::new(
            primary.clone(),
            metadata,
            EventBus::new(),
            access,
            Arc::new(PassThroughAuth),
        );
        (primary, Arc::new(service))
    }

    /// Send request lines and collect every response line until EOF
    async fn exchange(service: Arc<ServiceSurface>, requests: &[&str]) -> Vec<Value> {
        let (client, server) = duplex(64 * 1024);
        let task = tokio::spawn(serve(service, server, PeerIdentity::anonymous()));

        let (read_half, mut write_half) = tokio::io::split(client);
        for request in requests {
            write_half.write_all(request.as_bytes()).await.unwrap();
            write_half.write_all(b"\n").await.unwrap();
        }
        write_half.shutdown().await.unwrap();

        let mut lines = BufReader::new(read_half).lines();
        let mut frames = Vec::new();
        while let Some(line) = lines.next_line().await.unwrap() {
            frames.push(serde_json::from_str(&line).unwrap());
        }
        task.await.unwrap().unwrap();
        frames
    }

    fn allow_all() -> AccessFn {
        Arc::new(|_: &PeerIdentity, _: &str, _: &Value| true)
    }

    #[tokio::test]
    async fn test_fetch_and_version() {
        let (primary, service) = service(allow_all());
        primary.put("a", json!({"v": 1})).unwrap();

        let frames = exchange(
            service,
            &[
                r#"{"jsonrpc":"2.0","id":1,"method":"fetch","params":{"key":"a"}}"#,
                r#"{"jsonrpc":"2.0","id":2,"method":"fetch","params":{"key":"missing"}}"#,
                r#"{"jsonrpc":"2.0","id":3,"method":"version"}"#,
            ],
        )
        .await;

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0]["result"], json!({"v": 1}));
        assert_eq!(frames[1]["error"]["code"], codes::NOT_FOUND);
        assert_eq!(frames[1]["error"]["data"]["key"], "missing");
        assert_eq!(frames[2]["result"], "1.3.0");
    }

    #[tokio::test]
    async fn test_stream_items_then_done() {
        let (primary, service) = service(allow_all());
        primary.put("a", json!(1)).unwrap();
        service.metadata().append_change(crate::types::ChangeType::Put, "a").unwrap();
        service.metadata().append_change(crate::types::ChangeType::Delete, "a").unwrap();

        let frames = exchange(
            service,
            &[r#"{"jsonrpc":"2.0","id":9,"method":"createReadStream"}"#],
        )
        .await;

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0]["item"]["type"], "put");
        assert_eq!(frames[1]["item"]["type"], "delete");
        assert_eq!(frames[1]["id"], 9);
        assert_eq!(frames[2]["result"], json!({"done": true, "count": 2}));
    }

    #[tokio::test]
    async fn test_protocol_errors() {
        let (_, service) = service(allow_all());

        let frames = exchange(
            service,
            &[
                "not json",
                r#"{"jsonrpc":"1.0","id":1,"method":"ping"}"#,
                r#"{"jsonrpc":"2.0","id":2,"method":"drop"}"#,
                r#"{"jsonrpc":"2.0","id":3,"method":"fetch","params":{"nokey":1}}"#,
                r#"{"jsonrpc":"2.0","method":"ping"}"#,
                r#"{"jsonrpc":"2.0","id":4,"method":"ping"}"#,
            ],
        )
        .await;

        assert_eq!(frames.len(), 5);
        assert_eq!(frames[0]["error"]["code"], codes::PARSE_ERROR);
        assert_eq!(frames[1]["error"]["code"], codes::INVALID_REQUEST);
        assert_eq!(frames[2]["error"]["code"], codes::METHOD_NOT_FOUND);
        assert_eq!(frames[3]["error"]["code"], codes::INVALID_PARAMS);
        assert_eq!(frames[4]["id"], 4);
        assert_eq!(frames[4]["result"], json!({}));
    }

    #[tokio::test]
    async fn test_denied_but_session_plumbing_allowed() {
        let (primary, service) = service(Arc::new(|_: &PeerIdentity, _: &str, _: &Value| false));
        primary.put("a", json!(1)).unwrap();

        let frames = exchange(
            service,
            &[
                r#"{"jsonrpc":"2.0","id":1,"method":"fetch","params":{"key":"a"}}"#,
                r#"{"jsonrpc":"2.0","id":2,"method":"version"}"#,
                r#"{"jsonrpc":"2.0","id":3,"method":"createReadStream"}"#,
                r#"{"jsonrpc":"2.0","id":4,"method":"methods"}"#,
                r#"{"jsonrpc":"2.0","id":5,"method":"ping"}"#,
            ],
        )
        .await;

        for frame in &frames[..3] {
            assert_eq!(frame["error"]["code"], codes::ACCESS_DENIED);
            assert!(frame.get("result").is_none());
        }
        assert_eq!(frames[3]["result"]["createReadStream"]["type"], "stream");
        assert_eq!(frames[4]["result"], json!({}));
    }

    #[tokio::test]
    async fn test_auth_changes_identity_for_access() {
        let (primary, service) = service(Arc::new(|peer: &PeerIdentity, _: &str, _: &Value| {
            peer.subject == "replica"
        }));
        primary.put("a", json!(1)).unwrap();

        let frames = exchange(
            service,
            &[
                r#"{"jsonrpc":"2.0","id":1,"method":"fetch","params":{"key":"a"}}"#,
                r#"{"jsonrpc":"2.0","id":2,"method":"auth","params":{"username":"replica"}}"#,
                r#"{"jsonrpc":"2.0","id":3,"method":"fetch","params":{"key":"a"}}"#,
            ],
        )
        .await;

        assert_eq!(frames[0]["error"]["code"], codes::ACCESS_DENIED);
        assert_eq!(frames[1]["result"]["subject"], "replica");
        assert_eq!(frames[2]["result"], 1);
    }
}
