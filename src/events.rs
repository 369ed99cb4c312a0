//! Lifecycle and diagnostic events
//!
//! Each server owns one [`EventBus`]. Components emit [`ServerEvent`]s on it
//! and any number of subscribers receive them in emission order, stamped
//! with a sequence id for gap detection. A slow subscriber that falls more
//! than the channel capacity behind misses events and sees a lag error.

use std::fmt;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::server::ServiceSurface;
use crate::types::PeerIdentity;

/// Default number of buffered events per subscriber
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Events emitted over a server's lifetime
#[derive(Clone)]
pub enum ServerEvent {
    /// Listening socket bound
    Listening { port: u16 },

    /// Server constructed and serving (or ready to be served manually)
    Ready { service: Arc<ServiceSurface> },

    /// Raw connection accepted
    Connection { remote: String },

    /// Secure handshake completed and `identify` accepted the peer
    Identified { peer: PeerIdentity },

    /// Connection refused during the handshake or by `identify`
    Rejected { remote: String, reason: String },

    /// A key was served through `fetch`
    Fetch { key: String },

    /// A peer reported a compatible version
    Compatible { version: String },

    /// A peer reported a version this server cannot replicate from
    Incompatible { local: String, remote: String },

    /// A driver cycle applied changes from a peer
    Replicated {
        peer: String,
        applied: usize,
        watermark: u64,
    },

    /// Background failure routed to the error channel
    Error { context: String, message: String },

    /// Server and both stores closed
    Closed,
}

impl ServerEvent {
    /// Lifecycle name of the event
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Listening { .. } => "listening",
            ServerEvent::Ready { .. } => "ready",
            ServerEvent::Connection { .. } => "connection",
            ServerEvent::Identified { .. } => "identified",
            ServerEvent::Rejected { .. } => "rejected",
            ServerEvent::Fetch { .. } => "fetch",
            ServerEvent::Compatible { .. } => "compatible",
            ServerEvent::Incompatible { .. } => "incompatible",
            ServerEvent::Replicated { .. } => "replicated",
            ServerEvent::Error { .. } => "error",
            ServerEvent::Closed => "closed",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ServerEvent::Error { .. })
    }
}

impl fmt::Debug for ServerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerEvent::Listening { port } => f.debug_struct("Listening").field("port", port).finish(),
            ServerEvent::Ready { .. } => f.write_str("Ready"),
            ServerEvent::Connection { remote } => {
                f.debug_struct("Connection").field("remote", remote).finish()
            }
            ServerEvent::Identified { peer } => {
                f.debug_struct("Identified").field("peer", peer).finish()
            }
            ServerEvent::Rejected { remote, reason } => f
                .debug_struct("Rejected")
                .field("remote", remote)
                .field("reason", reason)
                .finish(),
            ServerEvent::Fetch { key } => f.debug_struct("Fetch").field("key", key).finish(),
            ServerEvent::Compatible { version } => {
                f.debug_struct("Compatible").field("version", version).finish()
            }
            ServerEvent::Incompatible { local, remote } => f
                .debug_struct("Incompatible")
                .field("local", local)
                .field("remote", remote)
                .finish(),
            ServerEvent::Replicated {
                peer,
                applied,
                watermark,
            } => f
                .debug_struct("Replicated")
                .field("peer", peer)
                .field("applied", applied)
                .field("watermark", watermark)
                .finish(),
            ServerEvent::Error { context, message } => f
                .debug_struct("Error")
                .field("context", context)
                .field("message", message)
                .finish(),
            ServerEvent::Closed => f.write_str("Closed"),
        }
    }
}

/// Event wrapper with delivery metadata
#[derive(Clone, Debug)]
pub struct EventEnvelope {
    pub event: ServerEvent,

    /// Monotonically increasing sequence ID for gap detection
    pub sequence_id: u64,

    /// Unix timestamp (milliseconds) when the event was emitted
    pub timestamp: i64,
}

struct BusInner {
    tx: broadcast::Sender<EventEnvelope>,
    /// Guards sequence assignment and send together so ids follow delivery order
    sequence: Mutex<u64>,
}

/// Per-server event channel
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(BusInner {
                tx,
                sequence: Mutex::new(0),
            }),
        }
    }

    /// Emit an event to every current subscriber
    pub fn emit(&self, event: ServerEvent) {
        let mut sequence = self.inner.sequence.lock();
        let envelope = EventEnvelope {
            event,
            sequence_id: *sequence,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        *sequence += 1;
        // No receivers is fine
        let _ = self.inner.tx.send(envelope);
    }

    /// Report a background failure: logged and broadcast as an `error` event
    pub fn error(&self, context: &str, err: &dyn fmt::Display) {
        let message = err.to_string();
        tracing::error!(context = context, error = %message, "replication error");
        self.emit(ServerEvent::Error {
            context: context.to_string(),
            message,
        });
    }

    /// Number of events emitted so far
    pub fn current_sequence_id(&self) -> u64 {
        *self.inner.sequence.lock()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.inner.tx.subscribe()
    }

    /// Subscribe as a stream of events, skipping over lag gaps
    pub fn stream(&self) -> impl Stream<Item = ServerEvent> + Send + 'static {
        BroadcastStream::new(self.subscribe()).filter_map(|item| async move {
            match item {
                Ok(envelope) => Some(envelope.event),
                Err(e) => {
                    tracing::warn!(error = %e, "event subscriber lagged");
                    None
                }
            }
        })
    }

    pub fn receiver_count(&self) -> usize {
        self.inner.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("sequence", &self.current_sequence_id())
            .field("receivers", &self.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_increment() {
        let bus = EventBus::new();
        assert_eq!(bus.current_sequence_id(), 0);

        bus.emit(ServerEvent::Fetch {
            key: "a".to_string(),
        });

        assert_eq!(bus.current_sequence_id(), 1);
    }

    #[tokio::test]
    async fn test_subscribers_see_emission_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit(ServerEvent::Listening { port: 8000 });
        bus.emit(ServerEvent::Connection {
            remote: "127.0.0.1:1".to_string(),
        });
        bus.emit(ServerEvent::Closed);

        let names: Vec<&str> = vec![
            rx.recv().await.unwrap().event.name(),
            rx.recv().await.unwrap().event.name(),
            rx.recv().await.unwrap().event.name(),
        ];
        assert_eq!(names, vec!["listening", "connection", "closed"]);
    }

    #[tokio::test]
    async fn test_error_is_broadcast() {
        let bus = EventBus::new();
        let mut events = Box::pin(bus.stream());

        bus.error("capture", &"disk full");

        match events.next().await {
            Some(ServerEvent::Error { context, message }) => {
                assert_eq!(context, "capture");
                assert_eq!(message, "disk full");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::with_capacity(4);
        for _ in 0..10 {
            bus.emit(ServerEvent::Closed);
        }
        assert_eq!(bus.current_sequence_id(), 10);
    }
}
