//! Server implementation.
//!
//! The server owns the storage backend, the room and adapter registries, and
//! one task trio per connection: a reader that parses frames and resolves
//! replies, a worker that executes requests strictly in arrival order, and a
//! writer that serializes outbound frames and chunks oversized ones.

pub mod adapters;
pub mod dispatcher;
pub mod rooms;
pub mod storage;

pub use adapters::AdapterRegistry;
pub use dispatcher::{Dispatcher, DEFAULT_ADAPTER_TIMEOUT};
pub use rooms::{RoomRegistry, DEFAULT_ROOM};

use crate::error::{Error, Result};
use crate::shared::chunking::{
    ChunkAssembler, OutboundPayload, DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_REASSEMBLY_TIMEOUT,
};
use crate::types::{Frame, RefreshData, ReplyFrame, RequestFrame};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use storage::StorageBackend;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Unique identifier of a connected socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketId(uuid::Uuid);

impl SocketId {
    /// Allocate a fresh socket id.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SocketId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SocketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct ConnectionHandle {
    sender: mpsc::UnboundedSender<Frame>,
    assembler: Arc<ChunkAssembler>,
}

/// Live connections and their outbound channels.
#[derive(Default)]
pub struct ConnectionTable {
    map: DashMap<SocketId, ConnectionHandle>,
}

impl ConnectionTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, sid: SocketId, sender: mpsc::UnboundedSender<Frame>, timeout: Duration) {
        self.map.insert(
            sid,
            ConnectionHandle {
                sender,
                assembler: Arc::new(ChunkAssembler::with_timeout(timeout)),
            },
        );
    }

    fn remove(&self, sid: SocketId) {
        self.map.remove(&sid);
    }

    /// Enqueue a frame for a socket; `false` when it is gone.
    pub fn send(&self, sid: SocketId, frame: Frame) -> bool {
        self.map
            .get(&sid)
            .map(|handle| handle.sender.send(frame).is_ok())
            .unwrap_or(false)
    }

    /// The inbound reassembly buffer of a socket.
    pub fn assembler(&self, sid: SocketId) -> Option<Arc<ChunkAssembler>> {
        self.map.get(&sid).map(|handle| handle.assembler.clone())
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether no connection is registered.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl std::fmt::Debug for ConnectionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionTable")
            .field("connections", &self.map.len())
            .finish()
    }
}

struct Pending {
    tx: oneshot::Sender<Result<Value>>,
    socket: SocketId,
}

/// Correlation table for server-originated requests (adapter calls and chunk
/// acknowledgements).
#[derive(Default)]
pub struct PendingCalls {
    next: AtomicU64,
    map: DashMap<u64, Pending>,
}

impl PendingCalls {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an id and register a waiter bound to `socket`.
    pub fn register(&self, socket: SocketId) -> (u64, oneshot::Receiver<Result<Value>>) {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.map.insert(id, Pending { tx, socket });
        (id, rx)
    }

    /// Complete the waiter for a reply; `false` when nothing was waiting.
    pub fn resolve(&self, reply: ReplyFrame) -> bool {
        match self.map.remove(&reply.id) {
            Some((_, pending)) => pending.tx.send(reply.into_result()).is_ok(),
            None => false,
        }
    }

    /// Complete the waiter only when the reply arrived on the socket the
    /// request was sent to; replies from other sockets are ignored.
    pub fn resolve_from(&self, socket: SocketId, reply: ReplyFrame) -> bool {
        match self.map.remove_if(&reply.id, |_, pending| pending.socket == socket) {
            Some((_, pending)) => pending.tx.send(reply.into_result()).is_ok(),
            None => false,
        }
    }

    /// Drop a waiter without completing it.
    pub fn cancel(&self, id: u64) {
        self.map.remove(&id);
    }

    /// Drop every waiter bound to `socket`; their receivers observe the
    /// closed channel.
    pub fn fail_for_socket(&self, socket: SocketId) {
        let ids: Vec<u64> = self
            .map
            .iter()
            .filter(|entry| entry.value().socket == socket)
            .map(|entry| *entry.key())
            .collect();
        for id in ids {
            self.map.remove(&id);
        }
    }
}

impl std::fmt::Debug for PendingCalls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCalls")
            .field("waiting", &self.map.len())
            .finish()
    }
}

struct ServerState {
    rooms: Arc<RoomRegistry>,
    adapters: Arc<AdapterRegistry>,
    connections: Arc<ConnectionTable>,
    pending: Arc<PendingCalls>,
    dispatcher: Arc<Dispatcher>,
    max_message_size: usize,
    reassembly_timeout: Duration,
}

/// Configuration for a [`Server`].
pub struct ServerBuilder {
    storage_dsn: String,
    backend: Option<Box<dyn StorageBackend>>,
    max_message_size: usize,
    adapter_timeout: Duration,
    reassembly_timeout: Duration,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self {
            storage_dsn: "memory".to_string(),
            backend: None,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            adapter_timeout: DEFAULT_ADAPTER_TIMEOUT,
            reassembly_timeout: DEFAULT_REASSEMBLY_TIMEOUT,
        }
    }
}

impl std::fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("storage_dsn", &self.storage_dsn)
            .field("max_message_size", &self.max_message_size)
            .field("adapter_timeout", &self.adapter_timeout)
            .field("reassembly_timeout", &self.reassembly_timeout)
            .finish()
    }
}

impl ServerBuilder {
    /// Storage DSN; `memory` is the only built-in scheme.
    pub fn storage(mut self, dsn: impl Into<String>) -> Self {
        self.storage_dsn = dsn.into();
        self
    }

    /// Use a pre-built storage backend instead of a DSN.
    pub fn backend(mut self, backend: Box<dyn StorageBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Frame size limit above which payloads are compressed and chunked.
    pub fn max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes;
        self
    }

    /// Deadline for forwarded adapter calls.
    pub fn adapter_timeout(mut self, timeout: Duration) -> Self {
        self.adapter_timeout = timeout;
        self
    }

    /// Deadline for reassembling a chunked message.
    pub fn reassembly_timeout(mut self, timeout: Duration) -> Self {
        self.reassembly_timeout = timeout;
        self
    }

    /// Bind the listener and assemble the server state.
    pub async fn bind(self, addr: &str) -> Result<Server> {
        let backend = match self.backend {
            Some(backend) => backend,
            None => storage::open(&self.storage_dsn)?,
        };
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Connection {
                address: format!("{addr}: {e}"),
            })?;

        let storage = Arc::new(RwLock::new(backend));
        let rooms = Arc::new(RoomRegistry::new());
        let adapters = Arc::new(AdapterRegistry::new());
        let connections = Arc::new(ConnectionTable::new());
        let pending = Arc::new(PendingCalls::new());
        let dispatcher = Arc::new(Dispatcher::new(
            storage,
            rooms.clone(),
            adapters.clone(),
            connections.clone(),
            pending.clone(),
            self.adapter_timeout,
        ));
        Ok(Server {
            listener,
            state: Arc::new(ServerState {
                rooms,
                adapters,
                connections,
                pending,
                dispatcher,
                max_message_size: self.max_message_size,
                reassembly_timeout: self.reassembly_timeout,
            }),
        })
    }
}

/// The znsocket server.
///
/// # Examples
///
/// ```rust,no_run
/// use znsocket::server::Server;
///
/// # async fn example() -> znsocket::Result<()> {
/// let server = Server::builder().bind("127.0.0.1:5000").await?;
/// server.run().await
/// # }
/// ```
pub struct Server {
    listener: TcpListener,
    state: Arc<ServerState>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.listener.local_addr().ok())
            .finish()
    }
}

impl Server {
    /// Start configuring a server.
    pub fn builder() -> ServerBuilder {
        ServerBuilder::default()
    }

    /// The bound address, useful with an ephemeral port.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| Error::Connection {
                address: e.to_string(),
            })
    }

    /// Accept connections until the task is cancelled.
    pub async fn run(self) -> Result<()> {
        info!(addr = %self.local_addr()?, "znsocket server listening");
        loop {
            let (stream, peer) = self
                .listener
                .accept()
                .await
                .map_err(|e| Error::Connection {
                    address: e.to_string(),
                })?;
            debug!(%peer, "incoming connection");
            let state = self.state.clone();
            tokio::spawn(async move {
                if let Err(err) = handle_connection(state, stream).await {
                    debug!(%peer, error = %err, "connection ended");
                }
            });
        }
    }
}

async fn handle_connection(state: Arc<ServerState>, stream: TcpStream) -> Result<()> {
    // Size policing happens in the chunked transport; the WebSocket layer
    // must not cap messages below it.
    let config = WebSocketConfig::default()
        .max_message_size(None)
        .max_frame_size(None);
    let ws = tokio_tungstenite::accept_async_with_config(stream, Some(config)).await?;
    let sid = SocketId::new();
    let (sink, mut ws_stream) = ws.split();

    let (out_tx, out_rx) = mpsc::unbounded_channel::<Frame>();
    state
        .connections
        .insert(sid, out_tx, state.reassembly_timeout);

    let writer = tokio::spawn(write_loop(state.clone(), sid, sink, out_rx));

    let (work_tx, work_rx) = mpsc::unbounded_channel::<RequestFrame>();
    let worker = tokio::spawn(work_loop(state.clone(), sid, work_rx));

    // The reader never blocks on command execution: replies resolve waiters
    // directly, requests go through the per-socket worker so commands keep
    // their arrival order while replies can still be read.
    while let Some(message) = ws_stream.next().await {
        let bytes = match message {
            Ok(Message::Binary(data)) => data.to_vec(),
            Ok(Message::Text(text)) => text.as_bytes().to_vec(),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                debug!(socket = %sid, error = %err, "read failed");
                break;
            },
        };
        match Frame::parse(&bytes) {
            Ok(Frame::Reply(reply)) => {
                state.pending.resolve_from(sid, reply);
            },
            Ok(Frame::Request(req)) => {
                if work_tx.send(req).is_err() {
                    break;
                }
            },
            Err(err) => warn!(socket = %sid, error = %err, "dropping unparsable frame"),
        }
    }

    disconnect(&state, sid);
    worker.abort();
    writer.abort();
    Ok(())
}

async fn work_loop(
    state: Arc<ServerState>,
    sid: SocketId,
    mut work_rx: mpsc::UnboundedReceiver<RequestFrame>,
) {
    while let Some(req) = work_rx.recv().await {
        if let Some(reply) = state.dispatcher.handle_request(sid, req).await {
            if !state.connections.send(sid, Frame::Reply(reply)) {
                break;
            }
        }
    }
}

async fn write_loop<S>(
    state: Arc<ServerState>,
    sid: SocketId,
    mut sink: S,
    mut out_rx: mpsc::UnboundedReceiver<Frame>,
) where
    S: SinkExt<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    while let Some(frame) = out_rx.recv().await {
        if let Err(err) = send_frame(&state, sid, &mut sink, frame).await {
            debug!(socket = %sid, error = %err, "write failed");
            break;
        }
    }
}

async fn send_frame<S>(
    state: &ServerState,
    sid: SocketId,
    sink: &mut S,
    frame: Frame,
) -> Result<()>
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let bytes = frame.to_bytes()?;
    match OutboundPayload::prepare(bytes, state.max_message_size)? {
        OutboundPayload::Single(bytes) => sink
            .send(Message::binary(bytes))
            .await
            .map_err(|e| Error::WebSocket(e.to_string())),
        chunked => {
            for msg in chunked.chunk_messages() {
                let (id, ack) = state.pending.register(sid);
                let chunk = Frame::Request(RequestFrame::call(id, "chunk", serde_json::to_value(&msg)?));
                sink.send(Message::binary(chunk.to_bytes()?))
                    .await
                    .map_err(|e| Error::WebSocket(e.to_string()))?;
                match tokio::time::timeout(state.reassembly_timeout, ack).await {
                    Ok(Ok(Ok(_))) => {},
                    Ok(Ok(Err(err))) => return Err(err),
                    Ok(Err(_)) => return Err(Error::ConnectionClosed),
                    Err(_) => {
                        state.pending.cancel(id);
                        return Err(Error::Timeout("chunk acknowledgement timed out".into()));
                    },
                }
            }
            Ok(())
        },
    }
}

/// Tear down everything a socket owned: room membership, adapters (warning
/// observers that those keys vanished) and any pending waiters.
fn disconnect(state: &ServerState, sid: SocketId) {
    let removed = state.adapters.remove_for_socket(sid);
    for key in &removed {
        state
            .dispatcher
            .broadcast_refresh(sid, &RefreshData::from_start(key.clone(), 0));
    }
    if !removed.is_empty() {
        debug!(socket = %sid, adapters = removed.len(), "cleaned up adapters");
    }
    state.rooms.leave(sid);
    state.connections.remove(sid);
    state.pending.fail_for_socket(sid);
}
