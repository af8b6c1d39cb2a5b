//! Client implementation.
//!
//! [`Client`] owns the WebSocket connection, correlates calls with replies,
//! dispatches refresh notifications to subscribers, and answers adapter
//! calls for the keys this process serves. The distributed collection types
//! ([`List`], [`Dict`], [`Segments`]) and the adapter types build on it.

pub mod adapters;
pub mod dict;
pub mod list;
pub mod segments;

pub use adapters::{
    DictAdapter, ItemTransform, ListAdapter, MappingSource, SequenceSource, Transformed,
};
pub use dict::{Dict, DictBuilder, DictCallbacks};
pub use list::{List, ListBuilder, ListCallbacks};
pub use segments::Segments;

use crate::error::{Error, Result};
use crate::shared::chunking::{
    ChunkAssembler, OutboundPayload, DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_REASSEMBLY_TIMEOUT,
};
use crate::shared::url::ServerUrl;
use crate::types::{
    AdapterGetParams, ChunkMessage, Frame, JoinParams, PipelineCommand, PipelineParams,
    RefreshData, ReplyFrame, RequestFrame,
};
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

/// Default cap on the number of commands in one pipeline call.
pub const DEFAULT_MAX_COMMANDS_PER_CALL: usize = 1_000_000;

/// Key prefix of distributed lists.
pub const LIST_PREFIX: &str = "znsocket.List:";
/// Key prefix of distributed dicts.
pub const DICT_PREFIX: &str = "znsocket.Dict:";
/// Key prefix of piece tables.
pub const SEGMENTS_PREFIX: &str = "znsocket.Segments:";

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection.
    Disconnected,
    /// Transport established, `join` not yet acknowledged.
    Connecting,
    /// Fully connected; commands are accepted.
    Joined,
    /// Shutting down.
    Closing,
}

/// Callback invoked when a refresh for a subscribed key arrives.
pub type RefreshCallback = Box<dyn Fn(&RefreshData) + Send + Sync>;

/// Callback answering adapter calls for a key this client serves.
pub type AdapterCallback =
    Arc<dyn Fn(AdapterGetParams) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

struct ClientInner {
    address: String,
    out_tx: mpsc::UnboundedSender<Frame>,
    pending: DashMap<u64, oneshot::Sender<Result<Value>>>,
    next_id: AtomicU64,
    refresh_callbacks: DashMap<String, RefreshCallback>,
    adapter_callbacks: DashMap<String, AdapterCallback>,
    assembler: ChunkAssembler,
    state: RwLock<ConnectionState>,
    max_message_size: usize,
    max_commands_per_call: usize,
    reassembly_timeout: Duration,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl ClientInner {
    fn fail_all_pending(&self) {
        let ids: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(Error::ConnectionClosed));
            }
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

/// Configuration for a [`Client`].
#[derive(Debug, Clone)]
pub struct ClientBuilder {
    room: Option<String>,
    max_message_size: usize,
    max_commands_per_call: usize,
    reassembly_timeout: Duration,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self {
            room: None,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_commands_per_call: DEFAULT_MAX_COMMANDS_PER_CALL,
            reassembly_timeout: DEFAULT_REASSEMBLY_TIMEOUT,
        }
    }
}

impl ClientBuilder {
    /// Room to join on connect (defaults to the server's default room).
    pub fn room(mut self, room: impl Into<String>) -> Self {
        self.room = Some(room.into());
        self
    }

    /// Frame size limit above which payloads are compressed and chunked.
    pub fn max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes;
        self
    }

    /// Cap on commands per pipeline call; larger batches are split.
    pub fn max_commands_per_call(mut self, count: usize) -> Self {
        self.max_commands_per_call = count.max(1);
        self
    }

    /// Deadline for reassembling a chunked message.
    pub fn reassembly_timeout(mut self, timeout: Duration) -> Self {
        self.reassembly_timeout = timeout;
        self
    }

    /// Connect to a server and join the configured room.
    pub async fn connect(self, address: &str) -> Result<Client> {
        let url = ServerUrl::parse(address)?;
        // Size policing happens in the chunked transport; the WebSocket
        // layer must not cap messages below it.
        let config = WebSocketConfig::default()
            .max_message_size(None)
            .max_frame_size(None);
        let (ws, _) =
            tokio_tungstenite::connect_async_with_config(url.websocket_url(), Some(config), false)
                .await
                .map_err(|_| Error::Connection {
                    address: address.to_string(),
                })?;
        let (sink, stream) = ws.split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(ClientInner {
            address: address.to_string(),
            out_tx,
            pending: DashMap::new(),
            next_id: AtomicU64::new(0),
            refresh_callbacks: DashMap::new(),
            adapter_callbacks: DashMap::new(),
            assembler: ChunkAssembler::with_timeout(self.reassembly_timeout),
            state: RwLock::new(ConnectionState::Connecting),
            max_message_size: self.max_message_size,
            max_commands_per_call: self.max_commands_per_call,
            reassembly_timeout: self.reassembly_timeout,
            tasks: Mutex::new(Vec::new()),
        });

        let writer = tokio::spawn(write_loop(inner.clone(), sink, out_rx));
        let reader = tokio::spawn(read_loop(inner.clone(), stream));
        inner.tasks.lock().extend([writer, reader]);

        let client = Client { inner };
        client
            .call("join", serde_json::to_value(JoinParams { room: self.room })?)
            .await?;
        *client.inner.state.write() = ConnectionState::Joined;
        debug!(address, "client connected");
        Ok(client)
    }
}

/// Connection to a znsocket server.
///
/// Cloning is cheap; every clone shares the underlying connection.
///
/// # Examples
///
/// ```rust,no_run
/// use znsocket::Client;
///
/// # async fn example() -> znsocket::Result<()> {
/// let client = Client::connect("znsocket://127.0.0.1:5000").await?;
/// client.call("set", serde_json::json!({"name": "k", "value": "v"})).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Connect with default settings.
    pub async fn connect(address: &str) -> Result<Client> {
        Self::builder().connect(address).await
    }

    /// Start configuring a client.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// The address this client connected to.
    pub fn address(&self) -> &str {
        &self.inner.address
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.read()
    }

    /// Issue a request and await its reply.
    pub async fn call(&self, event: &str, data: Value) -> Result<Value> {
        match self.state() {
            ConnectionState::Joined => {},
            ConnectionState::Connecting if event == "join" => {},
            state => {
                return Err(Error::InvalidState(format!(
                    "cannot send '{event}' while {state:?}"
                )))
            },
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(id, tx);
        let frame = Frame::Request(RequestFrame::call(id, event, data));
        if self.inner.out_tx.send(frame).is_err() {
            self.inner.pending.remove(&id);
            return Err(Error::ConnectionClosed);
        }
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Send a fire-and-forget notification.
    pub fn emit(&self, event: &str, data: Value) -> Result<()> {
        let frame = Frame::Request(RequestFrame::notify(event, data));
        self.inner
            .out_tx
            .send(frame)
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Join a room, leaving the previous one.
    pub async fn join(&self, room: &str) -> Result<()> {
        self.call("join", json!({ "room": room })).await?;
        Ok(())
    }

    /// Start a command batch.
    pub fn pipeline(&self) -> Pipeline {
        Pipeline {
            client: self.clone(),
            commands: Vec::new(),
        }
    }

    /// Subscribe to refresh events for a prefixed key.
    pub fn on_refresh(
        &self,
        key: impl Into<String>,
        callback: impl Fn(&RefreshData) + Send + Sync + 'static,
    ) {
        self.inner
            .refresh_callbacks
            .insert(key.into(), Box::new(callback));
    }

    /// Drop the refresh subscription for a key.
    pub fn remove_refresh(&self, key: &str) {
        self.inner.refresh_callbacks.remove(key);
    }

    /// Register this client as the adapter owner of `key`, answering reads
    /// with `callback`.
    pub(crate) async fn register_adapter(
        &self,
        key: &str,
        callback: AdapterCallback,
    ) -> Result<()> {
        self.call("register_adapter", json!({ "key": key })).await?;
        self.inner
            .adapter_callbacks
            .insert(key.to_string(), callback);
        Ok(())
    }

    /// Close the connection, cancelling every pending operation.
    pub async fn close(&self) {
        *self.inner.state.write() = ConnectionState::Closing;
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        self.inner.fail_all_pending();
        *self.inner.state.write() = ConnectionState::Disconnected;
    }

    /// Drop every key on the server.
    pub async fn flushall(&self) -> Result<()> {
        self.call("flushall", json!({})).await?;
        Ok(())
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("address", &self.inner.address)
            .field("state", &self.state())
            .finish()
    }
}

/// A buffered command batch, executed in order server-side.
///
/// Batches above the client's `max_commands_per_call` are split into several
/// calls; the result array preserves command order across the splits.
#[derive(Debug)]
pub struct Pipeline {
    client: Client,
    commands: Vec<PipelineCommand>,
}

impl Pipeline {
    /// Buffer one command.
    pub fn add(&mut self, event: &str, data: Value) -> &mut Self {
        self.commands.push(PipelineCommand {
            event: event.to_string(),
            data,
        });
        self
    }

    /// Number of buffered commands.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Whether the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Execute the batch; the first failing command aborts the remainder and
    /// surfaces as the typed error.
    pub async fn execute(&mut self) -> Result<Vec<Value>> {
        let commands = std::mem::take(&mut self.commands);
        let mut results = Vec::with_capacity(commands.len());
        let limit = self.client.inner.max_commands_per_call;
        for batch in commands.chunks(limit) {
            let params = PipelineParams {
                commands: batch.to_vec(),
            };
            let reply = self
                .client
                .call("pipeline", serde_json::to_value(params)?)
                .await?;
            let Value::Array(entries) = reply else {
                return Err(Error::Protocol("pipeline reply is not an array".into()));
            };
            for entry in entries {
                if let Some(error) = entry.get("error") {
                    if let Ok(wire) = serde_json::from_value::<crate::error::WireError>(error.clone())
                    {
                        return Err(wire.into_error());
                    }
                }
                results.push(entry);
            }
        }
        Ok(results)
    }
}

async fn write_loop(
    inner: Arc<ClientInner>,
    mut sink: WsSink,
    mut out_rx: mpsc::UnboundedReceiver<Frame>,
) {
    while let Some(frame) = out_rx.recv().await {
        if let Err(err) = send_frame(&inner, &mut sink, frame).await {
            debug!(error = %err, "client write failed");
            break;
        }
    }
}

async fn send_frame(inner: &Arc<ClientInner>, sink: &mut WsSink, frame: Frame) -> Result<()> {
    let bytes = frame.to_bytes()?;
    match OutboundPayload::prepare(bytes, inner.max_message_size)? {
        OutboundPayload::Single(bytes) => sink.send(Message::binary(bytes)).await.map_err(Error::from),
        chunked => {
            for msg in chunked.chunk_messages() {
                let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = oneshot::channel();
                inner.pending.insert(id, tx);
                let chunk = Frame::Request(RequestFrame::call(id, "chunk", serde_json::to_value(&msg)?));
                sink.send(Message::binary(chunk.to_bytes()?))
                    .await
                    .map_err(Error::from)?;
                match tokio::time::timeout(inner.reassembly_timeout, rx).await {
                    Ok(Ok(Ok(_))) => {},
                    Ok(Ok(Err(err))) => return Err(err),
                    Ok(Err(_)) => return Err(Error::ConnectionClosed),
                    Err(_) => {
                        inner.pending.remove(&id);
                        return Err(Error::Timeout("chunk acknowledgement timed out".into()));
                    },
                }
            }
            Ok(())
        },
    }
}

async fn read_loop(inner: Arc<ClientInner>, mut stream: WsStream) {
    while let Some(message) = stream.next().await {
        let bytes = match message {
            Ok(Message::Binary(data)) => data.to_vec(),
            Ok(Message::Text(text)) => text.as_bytes().to_vec(),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                debug!(error = %err, "client read failed");
                break;
            },
        };
        match Frame::parse(&bytes) {
            Ok(frame) => handle_frame(&inner, frame),
            Err(err) => warn!(error = %err, "dropping unparsable frame"),
        }
    }
    inner.fail_all_pending();
    *inner.state.write() = ConnectionState::Disconnected;
}

fn handle_frame(inner: &Arc<ClientInner>, frame: Frame) {
    match frame {
        Frame::Reply(reply) => resolve_pending(inner, reply),
        Frame::Request(req) => handle_incoming(inner, req),
    }
}

fn resolve_pending(inner: &Arc<ClientInner>, reply: ReplyFrame) {
    if let Some((_, tx)) = inner.pending.remove(&reply.id) {
        let _ = tx.send(reply.into_result());
    }
}

fn handle_incoming(inner: &Arc<ClientInner>, req: RequestFrame) {
    match req.event.as_str() {
        "refresh" => match serde_json::from_value::<RefreshData>(req.data) {
            Ok(refresh) => {
                if let Some(callback) = inner.refresh_callbacks.get(&refresh.target) {
                    (callback.value())(&refresh);
                }
            },
            Err(err) => warn!(error = %err, "malformed refresh event"),
        },
        "adapter:call" => {
            let Some(id) = req.id else {
                warn!("adapter call without id discarded");
                return;
            };
            let reply = move |result: Result<Value>| match result {
                Ok(value) => ReplyFrame::ok(id, value),
                Err(err) => ReplyFrame::err(id, &err),
            };
            let params: AdapterGetParams = match serde_json::from_value(req.data) {
                Ok(params) => params,
                Err(e) => {
                    let _ = inner.out_tx.send(Frame::Reply(reply(Err(Error::Protocol(
                        format!("invalid adapter call: {e}"),
                    )))));
                    return;
                },
            };
            match inner.adapter_callbacks.get(&params.key) {
                Some(callback) => {
                    // Serving the call may itself talk to the server (nested
                    // adapters), so it runs on its own task instead of
                    // blocking the read loop.
                    let callback = callback.value().clone();
                    let out_tx = inner.out_tx.clone();
                    tokio::spawn(async move {
                        let result = callback(params).await;
                        let _ = out_tx.send(Frame::Reply(reply(result)));
                    });
                },
                None => {
                    let _ = inner.out_tx.send(Frame::Reply(reply(Err(Error::KeyError {
                        key: params.key,
                    }))));
                },
            }
        },
        "chunk" => {
            let Some(id) = req.id else {
                return;
            };
            let msg: ChunkMessage = match serde_json::from_value(req.data) {
                Ok(msg) => msg,
                Err(e) => {
                    let _ = inner.out_tx.send(Frame::Reply(ReplyFrame::err(
                        id,
                        &Error::Protocol(format!("invalid chunk: {e}")),
                    )));
                    return;
                },
            };
            match inner.assembler.push(&msg) {
                Ok(complete) => {
                    let _ = inner
                        .out_tx
                        .send(Frame::Reply(ReplyFrame::ok(id, json!(true))));
                    if let Some(payload) = complete {
                        match Frame::parse(&payload) {
                            Ok(Frame::Request(inner_req)) if inner_req.event != "chunk" => {
                                handle_incoming(inner, inner_req);
                            },
                            Ok(Frame::Reply(reply)) => resolve_pending(inner, reply),
                            Ok(Frame::Request(_)) => warn!("nested chunk frame discarded"),
                            Err(err) => warn!(error = %err, "reassembled frame unparsable"),
                        }
                    }
                },
                Err(err) => {
                    let _ = inner
                        .out_tx
                        .send(Frame::Reply(ReplyFrame::err(id, &err)));
                },
            }
        },
        other => warn!(event = other, "unexpected server event"),
    }
}

// ---------------------------------------------------------------------------
// Values stored by the collection types
// ---------------------------------------------------------------------------

/// A value read from a distributed collection.
///
/// Stored strings beginning with a collection prefix are rehydrated into
/// handles to the referenced collection; everything else comes back as plain
/// JSON.
#[derive(Debug, Clone)]
pub enum ObjectValue {
    /// A plain JSON value.
    Value(Value),
    /// A reference to another distributed list.
    List(List),
    /// A reference to another distributed dict.
    Dict(Dict),
}

impl ObjectValue {
    /// The plain JSON value, if this is not a collection reference.
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            ObjectValue::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Unwrap into a plain JSON value; collection references become their
    /// prefixed key strings.
    pub fn into_plain(self) -> Value {
        match self {
            ObjectValue::Value(v) => v,
            ObjectValue::List(l) => Value::String(l.key().to_string()),
            ObjectValue::Dict(d) => Value::String(d.key().to_string()),
        }
    }

    /// Unwrap a list reference.
    pub fn into_list(self) -> Option<List> {
        match self {
            ObjectValue::List(l) => Some(l),
            _ => None,
        }
    }

    /// Unwrap a dict reference.
    pub fn into_dict(self) -> Option<Dict> {
        match self {
            ObjectValue::Dict(d) => Some(d),
            _ => None,
        }
    }
}

/// A value written into a distributed collection: either plain JSON or a
/// reference to another collection, stored as its prefixed key.
#[derive(Debug, Clone)]
pub enum ObjectRef<'a> {
    /// A plain JSON value.
    Value(Value),
    /// A cross-reference to a list.
    List(&'a List),
    /// A cross-reference to a dict.
    Dict(&'a Dict),
}

impl From<Value> for ObjectRef<'_> {
    fn from(value: Value) -> Self {
        ObjectRef::Value(value)
    }
}

impl<'a> From<&'a List> for ObjectRef<'a> {
    fn from(list: &'a List) -> Self {
        ObjectRef::List(list)
    }
}

impl<'a> From<&'a Dict> for ObjectRef<'a> {
    fn from(dict: &'a Dict) -> Self {
        ObjectRef::Dict(dict)
    }
}

impl ObjectRef<'_> {
    /// The JSON value to encode for storage. Cross-references become their
    /// key strings; storing an object inside itself is rejected.
    pub(crate) fn resolve(self, owner_key: &str) -> Result<Value> {
        match self {
            ObjectRef::Value(v) => Ok(v),
            ObjectRef::List(l) => {
                if l.key() == owner_key {
                    return Err(Error::SelfReference);
                }
                Ok(Value::String(l.key().to_string()))
            },
            ObjectRef::Dict(d) => {
                if d.key() == owner_key {
                    return Err(Error::SelfReference);
                }
                Ok(Value::String(d.key().to_string()))
            },
        }
    }
}

/// JSON-encode a value for storage.
pub(crate) fn encode_value(value: &Value) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

/// Decode a stored string, rehydrating collection references.
pub(crate) fn decode_entry(client: &Client, raw: &str) -> Result<ObjectValue> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| Error::Protocol(format!("stored value is not valid JSON: {e}")))?;
    if let Value::String(s) = &value {
        if let Some(name) = s.strip_prefix(LIST_PREFIX) {
            return Ok(ObjectValue::List(List::attach(client.clone(), name)));
        }
        if let Some(name) = s.strip_prefix(DICT_PREFIX) {
            return Ok(ObjectValue::Dict(Dict::attach(client.clone(), name)));
        }
    }
    Ok(ObjectValue::Value(value))
}

/// Decode a stored string without rehydration.
pub(crate) fn decode_plain(raw: &str) -> Result<Value> {
    serde_json::from_str(raw)
        .map_err(|e| Error::Protocol(format!("stored value is not valid JSON: {e}")))
}

/// What happens when a collection with a fallback key is read while empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackPolicy {
    /// Reads fall through to the fallback key forever; writes are rejected.
    Frozen,
    /// The fallback's contents are materialised into this key once, then the
    /// fallback is ignored.
    Copy,
}
