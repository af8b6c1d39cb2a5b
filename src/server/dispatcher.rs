//! Command dispatcher.
//!
//! Entry point for every protocol event a connection delivers. Storage
//! commands execute against the backend under the server's lock; adapter
//! reads are forwarded to the owning socket; mutations fan a refresh out to
//! the emitter's room before the reply is written. Errors map onto the typed
//! wire format.

use super::adapters::AdapterRegistry;
use super::rooms::{RoomRegistry, DEFAULT_ROOM};
use super::storage::{coerce_scalar, SetOptions, StorageBackend};
use super::{ConnectionTable, PendingCalls, SocketId};
use crate::error::{Error, Result};
use crate::types::{
    AdapterGetParams, ChunkMessage, Command, Frame, JoinParams, KeyParams, PipelineParams,
    RefreshData, RefreshPayload, ReplyFrame, RequestFrame,
};
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default deadline for a forwarded adapter call.
pub const DEFAULT_ADAPTER_TIMEOUT: Duration = Duration::from_secs(10);

/// Executes protocol events against the shared server state.
#[allow(missing_debug_implementations)]
pub struct Dispatcher {
    storage: Arc<RwLock<Box<dyn StorageBackend>>>,
    rooms: Arc<RoomRegistry>,
    adapters: Arc<AdapterRegistry>,
    connections: Arc<ConnectionTable>,
    pending: Arc<PendingCalls>,
    adapter_timeout: Duration,
}

impl Dispatcher {
    /// Wire up a dispatcher over the shared server state.
    pub fn new(
        storage: Arc<RwLock<Box<dyn StorageBackend>>>,
        rooms: Arc<RoomRegistry>,
        adapters: Arc<AdapterRegistry>,
        connections: Arc<ConnectionTable>,
        pending: Arc<PendingCalls>,
        adapter_timeout: Duration,
    ) -> Self {
        Self {
            storage,
            rooms,
            adapters,
            connections,
            pending,
            adapter_timeout,
        }
    }

    /// Handle one request frame from `sid`; returns the reply to send, if
    /// the request expects one.
    pub async fn handle_request(&self, sid: SocketId, req: RequestFrame) -> Option<ReplyFrame> {
        if req.event == "chunk" {
            return self.handle_chunk(sid, req).await;
        }
        let result = self.handle_event(sid, &req.event, req.data).await;
        match (req.id, result) {
            (Some(id), Ok(value)) => Some(ReplyFrame::ok(id, value)),
            (Some(id), Err(err)) => Some(ReplyFrame::err(id, &err)),
            (None, Ok(_)) => None,
            (None, Err(err)) => {
                warn!(socket = %sid, event = %req.event, error = %err, "notification failed");
                None
            },
        }
    }

    /// Buffer one inbound chunk; when it completes a frame, acknowledge the
    /// chunk out-of-band and process the reassembled frame in its place.
    async fn handle_chunk(&self, sid: SocketId, req: RequestFrame) -> Option<ReplyFrame> {
        let id = req.id?;
        let msg: ChunkMessage = match serde_json::from_value(req.data) {
            Ok(msg) => msg,
            Err(e) => {
                return Some(ReplyFrame::err(
                    id,
                    &Error::Protocol(format!("invalid chunk: {e}")),
                ))
            },
        };
        let assembler = self.connections.assembler(sid)?;
        match assembler.push(&msg) {
            Ok(None) => Some(ReplyFrame::ok(id, json!(true))),
            Ok(Some(payload)) => {
                // Acknowledge the final chunk before the reassembled frame's
                // own reply goes out.
                self.connections
                    .send(sid, Frame::Reply(ReplyFrame::ok(id, json!(true))));
                match Frame::parse(&payload) {
                    Ok(Frame::Reply(reply)) => {
                        self.pending.resolve_from(sid, reply);
                        None
                    },
                    Ok(Frame::Request(inner)) if inner.event != "chunk" => {
                        let result = self.handle_event(sid, &inner.event, inner.data).await;
                        match (inner.id, result) {
                            (Some(inner_id), Ok(value)) => Some(ReplyFrame::ok(inner_id, value)),
                            (Some(inner_id), Err(err)) => Some(ReplyFrame::err(inner_id, &err)),
                            (None, _) => None,
                        }
                    },
                    Ok(Frame::Request(_)) => {
                        warn!(socket = %sid, "nested chunk frame discarded");
                        None
                    },
                    Err(err) => {
                        warn!(socket = %sid, error = %err, "reassembled frame unparsable");
                        None
                    },
                }
            },
            Err(err) => Some(ReplyFrame::err(id, &err)),
        }
    }

    async fn handle_event(&self, sid: SocketId, event: &str, data: Value) -> Result<Value> {
        match event {
            "join" => {
                let params: JoinParams = parse_params(event, data)?;
                let room = params.room.as_deref().unwrap_or(DEFAULT_ROOM);
                self.rooms.join(sid, room);
                debug!(socket = %sid, room, "socket joined room");
                Ok(Value::Null)
            },
            "refresh" => {
                let refresh: RefreshData = parse_params(event, data)?;
                self.broadcast_refresh(sid, &refresh);
                Ok(Value::Null)
            },
            "register_adapter" => {
                let params: KeyParams = parse_params(event, data)?;
                if self.storage.read().exists(&params.key) == 1 {
                    return Err(Error::KeyError {
                        key: format!("Key '{}' already holds data", params.key),
                    });
                }
                self.adapters.register(&params.key, sid)?;
                debug!(socket = %sid, key = %params.key, "adapter registered");
                Ok(Value::Null)
            },
            "unregister_adapter" => {
                let params: KeyParams = parse_params(event, data)?;
                self.adapters.unregister(&params.key, sid);
                Ok(Value::Null)
            },
            "check_adapter" | "adapter_exists" => {
                let params: KeyParams = parse_params(event, data)?;
                Ok(Value::Bool(self.adapters.exists(&params.key)))
            },
            "adapter:get" => {
                let params: AdapterGetParams = parse_params(event, data.clone())?;
                let owner = self.adapters.owner(&params.key).ok_or(Error::KeyError {
                    key: params.key.clone(),
                })?;
                self.call_owner(owner, &params.key, data).await
            },
            "pipeline" => {
                let params: PipelineParams = parse_params(event, data)?;
                self.execute_pipeline(sid, params)
            },
            _ => {
                let command = Command::from_event(event, data)?;
                self.guard_adapter_target(&command)?;
                let (value, refresh) = self.execute_command(command)?;
                if let Some(refresh) = refresh {
                    self.broadcast_refresh(sid, &refresh);
                }
                Ok(value)
            },
        }
    }

    /// Mutations must not touch keys served by an adapter; storage stays
    /// empty behind them so that ownership can move freely.
    fn guard_adapter_target(&self, command: &Command) -> Result<()> {
        if !command.is_mutation() {
            return Ok(());
        }
        match command.target() {
            Some(key) if self.adapters.exists(key) => Err(Error::FrozenStorage {
                key: key.to_string(),
            }),
            _ => Ok(()),
        }
    }

    /// Run a command batch in order, stopping at the first error. The reply
    /// array covers the commands up to and including the failing one, whose
    /// slot carries the wire error object.
    fn execute_pipeline(&self, sid: SocketId, params: PipelineParams) -> Result<Value> {
        let mut results = Vec::with_capacity(params.commands.len());
        let mut refreshes: Vec<RefreshData> = Vec::new();
        for entry in params.commands {
            let outcome = Command::from_event(&entry.event, entry.data)
                .and_then(|command| {
                    self.guard_adapter_target(&command)?;
                    self.execute_command(command)
                });
            match outcome {
                Ok((value, refresh)) => {
                    results.push(value);
                    refreshes.extend(refresh);
                },
                Err(err) => {
                    results.push(json!({ "error": err.to_wire() }));
                    break;
                },
            }
        }
        for refresh in coalesce_refreshes(refreshes) {
            self.broadcast_refresh(sid, &refresh);
        }
        Ok(Value::Array(results))
    }

    /// Forward an `adapter:get` to the owning socket and relay its reply
    /// verbatim.
    async fn call_owner(&self, owner: SocketId, key: &str, data: Value) -> Result<Value> {
        let (id, rx) = self.pending.register(owner);
        let frame = Frame::Request(RequestFrame::call(id, "adapter:call", data));
        if !self.connections.send(owner, frame) {
            self.pending.cancel(id);
            return Err(Error::KeyError {
                key: key.to_string(),
            });
        }
        match tokio::time::timeout(self.adapter_timeout, rx).await {
            Ok(Ok(result)) => result,
            // The owner disconnected while the call was in flight; its
            // adapters are already gone.
            Ok(Err(_)) => Err(Error::KeyError {
                key: key.to_string(),
            }),
            Err(_) => {
                self.pending.cancel(id);
                Err(Error::Timeout(format!(
                    "adapter call to '{key}' timed out after {:?}",
                    self.adapter_timeout
                )))
            },
        }
    }

    /// Deliver a refresh to every other member of the emitter's room.
    pub(super) fn broadcast_refresh(&self, origin: SocketId, refresh: &RefreshData) {
        let Some(room) = self.rooms.room_of(origin) else {
            return;
        };
        let data = match serde_json::to_value(refresh) {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "refresh payload not serializable");
                return;
            },
        };
        for member in self.rooms.members(&room, Some(origin)) {
            self.connections
                .send(member, Frame::Request(RequestFrame::notify("refresh", data.clone())));
        }
    }

    /// Execute a storage command, returning its reply value and the refresh
    /// describing the mutation, if any.
    fn execute_command(&self, command: Command) -> Result<(Value, Option<RefreshData>)> {
        use Command::*;
        match command {
            Set {
                name,
                value,
                ex,
                nx,
                xx,
            } => {
                let name = name.ok_or_else(|| Error::data("Invalid input of type None"))?;
                let value = coerce_scalar(&value)?;
                let opts = SetOptions {
                    ex: ex.map(Duration::from_secs),
                    nx,
                    xx,
                };
                let stored = self.storage.write().set(&name, value, opts)?;
                if stored {
                    Ok((json!(true), Some(RefreshData::from_start(&name, 0))))
                } else {
                    Ok((Value::Null, None))
                }
            },
            Get { name } => Ok((option_value(self.storage.read().get(&name)?), None)),
            Incr { name, amount } => {
                let next = self.storage.write().incr_by(&name, amount)?;
                Ok((json!(next), Some(RefreshData::from_start(&name, 0))))
            },
            Decr { name, amount } => {
                let next = self.storage.write().incr_by(&name, -amount)?;
                Ok((json!(next), Some(RefreshData::from_start(&name, 0))))
            },
            Exists { name } => Ok((json!(self.storage.read().exists(&name)), None)),
            Delete { name } => {
                let removed = self.storage.write().delete(&name);
                let refresh = (removed == 1).then(|| RefreshData::from_start(&name, 0));
                Ok((json!(removed), refresh))
            },
            Copy { src, dst } => Ok((json!(self.storage.write().copy(&src, &dst)), None)),
            Hset {
                name,
                key,
                value,
                mapping,
                items,
            } => {
                let pairs = hset_pairs(key, value, mapping, items)?;
                let fields: Vec<String> = pairs.iter().map(|(f, _)| f.clone()).collect();
                let added = self.storage.write().hset(&name, pairs)?;
                Ok((json!(added), Some(RefreshData::keys(&name, fields))))
            },
            Hget { name, key } => Ok((option_value(self.storage.read().hget(&name, &key)?), None)),
            Hmget { name, keys } => {
                let values = self.storage.read().hmget(&name, &keys)?;
                Ok((json!(values), None))
            },
            Hkeys { name } => Ok((json!(self.storage.read().hkeys(&name)?), None)),
            Hvals { name } => Ok((json!(self.storage.read().hvals(&name)?), None)),
            Hgetall { name } => Ok((json!(self.storage.read().hgetall(&name)?), None)),
            Hexists { name, key } => Ok((json!(self.storage.read().hexists(&name, &key)?), None)),
            Hdel { name, key } => {
                let removed = self.storage.write().hdel(&name, &key)?;
                let refresh = (removed == 1).then(|| RefreshData::keys(&name, vec![key]));
                Ok((json!(removed), refresh))
            },
            Hlen { name } => Ok((json!(self.storage.read().hlen(&name)?), None)),
            Llen { name } => Ok((json!(self.storage.read().llen(&name)?), None)),
            Rpush { name, value } => {
                let value = coerce_scalar(&value)?;
                let len = self.storage.write().rpush(&name, value)?;
                Ok((json!(len), Some(RefreshData::indices(&name, vec![len - 1]))))
            },
            Lpush { name, value } => {
                let value = coerce_scalar(&value)?;
                let len = self.storage.write().lpush(&name, value)?;
                Ok((json!(len), Some(RefreshData::from_start(&name, 0))))
            },
            Lindex { name, index } => {
                let index = index.ok_or_else(|| Error::data("Invalid input of type None"))?;
                Ok((option_value(self.storage.read().lindex(&name, index)?), None))
            },
            Lrange { name, start, end } => {
                Ok((json!(self.storage.read().lrange(&name, start, end)?), None))
            },
            Lset { name, index, value } => {
                let value = coerce_scalar(&value)?;
                self.storage.write().lset(&name, index, value)?;
                Ok((json!(true), Some(RefreshData::indices(&name, vec![index]))))
            },
            Lrem { name, count, value } => {
                let value = coerce_scalar(&value)?;
                let removed = self.storage.write().lrem(&name, count, &value)?;
                let refresh = (removed > 0).then(|| RefreshData::from_start(&name, 0));
                Ok((json!(removed), refresh))
            },
            Linsert {
                name,
                where_,
                pivot,
                value,
            } => {
                let pivot = coerce_scalar(&pivot)?;
                let value = coerce_scalar(&value)?;
                let len = self.storage.write().linsert(&name, where_, &pivot, value)?;
                let refresh = (len > 0).then(|| RefreshData::from_start(&name, 0));
                Ok((json!(len), refresh))
            },
            Lpop { name } => {
                let popped = self.storage.write().lpop(&name)?;
                let refresh = popped.is_some().then(|| RefreshData::from_start(&name, 0));
                Ok((option_value(popped), refresh))
            },
            Sadd { name, value } => {
                let value = coerce_scalar(&value)?;
                let added = self.storage.write().sadd(&name, value.clone())?;
                let refresh = (added == 1).then(|| RefreshData::keys(&name, vec![value]));
                Ok((json!(added), refresh))
            },
            Srem { name, value } => {
                let value = coerce_scalar(&value)?;
                let removed = self.storage.write().srem(&name, &value)?;
                let refresh = (removed == 1).then(|| RefreshData::keys(&name, vec![value]));
                Ok((json!(removed), refresh))
            },
            Smembers { name } => Ok((json!(self.storage.read().smembers(&name)?), None)),
            Scard { name } => Ok((json!(self.storage.read().scard(&name)?), None)),
            Flushall {} => {
                self.storage.write().flushall();
                Ok((json!(true), None))
            },
        }
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(event: &str, data: Value) -> Result<T> {
    serde_json::from_value(data)
        .map_err(|e| Error::Protocol(format!("invalid '{event}' arguments: {e}")))
}

fn option_value(value: Option<String>) -> Value {
    value.map_or(Value::Null, Value::String)
}

/// Flatten the `hset` argument forms (items list, single pair, mapping) into
/// field/value pairs, validating each value.
fn hset_pairs(
    key: Option<String>,
    value: Option<Value>,
    mapping: Option<serde_json::Map<String, Value>>,
    items: Option<Vec<Value>>,
) -> Result<Vec<(String, String)>> {
    let no_mapping = mapping.as_ref().is_none_or(serde_json::Map::is_empty);
    let no_items = items.as_ref().is_none_or(Vec::is_empty);
    if key.is_none() && no_mapping && no_items {
        return Err(Error::data("'hset' with no key value pairs"));
    }
    if key.is_some() && value.as_ref().is_none_or(Value::is_null) && no_mapping && no_items {
        return Err(Error::data("Invalid input of type None"));
    }

    let mut pairs = Vec::new();
    if let Some(items) = items {
        if items.len() % 2 != 0 {
            return Err(Error::data("'hset' items must be field/value pairs"));
        }
        for pair in items.chunks(2) {
            let field = pair[0]
                .as_str()
                .ok_or_else(|| Error::data("'hset' field names must be strings"))?;
            pairs.push((field.to_string(), coerce_scalar(&pair[1])?));
        }
    }
    if let (Some(key), Some(value)) = (key, value) {
        pairs.push((key, coerce_scalar(&value)?));
    }
    if let Some(mapping) = mapping {
        for (field, value) in mapping {
            pairs.push((field, coerce_scalar(&value)?));
        }
    }
    Ok(pairs)
}

/// Merge several refreshes for the same target into one event per target.
fn coalesce_refreshes(refreshes: Vec<RefreshData>) -> Vec<RefreshData> {
    let mut merged: HashMap<String, RefreshData> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    for refresh in refreshes {
        match merged.get_mut(&refresh.target) {
            None => {
                order.push(refresh.target.clone());
                merged.insert(refresh.target.clone(), refresh);
            },
            Some(existing) => {
                let combined = match (&existing.data, &refresh.data) {
                    (RefreshPayload::Keys { keys: a }, RefreshPayload::Keys { keys: b }) => {
                        let mut keys = a.clone();
                        for key in b {
                            if !keys.contains(key) {
                                keys.push(key.clone());
                            }
                        }
                        RefreshPayload::Keys { keys }
                    },
                    _ => RefreshPayload::Range {
                        start: existing.min_position().min(refresh.min_position()),
                        stop: None,
                    },
                };
                existing.data = combined;
            },
        }
    }
    order
        .into_iter()
        .filter_map(|target| merged.remove(&target))
        .collect()
}
