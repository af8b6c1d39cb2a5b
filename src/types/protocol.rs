//! Protocol frame and command definitions.
//!
//! A connection exchanges JSON frames, one per WebSocket message. A frame is
//! either a request (`{"id": 1, "event": "get", "data": {...}}`) or a reply
//! (`{"id": 1, "result": ...}` / `{"id": 1, "error": {"msg", "type"}}`).
//! Requests without an `id` are fire-and-forget notifications. Both sides may
//! originate requests: clients issue commands, the server calls adapter
//! owners back over the same connection.

use crate::error::{Error, Result, WireError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single protocol frame.
///
/// # Examples
///
/// ```rust
/// use znsocket::types::Frame;
///
/// let frame = Frame::parse(br#"{"id": 3, "event": "get", "data": {"name": "k"}}"#).unwrap();
/// match frame {
///     Frame::Request(req) => {
///         assert_eq!(req.id, Some(3));
///         assert_eq!(req.event, "get");
///     },
///     Frame::Reply(_) => unreachable!(),
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Frame {
    /// A request or notification carrying an event name and argument object.
    Request(RequestFrame),
    /// A reply to a previously issued request.
    Reply(ReplyFrame),
}

impl Frame {
    /// Parse a frame from raw bytes.
    pub fn parse(bytes: &[u8]) -> Result<Frame> {
        serde_json::from_slice(bytes).map_err(|e| Error::Protocol(format!("invalid frame: {e}")))
    }

    /// Serialize the frame to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Request frame: an event with a single argument object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    /// Correlation id; absent for fire-and-forget notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    /// Event name (`get`, `hset`, `join`, `refresh`, `pipeline`, ...).
    pub event: String,
    /// The single argument object.
    #[serde(default)]
    pub data: Value,
}

impl RequestFrame {
    /// Build a request with a correlation id.
    pub fn call(id: u64, event: impl Into<String>, data: Value) -> Self {
        Self {
            id: Some(id),
            event: event.into(),
            data,
        }
    }

    /// Build a fire-and-forget notification.
    pub fn notify(event: impl Into<String>, data: Value) -> Self {
        Self {
            id: None,
            event: event.into(),
            data,
        }
    }
}

/// Reply frame: a result value or a typed error, correlated by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyFrame {
    /// Correlation id of the request being answered.
    pub id: u64,
    /// Result value; `null` results are omitted on the wire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error payload, mutually exclusive with `result`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl ReplyFrame {
    /// Successful reply.
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            result: if result.is_null() { None } else { Some(result) },
            error: None,
        }
    }

    /// Error reply.
    pub fn err(id: u64, error: &Error) -> Self {
        Self {
            id,
            result: None,
            error: Some(error.to_wire()),
        }
    }

    /// Unwrap into the result value, converting a wire error back into a
    /// typed [`Error`]. A missing result becomes `Value::Null`.
    pub fn into_result(self) -> Result<Value> {
        match self.error {
            Some(wire) => Err(wire.into_error()),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Where to insert relative to the pivot in `linsert`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InsertWhere {
    /// Insert before the pivot element.
    Before,
    /// Insert after the pivot element.
    After,
}

fn default_amount() -> i64 {
    1
}

/// The storage command set, tagged by event name.
///
/// Each variant mirrors one wire event and its argument object; the
/// dispatcher executes these against the storage backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum Command {
    /// Set a string key to a scalar value.
    Set {
        /// Target key; `null` is rejected with `DataError`.
        name: Option<String>,
        /// Scalar value; non-scalars are rejected with `DataError`.
        value: Value,
        /// Optional expiry in seconds.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ex: Option<u64>,
        /// Only set when the key does not exist.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        nx: bool,
        /// Only set when the key already exists.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        xx: bool,
    },
    /// Get a string key.
    Get {
        /// Target key.
        name: String,
    },
    /// Increment an integer key.
    Incr {
        /// Target key.
        name: String,
        /// Amount to add (default 1).
        #[serde(default = "default_amount")]
        amount: i64,
    },
    /// Decrement an integer key.
    Decr {
        /// Target key.
        name: String,
        /// Amount to subtract (default 1).
        #[serde(default = "default_amount")]
        amount: i64,
    },
    /// Does the key exist (0/1)?
    Exists {
        /// Target key.
        name: String,
    },
    /// Delete a key (0/1).
    Delete {
        /// Target key.
        name: String,
    },
    /// Deep-copy `src` to `dst` when `dst` is absent.
    Copy {
        /// Source key.
        src: String,
        /// Destination key.
        dst: String,
    },
    /// Set one or more hash fields.
    Hset {
        /// Target hash.
        name: String,
        /// Single field name.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key: Option<String>,
        /// Single field value.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
        /// Field/value mapping.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mapping: Option<serde_json::Map<String, Value>>,
        /// Alternating field/value list.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        items: Option<Vec<Value>>,
    },
    /// Get a hash field.
    Hget {
        /// Target hash.
        name: String,
        /// Field name.
        key: String,
    },
    /// Get several hash fields.
    Hmget {
        /// Target hash.
        name: String,
        /// Field names.
        keys: Vec<String>,
    },
    /// All field names of a hash.
    Hkeys {
        /// Target hash.
        name: String,
    },
    /// All values of a hash.
    Hvals {
        /// Target hash.
        name: String,
    },
    /// All field/value pairs of a hash.
    Hgetall {
        /// Target hash.
        name: String,
    },
    /// Does the hash field exist (0/1)?
    Hexists {
        /// Target hash.
        name: String,
        /// Field name.
        key: String,
    },
    /// Delete a hash field (0/1).
    Hdel {
        /// Target hash.
        name: String,
        /// Field name.
        key: String,
    },
    /// Number of fields in a hash.
    Hlen {
        /// Target hash.
        name: String,
    },
    /// Length of a list.
    Llen {
        /// Target list.
        name: String,
    },
    /// Append to the tail of a list; returns the new length.
    Rpush {
        /// Target list.
        name: String,
        /// Value to push.
        value: Value,
    },
    /// Prepend to the head of a list; returns the new length.
    Lpush {
        /// Target list.
        name: String,
        /// Value to push.
        value: Value,
    },
    /// Element at a signed index, or `null`.
    Lindex {
        /// Target list.
        name: String,
        /// Signed index; `null` is rejected with `DataError`.
        index: Option<i64>,
    },
    /// Inclusive range of a list (`end == -1` means the last element).
    Lrange {
        /// Target list.
        name: String,
        /// Signed start index.
        start: i64,
        /// Signed end index, inclusive.
        end: i64,
    },
    /// Overwrite the element at an index.
    Lset {
        /// Target list.
        name: String,
        /// Signed index.
        index: i64,
        /// New value.
        value: Value,
    },
    /// Remove occurrences of a value; returns the removed count.
    Lrem {
        /// Target list.
        name: String,
        /// 0 removes all, positive scans head to tail, negative tail to head.
        count: i64,
        /// Value to remove.
        value: Value,
    },
    /// Insert relative to the first occurrence of a pivot value.
    Linsert {
        /// Target list.
        name: String,
        /// Insert before or after the pivot.
        #[serde(rename = "where")]
        where_: InsertWhere,
        /// Pivot value.
        pivot: Value,
        /// Value to insert.
        value: Value,
    },
    /// Pop the head of a list, or `null`.
    Lpop {
        /// Target list.
        name: String,
    },
    /// Add a member to a set.
    Sadd {
        /// Target set.
        name: String,
        /// Member to add.
        value: Value,
    },
    /// Remove a member from a set (0/1).
    Srem {
        /// Target set.
        name: String,
        /// Member to remove.
        value: Value,
    },
    /// All members of a set.
    Smembers {
        /// Target set.
        name: String,
    },
    /// Cardinality of a set.
    Scard {
        /// Target set.
        name: String,
    },
    /// Drop every key.
    Flushall {},
}

impl Command {
    /// Parse a command from an event name and its argument object.
    pub fn from_event(event: &str, data: Value) -> Result<Command> {
        let tagged = serde_json::json!({ "event": event, "data": data });
        serde_json::from_value(tagged)
            .map_err(|e| Error::Protocol(format!("invalid '{event}' arguments: {e}")))
    }

    /// The key this command touches, when there is exactly one.
    pub fn target(&self) -> Option<&str> {
        use Command::*;
        match self {
            Set { name, .. } => name.as_deref(),
            Get { name } | Incr { name, .. } | Decr { name, .. }
            | Exists { name } | Delete { name } | Hset { name, .. } | Hget { name, .. }
            | Hmget { name, .. } | Hkeys { name } | Hvals { name } | Hgetall { name }
            | Hexists { name, .. } | Hdel { name, .. } | Hlen { name } | Llen { name }
            | Rpush { name, .. } | Lpush { name, .. } | Lindex { name, .. }
            | Lrange { name, .. } | Lset { name, .. } | Lrem { name, .. }
            | Linsert { name, .. } | Lpop { name } | Sadd { name, .. } | Srem { name, .. }
            | Smembers { name } | Scard { name } => Some(name),
            Copy { dst, .. } => Some(dst),
            Flushall {} => None,
        }
    }

    /// Whether this command can change stored state.
    pub fn is_mutation(&self) -> bool {
        use Command::*;
        !matches!(
            self,
            Get { .. }
                | Exists { .. }
                | Hget { .. }
                | Hmget { .. }
                | Hkeys { .. }
                | Hvals { .. }
                | Hgetall { .. }
                | Hexists { .. }
                | Hlen { .. }
                | Llen { .. }
                | Lindex { .. }
                | Lrange { .. }
                | Smembers { .. }
                | Scard { .. }
        )
    }
}

/// Arguments of the `join` event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JoinParams {
    /// Room to join; the server substitutes a default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
}

/// Arguments of `register_adapter`, `check_adapter` and `adapter_exists`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyParams {
    /// The prefixed key the adapter serves.
    pub key: String,
}

/// Arguments of `adapter:get` (and the relayed `adapter:call`).
///
/// Method-specific arguments ride alongside `key` and `method` and are
/// relayed to the owning client untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterGetParams {
    /// The prefixed key the adapter serves.
    pub key: String,
    /// Method to invoke on the owner's object.
    pub method: String,
    /// Method-specific arguments.
    #[serde(flatten)]
    pub args: serde_json::Map<String, Value>,
}

/// One buffered command inside a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineCommand {
    /// Event name of the buffered command.
    pub event: String,
    /// Argument object of the buffered command.
    #[serde(default)]
    pub data: Value,
}

/// Arguments of the `pipeline` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineParams {
    /// Commands to execute in order.
    pub commands: Vec<PipelineCommand>,
}

/// One chunk of an oversized frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkMessage {
    /// Identifier shared by every chunk of one frame.
    pub id: String,
    /// Zero-based chunk sequence number.
    pub seq: u32,
    /// Total number of chunks.
    pub total: u32,
    /// Base64-encoded chunk bytes.
    pub data: String,
    /// Whether the reassembled payload is zlib-compressed.
    #[serde(default)]
    pub compressed: bool,
}
