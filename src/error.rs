//! Error types for znsocket operations.
//!
//! Every error that can cross the wire maps onto a `(msg, type)` pair in the
//! `{"error": {"msg": ..., "type": ...}}` reply format; purely local failures
//! (transport, serialization) keep their own variants and are never
//! reconstructed on the remote side.

use serde::{Deserialize, Serialize};

/// Result type alias using the znsocket error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for all znsocket operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Redis-style semantic error (`no such key`, `index out of range`,
    /// `WRONGTYPE ...`, `value is not an integer or out of range`).
    #[error("{0}")]
    Response(String),

    /// Invalid input shape on a write (unsupported value type, null where
    /// disallowed).
    #[error("{0}")]
    Data(String),

    /// Write attempted on an adapter-backed or frozen-fallback object.
    #[error("cannot modify frozen storage behind key '{key}'")]
    FrozenStorage {
        /// The prefixed key of the frozen object.
        key: String,
    },

    /// Transport-level connection failure.
    #[error("could not connect to {address}; is the znsocket server running?")]
    Connection {
        /// Address the connection was attempted against.
        address: String,
    },

    /// A chunked reassembly or adapter call exceeded its deadline.
    #[error("{0}")]
    Timeout(String),

    /// An adapter owner received a method it does not implement.
    #[error("adapter method '{method}' is not implemented")]
    NotImplemented {
        /// The requested method name.
        method: String,
    },

    /// A missing key: unknown adapter, vanished owner, or absent dict entry.
    #[error("{key}")]
    KeyError {
        /// The key that was not found.
        key: String,
    },

    /// The connection was closed while an operation was in flight.
    #[error("connection closed")]
    ConnectionClosed,

    /// A frame could not be parsed or violated the protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Underlying WebSocket failure.
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// An operation was attempted in the wrong connection state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Index out of range on a client-side collection.
    #[error("list index out of range")]
    IndexOutOfRange,

    /// Attempt to store an object inside itself.
    #[error("cannot set circular reference to self")]
    SelfReference,
}

impl Error {
    /// Shorthand for a [`Error::Response`].
    pub fn response(msg: impl Into<String>) -> Self {
        Error::Response(msg.into())
    }

    /// Shorthand for a [`Error::Data`].
    pub fn data(msg: impl Into<String>) -> Self {
        Error::Data(msg.into())
    }

    /// The `WRONGTYPE` error every wrong-type storage access raises.
    pub fn wrong_type() -> Self {
        Error::Response("WRONGTYPE Operation against a key holding the wrong kind of value".into())
    }

    /// Wire type tag for this error, or `None` for purely local errors.
    fn wire_type(&self) -> Option<&'static str> {
        match self {
            Error::Response(_) => Some("ResponseError"),
            Error::Data(_) => Some("DataError"),
            Error::FrozenStorage { .. } => Some("FrozenStorageError"),
            Error::Connection { .. } | Error::ConnectionClosed => Some("ConnectionError"),
            Error::Timeout(_) => Some("TimeoutError"),
            Error::NotImplemented { .. } => Some("NotImplementedError"),
            Error::KeyError { .. } => Some("KeyError"),
            _ => None,
        }
    }

    /// Convert to the `{msg, type}` wire representation.
    ///
    /// Local-only errors degrade to `ResponseError` so that a remote peer
    /// always receives a recognised type tag.
    pub fn to_wire(&self) -> WireError {
        WireError {
            msg: self.to_string(),
            kind: self.wire_type().unwrap_or("ResponseError").to_string(),
        }
    }
}

/// Error payload as it appears on the wire: `{"msg": ..., "type": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    /// Human-readable message.
    pub msg: String,
    /// Type tag used to reconstruct the typed error on the remote side.
    #[serde(rename = "type")]
    pub kind: String,
}

impl WireError {
    /// Reconstruct the typed error from its wire representation.
    pub fn into_error(self) -> Error {
        match self.kind.as_str() {
            "DataError" => Error::Data(self.msg),
            "FrozenStorageError" => Error::FrozenStorage { key: self.msg },
            "ConnectionError" => Error::Connection { address: self.msg },
            "TimeoutError" => Error::Timeout(self.msg),
            "NotImplementedError" => Error::NotImplemented { method: self.msg },
            "KeyError" => Error::KeyError { key: self.msg },
            // ResponseError and anything unrecognised.
            _ => Error::Response(self.msg),
        }
    }
}

impl From<WireError> for Error {
    fn from(wire: WireError) -> Self {
        wire.into_error()
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => Error::ConnectionClosed,
            other => Error::WebSocket(other.to_string()),
        }
    }
}
