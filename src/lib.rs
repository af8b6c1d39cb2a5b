//! # znsocket
//!
//! A Redis-compatible in-memory data store served over WebSockets, with live
//! change notifications, distributed collection types and client-owned
//! adapters.
//!
//! The crate contains both halves of the system:
//!
//! - [`server`] — the data engine: a Redis-subset command executor over a
//!   pluggable [`StorageBackend`](server::storage::StorageBackend), a
//!   room-scoped refresh bus, an adapter registry tied to connection
//!   liveness, and a chunked transport for oversized payloads.
//! - [`client`] — the connection handle plus the distributed collections:
//!   [`List`], [`Dict`] and the copy-on-write [`Segments`] piece table, and
//!   the [`ListAdapter`]/[`DictAdapter`] types that serve in-process data to
//!   other clients.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use znsocket::{Client, List, Server};
//!
//! # async fn example() -> znsocket::Result<()> {
//! // Server side (usually the `znsocket server` binary).
//! let server = Server::builder().bind("127.0.0.1:5000").await?;
//! tokio::spawn(server.run());
//!
//! // Client side.
//! let client = Client::connect("znsocket://127.0.0.1:5000").await?;
//! let list = List::new(client, "results").await?;
//! list.push(serde_json::json!(42)).await?;
//! assert_eq!(list.len().await?, 1);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod client;
pub mod error;
pub mod server;
pub mod shared;
pub mod types;

pub use client::{
    Client, ClientBuilder, ConnectionState, Dict, DictAdapter, FallbackPolicy, ItemTransform,
    List, ListAdapter, ObjectRef, ObjectValue, Pipeline, Segments, Transformed,
};
pub use error::{Error, Result};
pub use server::Server;
