//! Functionality shared between the client and the server.

pub mod chunking;
pub mod url;

pub use chunking::{
    ChunkAssembler, OutboundPayload, DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_REASSEMBLY_TIMEOUT,
};
pub use url::ServerUrl;
