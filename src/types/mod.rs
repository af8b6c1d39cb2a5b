//! Wire protocol types.
//!
//! Everything that crosses a socket is defined here: the frame envelopes,
//! the storage command set, the adapter RPC payloads, the chunked-transport
//! messages and the refresh notifications.

pub mod protocol;
pub mod refresh;

pub use protocol::{
    AdapterGetParams, ChunkMessage, Command, Frame, InsertWhere, JoinParams, KeyParams,
    PipelineCommand, PipelineParams, ReplyFrame, RequestFrame,
};
pub use refresh::{RefreshData, RefreshPayload};
