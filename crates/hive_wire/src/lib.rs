//! hive Wire Format
//!
//! Typed protocol messages and the two-stage envelope codec: an outer
//! type tag selects the variant, the inner payload carries its fields.
//! All payloads use postcard for byte-stable encoding.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod message;

pub use codec::{Codec, CodecError, CodecResult};
pub use message::{
    Ack, GossipEntry, Leave, Message, MessageHeader, MessageType, Nack, Ping, PingReq,
    SyncRequest, SyncResponse, PROTOCOL_VERSION,
};
