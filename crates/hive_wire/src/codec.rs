//! Envelope codec.
//!
//! Wire layout: a postcard-encoded envelope `{ tag: u8, payload: bytes }`
//! where `payload` is the postcard encoding of the variant body. The
//! receiver dispatches on `tag` before committing to a concrete decode.
//!
//! Decoding never panics; every malformed input maps to a [`CodecError`].
//! An unknown tag is reported as [`CodecError::UnknownMessageType`] so the
//! caller can treat newer message kinds as a soft failure and skip them.

use crate::message::{
    Ack, GossipEntry, Leave, Message, MessageHeader, MessageType, Nack, Ping, PingReq,
    SyncRequest, SyncResponse,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Codec result type
pub type CodecResult<T> = Result<T, CodecError>;

/// Bytes reserved for length prefixes that grow with a gossip list
pub const GOSSIP_SLACK: usize = 8;

/// Codec errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Tag not registered with this codec
    #[error("Unknown message type: {0}")]
    UnknownMessageType(u8),

    /// Variant serialized to zero bytes
    #[error("Message payload is empty")]
    EmptyPayload,

    /// Envelope truncated or corrupt
    #[error("Malformed envelope")]
    MalformedEnvelope,

    /// Payload does not decode as the tagged variant
    #[error("Malformed payload for {0}")]
    MalformedPayload(MessageType),

    /// Header kind disagrees with the variant
    #[error("Header kind {header} does not match {variant}")]
    KindMismatch {
        /// Kind of the enclosing variant
        variant: MessageType,
        /// Kind written in the header
        header: MessageType,
    },

    /// Serialization failed
    #[error("Encoding failed: {0}")]
    Encode(String),
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    tag: u8,
    payload: Vec<u8>,
}

/// Encodes and decodes protocol messages.
///
/// Holds the set of registered message types; anything outside it is
/// rejected in both directions. Stateless across messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Codec {
    registered: BTreeSet<MessageType>,
}

impl Codec {
    /// Codec understanding every message type
    #[must_use]
    pub fn new() -> Self {
        Self::with_types(MessageType::ALL)
    }

    /// Codec restricted to the given message types
    #[must_use]
    pub fn with_types(types: impl IntoIterator<Item = MessageType>) -> Self {
        Self {
            registered: types.into_iter().collect(),
        }
    }

    /// Whether a message type is registered
    #[must_use]
    pub fn is_registered(&self, kind: MessageType) -> bool {
        self.registered.contains(&kind)
    }

    /// Encode a message into envelope bytes
    ///
    /// # Errors
    ///
    /// Returns error if the type is unregistered, the header disagrees with
    /// the variant, or serialization fails
    pub fn encode(&self, message: &Message) -> CodecResult<Vec<u8>> {
        let kind = message.kind();
        if !self.is_registered(kind) {
            return Err(CodecError::UnknownMessageType(kind.tag()));
        }
        check_kind(kind, message.header())?;

        let payload = match message {
            Message::Ping(m) => to_bytes(m),
            Message::PingReq(m) => to_bytes(m),
            Message::Ack(m) => to_bytes(m),
            Message::Nack(m) => to_bytes(m),
            Message::Sync(m) => to_bytes(m),
            Message::SyncResponse(m) => to_bytes(m),
            Message::Leave(m) => to_bytes(m),
        }?;
        if payload.is_empty() {
            return Err(CodecError::EmptyPayload);
        }

        to_bytes(&Envelope {
            tag: kind.tag(),
            payload,
        })
    }

    /// Decode envelope bytes into a message
    ///
    /// # Errors
    ///
    /// Returns error on a corrupt envelope, an unregistered tag, or a
    /// payload that does not decode as the tagged variant
    pub fn decode(&self, bytes: &[u8]) -> CodecResult<Message> {
        let envelope: Envelope =
            from_exact_bytes(bytes).ok_or(CodecError::MalformedEnvelope)?;
        let kind = MessageType::try_from(envelope.tag).map_err(CodecError::UnknownMessageType)?;
        if !self.is_registered(kind) {
            return Err(CodecError::UnknownMessageType(envelope.tag));
        }
        if envelope.payload.is_empty() {
            return Err(CodecError::MalformedPayload(kind));
        }

        let payload = envelope.payload.as_slice();
        let message = match kind {
            MessageType::Ping => Message::Ping(decode_payload::<Ping>(kind, payload)?),
            MessageType::PingReq => Message::PingReq(decode_payload::<PingReq>(kind, payload)?),
            MessageType::Ack => Message::Ack(decode_payload::<Ack>(kind, payload)?),
            MessageType::Nack => Message::Nack(decode_payload::<Nack>(kind, payload)?),
            MessageType::Sync => Message::Sync(decode_payload::<SyncRequest>(kind, payload)?),
            MessageType::SyncResponse => {
                Message::SyncResponse(decode_payload::<SyncResponse>(kind, payload)?)
            }
            MessageType::Leave => Message::Leave(decode_payload::<Leave>(kind, payload)?),
        };
        check_kind(kind, message.header())?;
        Ok(message)
    }

    /// Encoded size of a message
    ///
    /// # Errors
    ///
    /// Returns error if the message cannot be encoded
    pub fn encoded_len(&self, message: &Message) -> CodecResult<usize> {
        self.encode(message).map(|bytes| bytes.len())
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new()
    }
}

/// Encoded size of a single gossip entry inside a list
#[must_use]
pub fn entry_len(entry: &GossipEntry) -> usize {
    postcard::to_allocvec(entry).map(|v| v.len()).unwrap_or(usize::MAX)
}

fn check_kind(variant: MessageType, header: &MessageHeader) -> CodecResult<()> {
    if header.kind == variant {
        Ok(())
    } else {
        Err(CodecError::KindMismatch {
            variant,
            header: header.kind,
        })
    }
}

fn to_bytes<T: Serialize>(value: &T) -> CodecResult<Vec<u8>> {
    postcard::to_allocvec(value).map_err(|e| CodecError::Encode(e.to_string()))
}

/// Decode a value that must span the whole input
fn from_exact_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Option<T> {
    match postcard::take_from_bytes::<T>(bytes) {
        Ok((value, [])) => Some(value),
        _ => None,
    }
}

fn decode_payload<T: DeserializeOwned>(kind: MessageType, payload: &[u8]) -> CodecResult<T> {
    from_exact_bytes(payload).ok_or(CodecError::MalformedPayload(kind))
}
