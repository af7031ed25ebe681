//! Protocol message types.
//!
//! Every variant starts with a [`MessageHeader`]. `Ping`, `PingReq` and
//! `Ack` carry a bounded list of piggybacked [`GossipEntry`] items;
//! `SyncRequest` and `SyncResponse` carry a full membership snapshot.

use chrono::Utc;
use hive_core::{Node, NodeId, NodeMetadata, NodeState};
use serde::{Deserialize, Serialize};

/// Current protocol version written into every header
pub const PROTOCOL_VERSION: u8 = 1;

/// Identifies the kind of protocol message.
///
/// The discriminant is the one-byte tag written into the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Direct probe
    Ping = 1,
    /// Indirect probe request
    PingReq = 2,
    /// Probe answer
    Ack = 3,
    /// Relay could not reach the indirect target
    Nack = 4,
    /// Push half of a full-state exchange
    Sync = 5,
    /// Pull half of a full-state exchange
    SyncResponse = 6,
    /// Voluntary departure
    Leave = 7,
}

impl MessageType {
    /// All message types in tag order
    pub const ALL: [MessageType; 7] = [
        MessageType::Ping,
        MessageType::PingReq,
        MessageType::Ack,
        MessageType::Nack,
        MessageType::Sync,
        MessageType::SyncResponse,
        MessageType::Leave,
    ];

    /// Envelope tag
    #[must_use]
    pub const fn tag(self) -> u8 {
        self as u8
    }

    /// Name used in logs
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            MessageType::Ping => "ping",
            MessageType::PingReq => "ping-req",
            MessageType::Ack => "ack",
            MessageType::Nack => "nack",
            MessageType::Sync => "sync",
            MessageType::SyncResponse => "sync-response",
            MessageType::Leave => "leave",
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        MessageType::ALL
            .into_iter()
            .find(|kind| kind.tag() == tag)
            .ok_or(tag)
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Header shared by all messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Protocol version of the sender
    pub version: u8,
    /// Message kind, must agree with the envelope tag
    pub kind: MessageType,
    /// Correlates a response with its request within one probe attempt
    pub seq_no: u32,
    /// Sender node
    pub source_id: NodeId,
}

impl MessageHeader {
    /// Create a header for the current protocol version
    #[must_use]
    pub fn new(kind: MessageType, seq_no: u32, source_id: NodeId) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            kind,
            seq_no,
            source_id,
        }
    }
}

/// A single claim about a node's membership state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipEntry {
    /// Node the claim is about
    pub node_id: NodeId,
    /// Probe address of that node
    pub address: String,
    /// Claimed state
    pub state: NodeState,
    /// Incarnation the claim refers to
    pub incarnation: u64,
    /// New metadata, `None` when unchanged
    pub metadata: Option<NodeMetadata>,
    /// Creation time in unix nanoseconds
    pub timestamp: i64,
}

impl GossipEntry {
    /// Create an entry stamped with the current time
    #[must_use]
    pub fn new(
        node_id: NodeId,
        address: impl Into<String>,
        state: NodeState,
        incarnation: u64,
    ) -> Self {
        Self {
            node_id,
            address: address.into(),
            state,
            incarnation,
            metadata: None,
            timestamp: Utc::now().timestamp_nanos_opt().unwrap_or_default(),
        }
    }

    /// Entry describing a node as currently known, metadata included
    #[must_use]
    pub fn from_node(node: &Node) -> Self {
        Self::new(node.id.clone(), node.address.clone(), node.state, node.incarnation)
            .with_metadata(node.metadata.clone())
    }

    /// Attach metadata
    #[must_use]
    pub fn with_metadata(mut self, metadata: NodeMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Direct probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    /// Header
    pub header: MessageHeader,
    /// Node expected to answer
    pub target: NodeId,
    /// Piggybacked dissemination
    pub gossip: Vec<GossipEntry>,
}

impl Ping {
    /// Create a ping
    #[must_use]
    pub fn new(seq_no: u32, source: NodeId, target: NodeId, gossip: Vec<GossipEntry>) -> Self {
        Self {
            header: MessageHeader::new(MessageType::Ping, seq_no, source),
            target,
            gossip,
        }
    }
}

/// Asks a relay to ping `target` on the sender's behalf
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingReq {
    /// Embedded ping; its header carries the `PingReq` kind
    pub ping: Ping,
    /// Address at which the relay reaches the target
    pub target_addr: String,
}

impl PingReq {
    /// Create an indirect probe request
    #[must_use]
    pub fn new(
        seq_no: u32,
        source: NodeId,
        target: NodeId,
        target_addr: impl Into<String>,
        gossip: Vec<GossipEntry>,
    ) -> Self {
        Self {
            ping: Ping {
                header: MessageHeader::new(MessageType::PingReq, seq_no, source),
                target,
                gossip,
            },
            target_addr: target_addr.into(),
        }
    }
}

/// Probe answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// Header; `source_id` is the node that was probed
    pub header: MessageHeader,
    /// Piggybacked dissemination, responder's own entry first
    pub gossip: Vec<GossipEntry>,
}

impl Ack {
    /// Create an ack
    #[must_use]
    pub fn new(seq_no: u32, source: NodeId, gossip: Vec<GossipEntry>) -> Self {
        Self {
            header: MessageHeader::new(MessageType::Ack, seq_no, source),
            gossip,
        }
    }
}

/// Relay failed to reach the indirect target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nack {
    /// Header
    pub header: MessageHeader,
}

impl Nack {
    /// Create a nack
    #[must_use]
    pub fn new(seq_no: u32, source: NodeId) -> Self {
        Self {
            header: MessageHeader::new(MessageType::Nack, seq_no, source),
        }
    }
}

/// Full-state push, answered with [`SyncResponse`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    /// Header
    pub header: MessageHeader,
    /// Sender's membership view
    pub entries: Vec<GossipEntry>,
}

impl SyncRequest {
    /// Create a sync request
    #[must_use]
    pub fn new(seq_no: u32, source: NodeId, entries: Vec<GossipEntry>) -> Self {
        Self {
            header: MessageHeader::new(MessageType::Sync, seq_no, source),
            entries,
        }
    }
}

/// Full-state pull answering a [`SyncRequest`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResponse {
    /// Header
    pub header: MessageHeader,
    /// Responder's membership view
    pub entries: Vec<GossipEntry>,
}

impl SyncResponse {
    /// Create a sync response
    #[must_use]
    pub fn new(seq_no: u32, source: NodeId, entries: Vec<GossipEntry>) -> Self {
        Self {
            header: MessageHeader::new(MessageType::SyncResponse, seq_no, source),
            entries,
        }
    }
}

/// Voluntary departure of the sender
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leave {
    /// Header
    pub header: MessageHeader,
    /// Incarnation at which the sender left
    pub incarnation: u64,
    /// Sender's probe address
    pub address: String,
}

impl Leave {
    /// Create a leave announcement
    #[must_use]
    pub fn new(seq_no: u32, source: NodeId, incarnation: u64, address: impl Into<String>) -> Self {
        Self {
            header: MessageHeader::new(MessageType::Leave, seq_no, source),
            incarnation,
            address: address.into(),
        }
    }

    /// Membership claim this announcement makes
    #[must_use]
    pub fn entry(&self) -> GossipEntry {
        GossipEntry::new(
            self.header.source_id.clone(),
            self.address.clone(),
            NodeState::Left,
            self.incarnation,
        )
    }
}

/// Closed set of protocol messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Direct probe
    Ping(Ping),
    /// Indirect probe request
    PingReq(PingReq),
    /// Probe answer
    Ack(Ack),
    /// Indirect probe failure
    Nack(Nack),
    /// Full-state push
    Sync(SyncRequest),
    /// Full-state pull
    SyncResponse(SyncResponse),
    /// Voluntary departure
    Leave(Leave),
}

impl Message {
    /// Kind of the variant
    #[must_use]
    pub const fn kind(&self) -> MessageType {
        match self {
            Message::Ping(_) => MessageType::Ping,
            Message::PingReq(_) => MessageType::PingReq,
            Message::Ack(_) => MessageType::Ack,
            Message::Nack(_) => MessageType::Nack,
            Message::Sync(_) => MessageType::Sync,
            Message::SyncResponse(_) => MessageType::SyncResponse,
            Message::Leave(_) => MessageType::Leave,
        }
    }

    /// Shared header
    #[must_use]
    pub fn header(&self) -> &MessageHeader {
        match self {
            Message::Ping(m) => &m.header,
            Message::PingReq(m) => &m.ping.header,
            Message::Ack(m) => &m.header,
            Message::Nack(m) => &m.header,
            Message::Sync(m) => &m.header,
            Message::SyncResponse(m) => &m.header,
            Message::Leave(m) => &m.header,
        }
    }

    /// Membership claims carried by the message, piggybacked or full-state
    #[must_use]
    pub fn gossip(&self) -> &[GossipEntry] {
        match self {
            Message::Ping(m) => &m.gossip,
            Message::PingReq(m) => &m.ping.gossip,
            Message::Ack(m) => &m.gossip,
            Message::Sync(m) => &m.entries,
            Message::SyncResponse(m) => &m.entries,
            Message::Nack(_) | Message::Leave(_) => &[],
        }
    }

    /// Mutable piggyback list, `None` for variants that carry none
    pub fn piggyback_mut(&mut self) -> Option<&mut Vec<GossipEntry>> {
        match self {
            Message::Ping(m) => Some(&mut m.gossip),
            Message::PingReq(m) => Some(&mut m.ping.gossip),
            Message::Ack(m) => Some(&mut m.gossip),
            _ => None,
        }
    }
}
