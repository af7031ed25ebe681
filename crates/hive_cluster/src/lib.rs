//! Hive Cluster
//!
//! SWIM-style membership: the incarnation-ordered membership store,
//! infection-counter gossip dissemination, the transport contract and the
//! probe / indirect-probe / suspicion failure detector.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod broadcast;
pub mod detector;
pub mod membership;
pub mod transport;

pub use broadcast::BroadcastQueue;
pub use detector::{Detector, DetectorError, DetectorEvent, DetectorResult};
pub use membership::{Membership, Transition};
pub use transport::{NetworkMessage, Transport, TransportError, TransportResult};
