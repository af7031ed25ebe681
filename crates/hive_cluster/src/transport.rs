//! Transport contract.
//!
//! The detector only needs an unreliable, addressed datagram channel. A
//! send to an unreachable peer is not an error: deciding that a peer is
//! gone is the detector's job. The only failure surfaced to callers is a
//! transport that is not running.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Transport result type
pub type TransportResult<T> = Result<T, TransportError>;

/// Transport errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Used before start or after stop
    #[error("Transport is not running")]
    NotRunning,

    /// Inbound channel already closed, transport cannot be restarted
    #[error("Transport is closed")]
    Closed,
}

/// Datagram received from a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkMessage {
    /// Raw envelope bytes
    pub payload: Bytes,
    /// Sender address
    pub from: String,
    /// Receive time
    pub time: DateTime<Utc>,
}

impl NetworkMessage {
    /// Create a message stamped with the current time
    #[must_use]
    pub fn new(payload: Bytes, from: impl Into<String>) -> Self {
        Self {
            payload,
            from: from.into(),
            time: Utc::now(),
        }
    }
}

/// Addressed, unreliable message channel
#[async_trait]
pub trait Transport: Send + Sync {
    /// Begin accepting traffic; the transport stops when `token` is cancelled
    async fn start(&self, token: CancellationToken) -> TransportResult<()>;

    /// Stop the transport and close the inbound channel
    async fn stop(&self) -> TransportResult<()>;

    /// Send a datagram to `addr`
    ///
    /// Fails only with [`TransportError::NotRunning`]; undeliverable
    /// datagrams are dropped silently.
    async fn send_to(&self, addr: &str, payload: Bytes) -> TransportResult<()>;

    /// Take the inbound channel; `None` once taken
    fn messages(&self) -> Option<mpsc::Receiver<NetworkMessage>>;

    /// Address peers use to reach this transport
    fn local_addr(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(TransportError::NotRunning.to_string(), "Transport is not running");
        assert_eq!(TransportError::Closed.to_string(), "Transport is closed");
    }

    #[test]
    fn test_network_message_new() {
        let msg = NetworkMessage::new(Bytes::from_static(b"hi"), "10.0.0.1:7946");
        assert_eq!(msg.from, "10.0.0.1:7946");
        assert_eq!(&msg.payload[..], b"hi");
    }
}
