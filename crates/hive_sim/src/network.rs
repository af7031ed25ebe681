//! Simulated datagram network.
//!
//! A [`SimNetwork`] is a shared registry of [`SimTransport`]s keyed by
//! address plus a symmetric partition table. Delivery is evaluated in
//! order: partition, unknown address, stopped receiver, latency, loss,
//! full inbound queue. Every drop is silent and the sender always sees
//! success, as with UDP.

use crate::seed::SimSeed;
use async_trait::async_trait;
use bytes::Bytes;
use hive_cluster::{NetworkMessage, Transport, TransportError, TransportResult};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Capacity of each transport's inbound queue
pub const INBOUND_CAPACITY: usize = 100;

/// Shared simulated network
#[derive(Clone)]
pub struct SimNetwork {
    inner: Arc<NetworkInner>,
}

struct NetworkInner {
    transports: RwLock<HashMap<String, Arc<Endpoint>>>,
    /// addr -> addrs it cannot reach
    partitions: RwLock<HashMap<String, HashSet<String>>>,
    rng: Mutex<ChaCha8Rng>,
}

impl SimNetwork {
    /// Create a network whose loss decisions replay for `seed`
    #[must_use]
    pub fn new(seed: &SimSeed) -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                transports: RwLock::new(HashMap::new()),
                partitions: RwLock::new(HashMap::new()),
                rng: Mutex::new(seed.derive("network-loss").rng()),
            }),
        }
    }

    /// Create a transport attached at `addr`, replacing any previous one
    pub async fn transport(&self, addr: impl Into<String>) -> SimTransport {
        let endpoint = Arc::new(Endpoint::new(addr.into()));
        self.inner
            .transports
            .write()
            .await
            .insert(endpoint.addr.clone(), endpoint.clone());
        SimTransport {
            network: self.clone(),
            endpoint,
        }
    }

    /// Make `from` and each of `unreachable` unable to reach each other
    pub async fn partition(&self, from: &str, unreachable: &[&str]) {
        let mut partitions = self.inner.partitions.write().await;
        for addr in unreachable {
            partitions
                .entry(from.to_string())
                .or_default()
                .insert((*addr).to_string());
            partitions
                .entry((*addr).to_string())
                .or_default()
                .insert(from.to_string());
        }
    }

    /// Restore both directions between `a` and `b`
    pub async fn heal(&self, a: &str, b: &str) {
        let mut partitions = self.inner.partitions.write().await;
        if let Some(set) = partitions.get_mut(a) {
            set.remove(b);
        }
        if let Some(set) = partitions.get_mut(b) {
            set.remove(a);
        }
    }

    /// Remove every partition
    pub async fn heal_all(&self) {
        self.inner.partitions.write().await.clear();
    }

    /// Whether `from` cannot reach `to`
    pub async fn is_partitioned(&self, from: &str, to: &str) -> bool {
        self.inner
            .partitions
            .read()
            .await
            .get(from)
            .is_some_and(|set| set.contains(to))
    }

    async fn send(&self, from: &str, to: &str, payload: Bytes) {
        if self.is_partitioned(from, to).await {
            trace!(from, to, "dropped: partitioned");
            return;
        }
        let Some(target) = self.inner.transports.read().await.get(to).cloned() else {
            trace!(from, to, "dropped: unknown address");
            return;
        };
        if !target.is_running() {
            trace!(from, to, "dropped: receiver not running");
            return;
        }

        let faults = target.faults();
        if !faults.latency.is_zero() {
            tokio::time::sleep(faults.latency).await;
        }
        if faults.drop_rate > 0.0 && self.roll() < faults.drop_rate {
            trace!(from, to, "dropped: loss");
            return;
        }

        target.deliver(NetworkMessage::new(payload, from));
    }

    fn roll(&self) -> f64 {
        self.inner
            .rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .r#gen::<f64>()
    }
}

impl Default for SimNetwork {
    fn default() -> Self {
        Self::new(&SimSeed::default())
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Faults {
    drop_rate: f64,
    latency: Duration,
}

#[derive(Default)]
struct Channel {
    started: bool,
    tx: Option<mpsc::Sender<NetworkMessage>>,
    rx: Option<mpsc::Receiver<NetworkMessage>>,
}

struct Endpoint {
    addr: String,
    channel: Mutex<Channel>,
    faults: Mutex<Faults>,
    stopped: CancellationToken,
}

impl Endpoint {
    fn new(addr: String) -> Self {
        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        Self {
            addr,
            channel: Mutex::new(Channel {
                started: false,
                tx: Some(tx),
                rx: Some(rx),
            }),
            faults: Mutex::new(Faults::default()),
            stopped: CancellationToken::new(),
        }
    }

    fn channel(&self) -> std::sync::MutexGuard<'_, Channel> {
        self.channel.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn faults(&self) -> Faults {
        *self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_running(&self) -> bool {
        self.channel().started && !self.stopped.is_cancelled()
    }

    fn start(&self) -> TransportResult<()> {
        if self.stopped.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.channel().started = true;
        Ok(())
    }

    fn stop(&self) {
        self.stopped.cancel();
        // Dropping the only sender closes the inbound channel.
        self.channel().tx = None;
    }

    fn deliver(&self, message: NetworkMessage) {
        let channel = self.channel();
        let Some(tx) = channel.tx.as_ref() else {
            return;
        };
        if tx.try_send(message).is_err() {
            trace!(addr = %self.addr, "dropped: inbound queue full");
        }
    }
}

/// Transport attached to a [`SimNetwork`]
///
/// Cloning yields another handle to the same endpoint.
#[derive(Clone)]
pub struct SimTransport {
    network: SimNetwork,
    endpoint: Arc<Endpoint>,
}

impl SimTransport {
    /// Probability in `[0, 1]` that a datagram to this transport is lost
    pub fn set_drop_rate(&self, rate: f64) {
        self.endpoint
            .faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drop_rate = rate.clamp(0.0, 1.0);
    }

    /// Delay applied to every datagram sent to this transport
    pub fn set_latency(&self, latency: Duration) {
        self.endpoint
            .faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .latency = latency;
    }

    /// Whether the transport is started and not stopped
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.endpoint.is_running()
    }

    /// Network this transport is attached to
    #[must_use]
    pub fn network(&self) -> &SimNetwork {
        &self.network
    }
}

#[async_trait]
impl Transport for SimTransport {
    async fn start(&self, token: CancellationToken) -> TransportResult<()> {
        self.endpoint.start()?;
        let endpoint = self.endpoint.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => endpoint.stop(),
                _ = endpoint.stopped.cancelled() => {}
            }
        });
        Ok(())
    }

    async fn stop(&self) -> TransportResult<()> {
        self.endpoint.stop();
        Ok(())
    }

    async fn send_to(&self, addr: &str, payload: Bytes) -> TransportResult<()> {
        if !self.endpoint.is_running() {
            return Err(TransportError::NotRunning);
        }
        self.network.send(&self.endpoint.addr, addr, payload).await;
        Ok(())
    }

    fn messages(&self) -> Option<mpsc::Receiver<NetworkMessage>> {
        self.endpoint.channel().rx.take()
    }

    fn local_addr(&self) -> String {
        self.endpoint.addr.clone()
    }
}
