//! SWIM failure detector.
//!
//! One probe round runs per `probe_interval`:
//!
//! 1. pick a random live peer and `Ping` it
//! 2. wait up to `probe_timeout` for the matching `Ack`
//! 3. otherwise ask up to `indirect_nodes` peers to probe it (`PingReq`)
//! 4. if no direct or relayed `Ack` arrives before the round ends, the
//!    peer becomes `Suspect`
//!
//! A suspect that does not refute within `probe_timeout * suspicion_mult`
//! is declared `Dead`. Every inbound message is first scanned for
//! piggybacked gossip, which is merged independently of the probe outcome.
//! Claims that the local node is anything but alive are refuted by bumping
//! the local incarnation.
//!
//! Every `push_pull_interval` the full local view is also exchanged with one
//! random known node, dead ones included, so both sides of a healed
//! partition learn what the other decided about them and can refute it.

use crate::broadcast::BroadcastQueue;
use crate::membership::{Membership, Transition};
use crate::transport::{NetworkMessage, Transport, TransportError};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use hive_core::{Config, Node, NodeId, NodeMetadata, NodeState};
use hive_wire::codec::GOSSIP_SLACK;
use hive_wire::{
    Ack, Codec, CodecError, GossipEntry, Leave, Message, Nack, Ping, PingReq, SyncRequest,
    SyncResponse,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

const EVENT_CAPACITY: usize = 256;

/// Detector result type
pub type DetectorResult<T> = Result<T, DetectorError>;

/// Detector errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DetectorError {
    /// `start` called twice
    #[error("Detector already started")]
    AlreadyStarted,

    /// Transport refused the operation
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Outgoing message could not be encoded
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Membership change observed by the local detector
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectorEvent {
    /// Node seen for the first time
    Joined(NodeId),
    /// Node became suspect
    Suspected {
        /// Node
        id: NodeId,
        /// Incarnation under suspicion
        incarnation: u64,
    },
    /// Suspect or dead node came back at a higher incarnation
    Alive {
        /// Node
        id: NodeId,
        /// Refuting incarnation
        incarnation: u64,
    },
    /// Suspicion expired
    Dead(NodeId),
    /// Node left voluntarily
    Left(NodeId),
    /// Tombstone removed from the local view
    Reaped(NodeId),
}

impl DetectorEvent {
    /// Events for one accepted transition, in the order they happened
    ///
    /// A node first heard of as suspect both joins and is suspected.
    fn from_transition(id: &NodeId, transition: &Transition) -> Vec<Self> {
        let mut events = Vec::new();
        if transition.is_new() && transition.current.is_live() {
            events.push(Self::Joined(id.clone()));
        }
        match (transition.previous, transition.current) {
            (_, NodeState::Suspect) => events.push(Self::Suspected {
                id: id.clone(),
                incarnation: transition.incarnation,
            }),
            (Some(previous), NodeState::Alive) if previous != NodeState::Alive => {
                events.push(Self::Alive {
                    id: id.clone(),
                    incarnation: transition.incarnation,
                });
            }
            (_, NodeState::Dead) => events.push(Self::Dead(id.clone())),
            (_, NodeState::Left) => events.push(Self::Left(id.clone())),
            _ => {}
        }
        events
    }
}

/// Handle to a running failure detector
///
/// Cloning yields another handle to the same detector.
#[derive(Clone)]
pub struct Detector {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    local_id: NodeId,
    local_addr: String,
    membership: Membership,
    broadcasts: AsyncMutex<BroadcastQueue>,
    transport: Arc<dyn Transport>,
    codec: Codec,
    /// Probe waiters keyed by sequence number
    pending: Mutex<HashMap<u32, oneshot::Sender<Ack>>>,
    seq: AtomicU32,
    events: broadcast::Sender<DetectorEvent>,
    token: CancellationToken,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Detector {
    /// Create a detector over `transport`
    #[must_use]
    pub fn new(config: Config, transport: Arc<dyn Transport>) -> Self {
        Self::with_membership(config, transport, Membership::new())
    }

    /// Create a detector with a caller-supplied (e.g. seeded) membership store
    #[must_use]
    pub fn with_membership(
        config: Config,
        transport: Arc<dyn Transport>,
        membership: Membership,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                local_id: config.node.id.clone(),
                local_addr: transport.local_addr(),
                broadcasts: AsyncMutex::new(BroadcastQueue::new(config.gossip.max_broadcast)),
                config,
                membership,
                transport,
                codec: Codec::new(),
                pending: Mutex::new(HashMap::new()),
                seq: AtomicU32::new(0),
                events,
                token: CancellationToken::new(),
                started: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Local node ID
    #[must_use]
    pub fn local_id(&self) -> &NodeId {
        &self.inner.local_id
    }

    /// Address peers probe this node at
    #[must_use]
    pub fn local_addr(&self) -> &str {
        &self.inner.local_addr
    }

    /// Configuration in effect
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Local membership view
    #[must_use]
    pub fn membership(&self) -> &Membership {
        &self.inner.membership
    }

    /// Subscribe to membership events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DetectorEvent> {
        self.inner.events.subscribe()
    }

    /// Whether the detector has been started and not shut down
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst) && !self.inner.token.is_cancelled()
    }

    /// Current local incarnation
    pub async fn incarnation(&self) -> u64 {
        self.inner.self_node().await.incarnation
    }

    /// Start the transport, the inbound handler and the probe loop
    ///
    /// # Errors
    ///
    /// Returns error if already started or the transport fails to start.
    /// A failed start can be retried.
    pub async fn start(&self) -> DetectorResult<()> {
        let inner = &self.inner;
        if inner.started.swap(true, Ordering::SeqCst) {
            return Err(DetectorError::AlreadyStarted);
        }

        let inbox = match inner.open_transport().await {
            Ok(inbox) => inbox,
            Err(err) => {
                inner.started.store(false, Ordering::SeqCst);
                warn!(node = %inner.local_id, error = %err, "failure detector did not start");
                return Err(err);
            }
        };

        let me = GossipEntry::new(
            inner.local_id.clone(),
            inner.local_addr.clone(),
            NodeState::Alive,
            0,
        );
        if inner.membership.merge(&me).await {
            inner.broadcasts.lock().await.push(me);
        }

        let mut tasks = vec![
            tokio::spawn(inner.clone().receive_loop(inbox)),
            tokio::spawn(inner.clone().probe_loop()),
        ];
        if let Some(period) = inner.config.gossip.push_pull_interval() {
            tasks.push(tokio::spawn(inner.clone().push_pull_loop(period)));
        }
        inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(tasks);

        info!(node = %inner.local_id, addr = %inner.local_addr, "failure detector started");
        Ok(())
    }

    /// Push local state to each seed and merge what they send back
    ///
    /// Returns the number of seeds contacted.
    ///
    /// # Errors
    ///
    /// Returns error if the transport is not running
    pub async fn join(&self, seeds: &[String]) -> DetectorResult<usize> {
        let inner = &self.inner;
        let entries = inner.snapshot().await;
        let mut contacted = 0;
        for seed in seeds.iter().filter(|seed| **seed != inner.local_addr) {
            let sync = Message::Sync(SyncRequest::new(
                inner.next_seq(),
                inner.local_id.clone(),
                entries.clone(),
            ));
            inner.send(seed, &sync).await?;
            contacted += 1;
        }
        info!(node = %inner.local_id, contacted, "join requested");
        Ok(contacted)
    }

    /// Leave the cluster
    ///
    /// Marks the local node `Left` at a fresh incarnation and announces it
    /// to up to `indirect_nodes` peers. Probing stops; pings are still
    /// answered so the departure keeps spreading.
    ///
    /// # Errors
    ///
    /// Returns error if the transport is not running
    pub async fn leave(&self) -> DetectorResult<()> {
        let inner = &self.inner;
        let Some(entry) = inner.bump_self(NodeState::Left, 0, None).await else {
            debug!(node = %inner.local_id, "already left");
            return Ok(());
        };
        let announce = Message::Leave(Leave::new(
            inner.next_seq(),
            inner.local_id.clone(),
            entry.incarnation,
            inner.local_addr.clone(),
        ));

        let peers = inner
            .membership
            .random_nodes(
                inner.config.failure_detector.indirect_nodes,
                std::slice::from_ref(&inner.local_id),
            )
            .await;
        for peer in &peers {
            inner.send(&peer.address, &announce).await?;
        }

        let _ = inner.events.send(DetectorEvent::Left(inner.local_id.clone()));
        info!(
            node = %inner.local_id,
            incarnation = entry.incarnation,
            notified = peers.len(),
            "left cluster"
        );
        Ok(())
    }

    /// Replace local metadata and disseminate it at a fresh incarnation
    ///
    /// Returns the new incarnation, or `None` once the node has left.
    pub async fn update_metadata(&self, metadata: NodeMetadata) -> Option<u64> {
        let entry = self
            .inner
            .bump_self(NodeState::Alive, 0, Some(metadata))
            .await?;
        debug!(node = %self.inner.local_id, incarnation = entry.incarnation, "metadata updated");
        Some(entry.incarnation)
    }

    /// Stop background tasks and the transport
    ///
    /// # Errors
    ///
    /// Returns error if the transport fails to stop
    pub async fn shutdown(&self) -> DetectorResult<()> {
        let inner = &self.inner;
        inner.token.cancel();
        let tasks: Vec<_> = inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        join_all(tasks).await;
        inner.transport.stop().await?;
        info!(node = %inner.local_id, "failure detector stopped");
        Ok(())
    }
}

impl Inner {
    async fn open_transport(&self) -> DetectorResult<mpsc::Receiver<NetworkMessage>> {
        self.transport.start(self.token.child_token()).await?;
        match self.transport.messages() {
            Some(inbox) => Ok(inbox),
            None => {
                let _ = self.transport.stop().await;
                Err(TransportError::Closed.into())
            }
        }
    }

    fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    fn register(&self, seq: u32) -> oneshot::Receiver<Ack> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(seq, tx);
        rx
    }

    fn forget(&self, seq: u32) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&seq);
    }

    async fn self_node(&self) -> Node {
        self.membership
            .get_node(&self.local_id)
            .await
            .unwrap_or_else(|| Node::new(self.local_id.clone(), self.local_addr.clone()))
    }

    async fn snapshot(&self) -> Vec<GossipEntry> {
        self.membership
            .all_nodes()
            .await
            .iter()
            .map(GossipEntry::from_node)
            .collect()
    }

    async fn send(&self, addr: &str, message: &Message) -> DetectorResult<()> {
        let bytes = self.codec.encode(message)?;
        self.transport.send_to(addr, Bytes::from(bytes)).await?;
        Ok(())
    }

    /// Fill the piggyback list from the broadcast queue within packet limits
    async fn piggyback(&self, message: &mut Message) {
        let base = match self.codec.encoded_len(message) {
            Ok(len) => len,
            Err(err) => {
                warn!(node = %self.local_id, error = %err, "cannot size outgoing message");
                return;
            }
        };
        let gossip = &self.config.gossip;
        let budget = gossip.max_packet_size.saturating_sub(base + GOSSIP_SLACK);
        let Some(list) = message.piggyback_mut() else {
            return;
        };
        let room = gossip.max_gossip_entries.saturating_sub(list.len());
        let picked = self.broadcasts.lock().await.select(room, budget);
        for entry in picked {
            if !list.iter().any(|e| e.node_id == entry.node_id) {
                list.push(entry);
            }
        }
    }

    /// Bump the local incarnation past `floor` and disseminate the new entry
    async fn bump_self(
        &self,
        state: NodeState,
        floor: u64,
        metadata: Option<NodeMetadata>,
    ) -> Option<GossipEntry> {
        let entry = self
            .membership
            .advance(&self.local_id, &self.local_addr, state, floor, metadata)
            .await?;
        self.broadcasts.lock().await.push(entry.clone());
        Some(entry)
    }

    async fn receive_loop(self: Arc<Self>, mut inbox: mpsc::Receiver<NetworkMessage>) {
        loop {
            let datagram = tokio::select! {
                _ = self.token.cancelled() => break,
                datagram = inbox.recv() => match datagram {
                    Some(datagram) => datagram,
                    None => break,
                },
            };
            self.handle(datagram).await;
        }
        debug!(node = %self.local_id, "inbound handler stopped");
    }

    async fn handle(self: &Arc<Self>, datagram: NetworkMessage) {
        let message = match self.codec.decode(&datagram.payload) {
            Ok(message) => message,
            Err(err) => {
                warn!(
                    node = %self.local_id,
                    from = %datagram.from,
                    error = %err,
                    "dropping undecodable datagram"
                );
                return;
            }
        };
        let header = message.header().clone();
        trace!(
            node = %self.local_id,
            kind = %header.kind,
            seq = header.seq_no,
            from = %datagram.from,
            "received"
        );

        for entry in message.gossip() {
            self.apply(entry).await;
        }

        match message {
            Message::Ping(ping) => self.answer_ping(ping, &datagram.from).await,
            Message::PingReq(req) => {
                tokio::spawn(self.clone().relay(req, datagram.from));
            }
            Message::Ack(ack) => self.complete(ack),
            Message::Nack(nack) => {
                debug!(
                    node = %self.local_id,
                    seq = nack.header.seq_no,
                    relay = %nack.header.source_id,
                    "relay could not reach target"
                );
            }
            Message::Sync(_) => {
                let reply = Message::SyncResponse(SyncResponse::new(
                    header.seq_no,
                    self.local_id.clone(),
                    self.snapshot().await,
                ));
                if let Err(err) = self.send(&datagram.from, &reply).await {
                    debug!(node = %self.local_id, error = %err, "sync response not sent");
                }
            }
            Message::SyncResponse(response) => {
                debug!(
                    node = %self.local_id,
                    from = %header.source_id,
                    entries = response.entries.len(),
                    "merged sync response"
                );
            }
            Message::Leave(leave) => self.apply(&leave.entry()).await,
        }
    }

    /// Merge one claim; claims about the local node may trigger a refutation
    async fn apply(self: &Arc<Self>, entry: &GossipEntry) {
        if entry.node_id == self.local_id {
            self.check_self_claim(entry).await;
            return;
        }
        if let Some(transition) = self.membership.merge_transition(entry).await {
            self.record(entry.clone(), transition).await;
        }
    }

    async fn record(self: &Arc<Self>, entry: GossipEntry, transition: Transition) {
        let id = entry.node_id.clone();
        match transition.current {
            NodeState::Suspect => {
                info!(node = %self.local_id, peer = %id, incarnation = transition.incarnation, "peer suspected");
                self.start_suspicion(id.clone(), transition.incarnation);
            }
            NodeState::Dead => info!(node = %self.local_id, peer = %id, "peer declared dead"),
            NodeState::Left => info!(node = %self.local_id, peer = %id, "peer left"),
            NodeState::Alive => debug!(
                node = %self.local_id,
                peer = %id,
                incarnation = transition.incarnation,
                "peer alive"
            ),
        }
        for event in DetectorEvent::from_transition(&id, &transition) {
            let _ = self.events.send(event);
        }
        self.broadcasts.lock().await.push(entry);
    }

    async fn check_self_claim(&self, entry: &GossipEntry) {
        let Some(refuted) = self
            .membership
            .refute(&self.local_id, &self.local_addr, entry)
            .await
        else {
            return;
        };
        self.broadcasts.lock().await.push(refuted.clone());
        info!(
            node = %self.local_id,
            claimed = %entry.state,
            incarnation = refuted.incarnation,
            "refuting claim about self"
        );
    }

    /// Synthesize a claim about a known peer at its current incarnation
    async fn mark(self: &Arc<Self>, id: &NodeId, state: NodeState, incarnation: Option<u64>) {
        let Some(node) = self.membership.get_node(id).await else {
            return;
        };
        let entry = GossipEntry::new(
            id.clone(),
            node.address,
            state,
            incarnation.unwrap_or(node.incarnation),
        );
        self.apply(&entry).await;
    }

    fn start_suspicion(self: &Arc<Self>, id: NodeId, incarnation: u64) {
        tokio::spawn(self.clone().expire_suspicion(id, incarnation));
    }

    /// Declare `id` dead unless it refutes `incarnation` in time
    fn expire_suspicion(self: Arc<Self>, id: NodeId, incarnation: u64) -> BoxFuture<'static, ()> {
        let timeout = self.config.failure_detector.suspicion_timeout();
        async move {
            tokio::select! {
                _ = self.token.cancelled() => {}
                _ = time::sleep(timeout) => {
                    self.mark(&id, NodeState::Dead, Some(incarnation)).await;
                }
            }
        }
        .boxed()
    }

    fn complete(&self, ack: Ack) {
        let seq = ack.header.seq_no;
        let waiter = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&seq);
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(ack);
            }
            None => trace!(node = %self.local_id, seq, "late or unsolicited ack"),
        }
    }

    async fn answer_ping(&self, ping: Ping, reply_to: &str) {
        if ping.target != self.local_id {
            debug!(node = %self.local_id, target = %ping.target, "ignoring ping for another node");
            return;
        }
        let me = GossipEntry::from_node(&self.self_node().await);
        let mut ack = Message::Ack(Ack::new(ping.header.seq_no, self.local_id.clone(), vec![me]));
        self.piggyback(&mut ack).await;
        if let Err(err) = self.send(reply_to, &ack).await {
            debug!(node = %self.local_id, to = reply_to, error = %err, "ack not sent");
        }
    }

    /// Probe a target on behalf of another node and report back
    async fn relay(self: Arc<Self>, req: PingReq, reply_to: String) {
        let origin_seq = req.ping.header.seq_no;
        let target = req.ping.target.clone();
        let seq = self.next_seq();
        let mut waiter = self.register(seq);

        let mut ping = Message::Ping(Ping::new(seq, self.local_id.clone(), target.clone(), Vec::new()));
        self.piggyback(&mut ping).await;
        let reached = match self.send(&req.target_addr, &ping).await {
            Ok(()) => time::timeout(self.config.failure_detector.probe_timeout(), &mut waiter)
                .await
                .ok()
                .and_then(Result::ok),
            Err(err) => {
                debug!(node = %self.local_id, target = %target, error = %err, "relay ping not sent");
                None
            }
        };
        self.forget(seq);

        let reply = match reached {
            Some(ack) => Message::Ack(Ack::new(origin_seq, ack.header.source_id, ack.gossip)),
            None => Message::Nack(Nack::new(origin_seq, self.local_id.clone())),
        };
        if let Err(err) = self.send(&reply_to, &reply).await {
            debug!(node = %self.local_id, to = %reply_to, error = %err, "relay reply not sent");
        }
    }

    async fn probe_loop(self: Arc<Self>) {
        let mut ticker = time::interval(self.config.failure_detector.probe_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                _ = self.token.cancelled() => break,
                () = self.probe_round() => {}
            }
            self.reap_tombstones(Utc::now()).await;
        }
        debug!(node = %self.local_id, "probe loop stopped");
    }

    async fn push_pull_loop(self: Arc<Self>, period: Duration) {
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.push_pull().await;
        }
        debug!(node = %self.local_id, "push/pull loop stopped");
    }

    /// Send the full local view to one random known node
    async fn push_pull(&self) {
        if self.self_node().await.state == NodeState::Left {
            return;
        }
        let exclude = [self.local_id.clone()];
        let Some(peer) = self.membership.random_known(&exclude).await else {
            return;
        };
        let sync = Message::Sync(SyncRequest::new(
            self.next_seq(),
            self.local_id.clone(),
            self.snapshot().await,
        ));
        match self.send(&peer.address, &sync).await {
            Ok(()) => trace!(node = %self.local_id, peer = %peer.id, state = %peer.state, "push/pull"),
            Err(err) => debug!(node = %self.local_id, peer = %peer.id, error = %err, "push/pull not sent"),
        }
    }

    async fn probe_round(self: &Arc<Self>) {
        if self.self_node().await.state == NodeState::Left {
            return;
        }
        let exclude = [self.local_id.clone()];
        let Some(target) = self.membership.random_node(&exclude).await else {
            trace!(node = %self.local_id, "no probe target");
            return;
        };

        let fd = &self.config.failure_detector;
        let deadline = Instant::now() + fd.probe_interval();
        let seq = self.next_seq();
        let mut waiter = self.register(seq);

        // A suspect learns of its suspicion from the probe itself.
        let mut claims = Vec::new();
        if target.is_suspect() {
            claims.push(GossipEntry::from_node(&target));
        }
        let mut ping = Message::Ping(Ping::new(seq, self.local_id.clone(), target.id.clone(), claims));
        self.piggyback(&mut ping).await;
        let direct = match self.send(&target.address, &ping).await {
            Ok(()) => matches!(time::timeout(fd.probe_timeout(), &mut waiter).await, Ok(Ok(_))),
            Err(err) => {
                debug!(node = %self.local_id, target = %target.id, error = %err, "probe not sent");
                false
            }
        };
        let acked = direct || self.indirect_probe(&target, seq, deadline, &mut waiter).await;
        self.forget(seq);

        if acked {
            self.membership.touch(&target.id).await;
            trace!(node = %self.local_id, target = %target.id, seq, "probe acked");
        } else {
            debug!(node = %self.local_id, target = %target.id, seq, "probe failed");
            self.mark(&target.id, NodeState::Suspect, None).await;
        }
    }

    async fn indirect_probe(
        &self,
        target: &Node,
        seq: u32,
        deadline: Instant,
        waiter: &mut oneshot::Receiver<Ack>,
    ) -> bool {
        let exclude = [self.local_id.clone(), target.id.clone()];
        let relays = self
            .membership
            .random_nodes(self.config.failure_detector.indirect_nodes, &exclude)
            .await;
        for relay in &relays {
            let mut req = Message::PingReq(PingReq::new(
                seq,
                self.local_id.clone(),
                target.id.clone(),
                target.address.clone(),
                Vec::new(),
            ));
            self.piggyback(&mut req).await;
            if let Err(err) = self.send(&relay.address, &req).await {
                debug!(node = %self.local_id, relay = %relay.id, error = %err, "ping-req not sent");
            }
        }
        debug!(
            node = %self.local_id,
            target = %target.id,
            relays = relays.len(),
            "indirect probe"
        );
        matches!(time::timeout_at(deadline, waiter).await, Ok(Ok(_)))
    }

    /// Drop tombstones older than the retention as of `now`
    async fn reap_tombstones(&self, now: DateTime<Utc>) {
        let retention = self.config.failure_detector.tombstone_retention();
        let reaped = self.membership.reap(now, retention).await;
        if reaped.is_empty() {
            return;
        }
        let mut queue = self.broadcasts.lock().await;
        for id in reaped {
            queue.invalidate(&id);
            debug!(node = %self.local_id, peer = %id, "reaped tombstone");
            let _ = self.events.send(DetectorEvent::Reaped(id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportResult;
    use async_trait::async_trait;
    use hive_core::{GossipConfig, NodeConfig};

    /// In-process datagram hub without fault injection
    #[derive(Clone, Default)]
    struct Hub {
        inboxes: Arc<Mutex<HashMap<String, mpsc::Sender<NetworkMessage>>>>,
    }

    struct HubTransport {
        addr: String,
        hub: Hub,
        tx: mpsc::Sender<NetworkMessage>,
        rx: Mutex<Option<mpsc::Receiver<NetworkMessage>>>,
        running: AtomicBool,
        refuse_start: AtomicBool,
    }

    impl Hub {
        fn transport(&self, addr: &str) -> Arc<HubTransport> {
            let (tx, rx) = mpsc::channel(64);
            Arc::new(HubTransport {
                addr: addr.to_string(),
                hub: self.clone(),
                tx,
                rx: Mutex::new(Some(rx)),
                running: AtomicBool::new(false),
                refuse_start: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl Transport for HubTransport {
        async fn start(&self, _token: CancellationToken) -> TransportResult<()> {
            if self.refuse_start.load(Ordering::SeqCst) {
                return Err(TransportError::Closed);
            }
            self.running.store(true, Ordering::SeqCst);
            self.hub
                .inboxes
                .lock()
                .unwrap()
                .insert(self.addr.clone(), self.tx.clone());
            Ok(())
        }

        async fn stop(&self) -> TransportResult<()> {
            self.running.store(false, Ordering::SeqCst);
            self.hub.inboxes.lock().unwrap().remove(&self.addr);
            Ok(())
        }

        async fn send_to(&self, addr: &str, payload: Bytes) -> TransportResult<()> {
            if !self.running.load(Ordering::SeqCst) {
                return Err(TransportError::NotRunning);
            }
            let inbox = self.hub.inboxes.lock().unwrap().get(addr).cloned();
            if let Some(inbox) = inbox {
                let _ = inbox.try_send(NetworkMessage::new(payload, self.addr.clone()));
            }
            Ok(())
        }

        fn messages(&self) -> Option<mpsc::Receiver<NetworkMessage>> {
            self.rx.lock().unwrap().take()
        }

        fn local_addr(&self) -> String {
            self.addr.clone()
        }
    }

    fn detector(hub: &Hub, id: &str) -> Detector {
        let config = Config::new(NodeConfig::new(id, "127.0.0.1", 7946));
        Detector::with_membership(config, hub.transport(id), Membership::with_seed(3))
    }

    async fn started(hub: &Hub, id: &str) -> Detector {
        let d = detector(hub, id);
        d.start().await.unwrap();
        d
    }

    async fn raw_endpoint(hub: &Hub, addr: &str) -> (Arc<HubTransport>, mpsc::Receiver<NetworkMessage>) {
        let transport = hub.transport(addr);
        transport.start(CancellationToken::new()).await.unwrap();
        let inbox = transport.messages().unwrap();
        (transport, inbox)
    }

    async fn send_raw(from: &HubTransport, to: &str, message: &Message) {
        let bytes = Codec::new().encode(message).unwrap();
        from.send_to(to, Bytes::from(bytes)).await.unwrap();
    }

    fn drain_inbox(inbox: &mut mpsc::Receiver<NetworkMessage>) -> Vec<NetworkMessage> {
        let mut datagrams = Vec::new();
        while let Ok(datagram) = inbox.try_recv() {
            datagrams.push(datagram);
        }
        datagrams
    }

    fn peer(id: &str, state: NodeState, incarnation: u64) -> GossipEntry {
        GossipEntry::new(NodeId::from(id), format!("{id}:7946"), state, incarnation)
    }

    fn drain(rx: &mut broadcast::Receiver<DetectorEvent>) -> Vec<DetectorEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_event_from_transition() {
        let id = NodeId::from("b");
        let t = |previous, current| Transition {
            previous,
            current,
            incarnation: 2,
        };
        assert_eq!(
            DetectorEvent::from_transition(&id, &t(None, NodeState::Alive)),
            vec![DetectorEvent::Joined(id.clone())]
        );
        assert_eq!(
            DetectorEvent::from_transition(&id, &t(None, NodeState::Suspect)),
            vec![
                DetectorEvent::Joined(id.clone()),
                DetectorEvent::Suspected {
                    id: id.clone(),
                    incarnation: 2
                },
            ]
        );
        assert_eq!(
            DetectorEvent::from_transition(&id, &t(Some(NodeState::Suspect), NodeState::Alive)),
            vec![DetectorEvent::Alive {
                id: id.clone(),
                incarnation: 2
            }]
        );
        assert!(
            DetectorEvent::from_transition(&id, &t(Some(NodeState::Alive), NodeState::Alive))
                .is_empty()
        );
        assert_eq!(
            DetectorEvent::from_transition(&id, &t(None, NodeState::Dead)),
            vec![DetectorEvent::Dead(id.clone())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_start_can_be_retried() {
        let hub = Hub::default();
        let transport = hub.transport("a");
        transport.refuse_start.store(true, Ordering::SeqCst);
        let config = Config::new(NodeConfig::new("a", "127.0.0.1", 7946));
        let d = Detector::with_membership(config, transport.clone(), Membership::with_seed(3));

        assert_eq!(
            d.start().await,
            Err(DetectorError::Transport(TransportError::Closed))
        );
        assert!(!d.is_running());

        transport.refuse_start.store(false, Ordering::SeqCst);
        d.start().await.unwrap();
        assert!(d.is_running());
        assert_eq!(d.start().await, Err(DetectorError::AlreadyStarted));
        d.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_first_heard_as_suspect() {
        let hub = Hub::default();
        let a = started(&hub, "a").await;
        let (x, _inbox) = raw_endpoint(&hub, "x").await;
        let mut events = a.subscribe();

        let claim = peer("c", NodeState::Suspect, 4);
        let ping = Message::Ping(Ping::new(1, NodeId::from("x"), NodeId::from("a"), vec![claim]));
        send_raw(&x, "a", &ping).await;
        time::sleep(Duration::from_millis(10)).await;

        let events = drain(&mut events);
        assert!(events.contains(&DetectorEvent::Joined(NodeId::from("c"))));
        assert!(events.contains(&DetectorEvent::Suspected {
            id: NodeId::from("c"),
            incarnation: 4
        }));
        a.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reap_forgets_tombstones_after_retention() {
        let hub = Hub::default();
        let a = started(&hub, "a").await;
        let (x, _inbox) = raw_endpoint(&hub, "x").await;
        let retention = a.config().failure_detector.tombstone_retention();
        let before = Utc::now();

        let dead = peer("d", NodeState::Dead, 2);
        let ping = Message::Ping(Ping::new(1, NodeId::from("x"), NodeId::from("a"), vec![dead]));
        send_raw(&x, "a", &ping).await;
        time::sleep(Duration::from_millis(10)).await;
        let mut events = a.subscribe();
        let d = NodeId::from("d");
        assert!(a.membership().get_node(&d).await.is_some());

        let early = before + chrono::Duration::from_std(retention).unwrap() - chrono::Duration::seconds(1);
        a.inner.reap_tombstones(early).await;
        assert!(a.membership().get_node(&d).await.is_some());
        assert!(drain(&mut events).is_empty());

        let late = Utc::now() + chrono::Duration::from_std(retention).unwrap() + chrono::Duration::seconds(1);
        a.inner.reap_tombstones(late).await;
        assert!(a.membership().get_node(&d).await.is_none());
        assert_eq!(drain(&mut events), vec![DetectorEvent::Reaped(d.clone())]);
        let pending = a.inner.broadcasts.lock().await.select(usize::MAX, usize::MAX);
        assert!(pending.iter().all(|e| e.node_id != d));

        // The local node is never a tombstone, so it survives any reap.
        assert!(a.membership().get_node(a.local_id()).await.is_some());
        a.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_outgoing_messages_fit_packet_budget() {
        let hub = Hub::default();
        let gossip = GossipConfig::default().with_max_packet_size(256);
        let config = Config::new(NodeConfig::new("a", "127.0.0.1", 7946)).with_gossip(gossip);
        let limit = config.gossip.max_packet_size;
        let max_entries = config.gossip.max_gossip_entries;
        let a = Detector::with_membership(config, hub.transport("a"), Membership::with_seed(3));
        a.start().await.unwrap();
        let (x, mut inbox) = raw_endpoint(&hub, "x").await;

        // Fifty fresh peers all land in the broadcast queue; x is one of them
        // so it receives probes and relay requests as well as acks.
        let mut crowd: Vec<GossipEntry> = (0..50).map(|i| peer(&format!("p{i}"), NodeState::Alive, 1)).collect();
        crowd.push(GossipEntry::new(NodeId::from("x"), "x", NodeState::Alive, 0));
        let ping = Message::Ping(Ping::new(1, NodeId::from("x"), NodeId::from("a"), crowd));
        send_raw(&x, "a", &ping).await;
        time::sleep(Duration::from_secs(20)).await;

        let received = drain_inbox(&mut inbox);
        assert!(!received.is_empty());
        let codec = Codec::new();
        let mut carried = 0;
        for datagram in &received {
            assert!(datagram.payload.len() <= limit, "{} bytes", datagram.payload.len());
            let message = codec.decode(&datagram.payload).unwrap();
            let gossip = message.gossip();
            assert!(gossip.len() <= max_entries);
            let mut ids: Vec<&NodeId> = gossip.iter().map(|e| &e.node_id).collect();
            ids.sort();
            ids.dedup();
            assert_eq!(ids.len(), gossip.len());
            carried += gossip.len();
        }
        assert!(carried > 0);
        a.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_self_updates_disseminate_latest() {
        let hub = Hub::default();
        let a = started(&hub, "a").await;
        let (x, _inbox) = raw_endpoint(&hub, "x").await;
        let x = Arc::new(x);

        let mut handles = Vec::new();
        for i in 0..8i32 {
            let a = a.clone();
            handles.push(tokio::spawn(async move {
                a.update_metadata(NodeMetadata::default().with_priority(i)).await;
            }));
            let x = x.clone();
            handles.push(tokio::spawn(async move {
                let claim = peer("a", NodeState::Suspect, u64::try_from(i).unwrap());
                let ping = Message::Ping(Ping::new(0, NodeId::from("x"), NodeId::from("a"), vec![claim]));
                send_raw(&x, "a", &ping).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        time::sleep(Duration::from_millis(200)).await;

        let me = a.membership().get_node(a.local_id()).await.unwrap();
        let pending = a.inner.broadcasts.lock().await.select(usize::MAX, usize::MAX);
        let queued = pending.iter().find(|e| &e.node_id == a.local_id()).unwrap();
        assert_eq!((queued.state, queued.incarnation), (me.state, me.incarnation));
        assert_eq!(queued.metadata.as_ref(), Some(&me.metadata));
        a.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_fails() {
        let hub = Hub::default();
        let d = started(&hub, "a").await;
        assert_eq!(d.start().await, Err(DetectorError::AlreadyStarted));
        assert!(d.is_running());
        let me = d.membership().get_node(d.local_id()).await.unwrap();
        assert_eq!(me.state, NodeState::Alive);
        assert_eq!(me.incarnation, 0);
        d.shutdown().await.unwrap();
        assert!(!d.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_before_start_fails() {
        let hub = Hub::default();
        let d = detector(&hub, "a");
        let err = d.join(&["b".to_string()]).await.unwrap_err();
        assert_eq!(err, DetectorError::Transport(TransportError::NotRunning));
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_exchanges_state() {
        let hub = Hub::default();
        let a = started(&hub, "a").await;
        let b = started(&hub, "b").await;
        let mut events = a.subscribe();

        assert_eq!(a.join(&["a".to_string(), "b".to_string()]).await.unwrap(), 1);
        time::sleep(Duration::from_millis(10)).await;

        assert!(a.membership().get_node(&NodeId::from("b")).await.is_some());
        assert!(b.membership().get_node(&NodeId::from("a")).await.is_some());
        assert!(drain(&mut events).contains(&DetectorEvent::Joined(NodeId::from("b"))));

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_peers_stay_alive() {
        let hub = Hub::default();
        let a = started(&hub, "a").await;
        let b = started(&hub, "b").await;
        a.join(&["b".to_string()]).await.unwrap();
        let mut events = a.subscribe();

        time::sleep(Duration::from_secs(10)).await;

        let b_view = a.membership().get_node(&NodeId::from("b")).await.unwrap();
        assert_eq!(b_view.state, NodeState::Alive);
        let a_view = b.membership().get_node(&NodeId::from("a")).await.unwrap();
        assert_eq!(a_view.state, NodeState::Alive);
        assert!(!drain(&mut events)
            .iter()
            .any(|e| matches!(e, DetectorEvent::Suspected { .. })));

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_peer_suspected_then_dead() {
        let hub = Hub::default();
        let a = started(&hub, "a").await;
        let mut events = a.subscribe();
        a.membership()
            .merge(&GossipEntry::new(NodeId::from("b"), "b", NodeState::Alive, 3))
            .await;

        // One round to suspect, then the suspicion timeout.
        time::sleep(Duration::from_millis(1500)).await;
        let b = a.membership().get_node(&NodeId::from("b")).await.unwrap();
        assert_eq!(b.state, NodeState::Suspect);
        assert_eq!(b.incarnation, 3);

        time::sleep(Duration::from_secs(3)).await;
        let b = a.membership().get_node(&NodeId::from("b")).await.unwrap();
        assert_eq!(b.state, NodeState::Dead);

        let events = drain(&mut events);
        assert_eq!(
            events,
            vec![
                DetectorEvent::Suspected {
                    id: NodeId::from("b"),
                    incarnation: 3
                },
                DetectorEvent::Dead(NodeId::from("b")),
            ]
        );
        a.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_refutation_before_timeout_keeps_peer() {
        let hub = Hub::default();
        let a = started(&hub, "a").await;
        let (x, _inbox) = raw_endpoint(&hub, "x").await;
        a.membership()
            .merge(&GossipEntry::new(NodeId::from("b"), "b", NodeState::Alive, 1))
            .await;

        time::sleep(Duration::from_millis(1500)).await;
        assert!(a
            .membership()
            .get_node(&NodeId::from("b"))
            .await
            .unwrap()
            .is_suspect());

        let refute = GossipEntry::new(NodeId::from("b"), "b", NodeState::Alive, 2);
        let ping = Message::Ping(Ping::new(0, NodeId::from("x"), NodeId::from("a"), vec![refute]));
        send_raw(&x, "a", &ping).await;
        time::sleep(Duration::from_millis(10)).await;

        let b = a.membership().get_node(&NodeId::from("b")).await.unwrap();
        assert_eq!((b.state, b.incarnation), (NodeState::Alive, 2));

        // The old suspicion timer fires but targets a stale incarnation.
        time::sleep(Duration::from_millis(2100)).await;
        let b = a.membership().get_node(&NodeId::from("b")).await.unwrap();
        assert_ne!(b.state, NodeState::Dead);
        assert_eq!(b.incarnation, 2);
        a.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_self_refutation_in_ack() {
        let hub = Hub::default();
        let a = started(&hub, "a").await;
        let (x, mut inbox) = raw_endpoint(&hub, "x").await;

        let claim = GossipEntry::new(NodeId::from("a"), "a", NodeState::Suspect, 0);
        let ping = Message::Ping(Ping::new(77, NodeId::from("x"), NodeId::from("a"), vec![claim]));
        send_raw(&x, "a", &ping).await;

        let reply = time::timeout(Duration::from_secs(1), inbox.recv())
            .await
            .unwrap()
            .unwrap();
        let Message::Ack(ack) = Codec::new().decode(&reply.payload).unwrap() else {
            panic!("expected ack");
        };
        assert_eq!(ack.header.seq_no, 77);
        assert_eq!(ack.header.source_id, NodeId::from("a"));
        let first = &ack.gossip[0];
        assert_eq!(first.node_id, NodeId::from("a"));
        assert_eq!(first.state, NodeState::Alive);
        assert_eq!(first.incarnation, 1);
        assert_eq!(a.incarnation().await, 1);
        a.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_datagrams_are_dropped() {
        let hub = Hub::default();
        let a = started(&hub, "a").await;
        let (x, mut inbox) = raw_endpoint(&hub, "x").await;

        x.send_to("a", Bytes::from_static(b"garbage")).await.unwrap();
        x.send_to("a", Bytes::new()).await.unwrap();
        let elsewhere = Message::Ping(Ping::new(1, NodeId::from("x"), NodeId::from("zzz"), Vec::new()));
        send_raw(&x, "a", &elsewhere).await;
        assert!(time::timeout(Duration::from_millis(500), inbox.recv()).await.is_err());

        let ping = Message::Ping(Ping::new(2, NodeId::from("x"), NodeId::from("a"), Vec::new()));
        send_raw(&x, "a", &ping).await;
        let reply = time::timeout(Duration::from_secs(1), inbox.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            Codec::new().decode(&reply.payload).unwrap().header().seq_no,
            2
        );
        a.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_forwards_ack_with_original_seq() {
        let hub = Hub::default();
        let relay = started(&hub, "r").await;
        let _target = started(&hub, "t").await;
        let (x, mut inbox) = raw_endpoint(&hub, "x").await;

        let req = Message::PingReq(PingReq::new(500, NodeId::from("x"), NodeId::from("t"), "t", Vec::new()));
        send_raw(&x, "r", &req).await;

        let reply = time::timeout(Duration::from_secs(1), inbox.recv())
            .await
            .unwrap()
            .unwrap();
        let Message::Ack(ack) = Codec::new().decode(&reply.payload).unwrap() else {
            panic!("expected forwarded ack");
        };
        assert_eq!(ack.header.seq_no, 500);
        assert_eq!(ack.header.source_id, NodeId::from("t"));
        assert_eq!(ack.gossip[0].node_id, NodeId::from("t"));
        relay.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_sends_nack_when_target_silent() {
        let hub = Hub::default();
        let relay = started(&hub, "r").await;
        let (x, mut inbox) = raw_endpoint(&hub, "x").await;

        let req = Message::PingReq(PingReq::new(9, NodeId::from("x"), NodeId::from("t"), "t", Vec::new()));
        send_raw(&x, "r", &req).await;

        let reply = time::timeout(Duration::from_secs(1), inbox.recv())
            .await
            .unwrap()
            .unwrap();
        let message = Codec::new().decode(&reply.payload).unwrap();
        assert!(matches!(message, Message::Nack(ref n) if n.header.seq_no == 9));
        relay.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_is_announced() {
        let hub = Hub::default();
        let a = started(&hub, "a").await;
        let b = started(&hub, "b").await;
        a.join(&["b".to_string()]).await.unwrap();
        time::sleep(Duration::from_millis(10)).await;
        let mut events = b.subscribe();

        a.leave().await.unwrap();
        time::sleep(Duration::from_millis(10)).await;

        let a_view = b.membership().get_node(&NodeId::from("a")).await.unwrap();
        assert_eq!(a_view.state, NodeState::Left);
        assert_eq!(a_view.incarnation, 1);
        assert!(drain(&mut events).contains(&DetectorEvent::Left(NodeId::from("a"))));

        // Left is final: never refuted, never re-announced.
        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(a.incarnation().await, 1);
        assert_eq!(a.update_metadata(NodeMetadata::default()).await, None);
        a.leave().await.unwrap();
        assert_eq!(a.incarnation().await, 1);
        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_metadata_update_spreads() {
        let hub = Hub::default();
        let a = started(&hub, "a").await;
        let b = started(&hub, "b").await;
        a.join(&["b".to_string()]).await.unwrap();
        time::sleep(Duration::from_millis(10)).await;

        let inc = a
            .update_metadata(NodeMetadata::default().with_label("role", "worker"))
            .await;
        assert_eq!(inc, Some(1));
        time::sleep(Duration::from_secs(3)).await;

        let a_view = b.membership().get_node(&NodeId::from("a")).await.unwrap();
        assert_eq!(a_view.incarnation, 1);
        assert_eq!(a_view.metadata.labels.get("role").map(String::as_str), Some("worker"));
        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }
}
