//! Cluster membership store.
//!
//! Holds the local view of every known node. All state changes go through
//! [`Membership::merge`], which orders competing claims by incarnation and
//! then by state severity. A single reader/writer lock guards the whole
//! table so each merge is one atomic read-modify-write.

use chrono::{DateTime, Utc};
use hive_core::{Node, NodeId, NodeMetadata, NodeState};
use hive_wire::GossipEntry;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::RwLock;

/// Accepted change to a node's entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// State before the merge, `None` for a newly inserted node
    pub previous: Option<NodeState>,
    /// State after the merge
    pub current: NodeState,
    /// Incarnation after the merge
    pub incarnation: u64,
}

impl Transition {
    /// Whether the node was not known before
    #[must_use]
    pub fn is_new(&self) -> bool {
        self.previous.is_none()
    }
}

/// Cluster membership
pub struct Membership {
    /// Known nodes, self included
    nodes: RwLock<HashMap<NodeId, Node>>,
    /// Sampling source for probe targets and fanout peers
    rng: Mutex<ChaCha8Rng>,
}

impl Membership {
    /// Create an empty store with an entropy-seeded sampler
    #[must_use]
    pub fn new() -> Self {
        Self::from_rng(ChaCha8Rng::from_entropy())
    }

    /// Create an empty store whose sampling replays for a given seed
    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        Self::from_rng(ChaCha8Rng::seed_from_u64(seed))
    }

    fn from_rng(rng: ChaCha8Rng) -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            rng: Mutex::new(rng),
        }
    }

    /// Merge a claim, returning whether local state changed
    pub async fn merge(&self, entry: &GossipEntry) -> bool {
        self.merge_transition(entry).await.is_some()
    }

    /// Merge a claim, returning the accepted transition if any
    ///
    /// Rules, in order:
    /// 1. unknown node: insert
    /// 2. higher incarnation: accept state, address and metadata
    /// 3. same incarnation, more severe state: accept
    /// 4. anything else is stale and rejected
    pub async fn merge_transition(&self, entry: &GossipEntry) -> Option<Transition> {
        let mut nodes = self.nodes.write().await;
        apply(&mut nodes, entry)
    }

    /// Get a node by ID
    pub async fn get_node(&self, id: &NodeId) -> Option<Node> {
        self.nodes.read().await.get(id).cloned()
    }

    /// Get all nodes
    pub async fn all_nodes(&self) -> Vec<Node> {
        self.nodes.read().await.values().cloned().collect()
    }

    /// Get nodes currently in `state`
    pub async fn nodes_by_state(&self, state: NodeState) -> Vec<Node> {
        self.nodes
            .read()
            .await
            .values()
            .filter(|n| n.state == state)
            .cloned()
            .collect()
    }

    /// Get alive and suspect nodes
    pub async fn live_nodes(&self) -> Vec<Node> {
        self.nodes
            .read()
            .await
            .values()
            .filter(|n| n.is_live())
            .cloned()
            .collect()
    }

    /// Number of known nodes, tombstones included
    pub async fn len(&self) -> usize {
        self.nodes.read().await.len()
    }

    /// Whether no node is known
    pub async fn is_empty(&self) -> bool {
        self.nodes.read().await.is_empty()
    }

    /// Pick one random live node not in `exclude`
    pub async fn random_node(&self, exclude: &[NodeId]) -> Option<Node> {
        self.random_nodes(1, exclude).await.into_iter().next()
    }

    /// Pick up to `k` distinct random live nodes not in `exclude`
    ///
    /// Returns every eligible node when fewer than `k` exist.
    pub async fn random_nodes(&self, k: usize, exclude: &[NodeId]) -> Vec<Node> {
        if k == 0 {
            return Vec::new();
        }

        let mut eligible: Vec<Node> = self
            .nodes
            .read()
            .await
            .values()
            .filter(|n| n.is_live() && !exclude.contains(&n.id))
            .cloned()
            .collect();
        // HashMap order is per-process; sort so a seeded sampler replays.
        eligible.sort_by(|a, b| a.id.cmp(&b.id));

        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        eligible.choose_multiple(&mut *rng, k).cloned().collect()
    }

    /// Pick one random node that has not left, dead ones included
    ///
    /// Push/pull partners come from here so nodes declared dead across a
    /// healed partition still hear about it.
    pub async fn random_known(&self, exclude: &[NodeId]) -> Option<Node> {
        let mut eligible: Vec<Node> = self
            .nodes
            .read()
            .await
            .values()
            .filter(|n| n.state != NodeState::Left && !exclude.contains(&n.id))
            .cloned()
            .collect();
        eligible.sort_by(|a, b| a.id.cmp(&b.id));

        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        eligible.choose(&mut *rng).cloned()
    }

    /// Re-announce `id` at one past the larger of its incarnation and `floor`
    ///
    /// Read, increment and merge happen under one write guard. Metadata is
    /// kept unless replaced. Returns the accepted entry, or `None` once the
    /// node has left.
    pub async fn advance(
        &self,
        id: &NodeId,
        address: &str,
        state: NodeState,
        floor: u64,
        metadata: Option<NodeMetadata>,
    ) -> Option<GossipEntry> {
        let mut nodes = self.nodes.write().await;
        bump(&mut nodes, id, address, state, floor, metadata)
    }

    /// Answer a claim about `id` made by someone else
    ///
    /// A claim at a higher incarnation, or a non-alive claim at the current
    /// one, is overridden by an `Alive` entry one past the claim. Returns
    /// that entry, or `None` if the claim needs no answer or the node has
    /// left.
    pub async fn refute(&self, id: &NodeId, address: &str, claim: &GossipEntry) -> Option<GossipEntry> {
        let mut nodes = self.nodes.write().await;
        let current = nodes.get(id).map_or(0, |n| n.incarnation);
        let contested = claim.incarnation > current
            || (claim.incarnation == current && claim.state != NodeState::Alive);
        if !contested {
            return None;
        }
        bump(&mut nodes, id, address, NodeState::Alive, claim.incarnation, None)
    }

    /// Mark a known node suspect at its current incarnation
    pub async fn suspect(&self, id: &NodeId) -> bool {
        self.transition(id, NodeState::Suspect, None).await.is_some()
    }

    /// Mark a known node dead at its current incarnation
    pub async fn dead(&self, id: &NodeId) -> bool {
        self.transition(id, NodeState::Dead, None).await.is_some()
    }

    /// Mark a known node as having left at `incarnation`
    pub async fn leave(&self, id: &NodeId, incarnation: u64) -> bool {
        self.transition(id, NodeState::Left, Some(incarnation))
            .await
            .is_some()
    }

    /// Synthesize a claim about a known node and merge it
    pub async fn transition(
        &self,
        id: &NodeId,
        state: NodeState,
        incarnation: Option<u64>,
    ) -> Option<Transition> {
        let mut nodes = self.nodes.write().await;
        let node = nodes.get(id)?;
        let entry = GossipEntry::new(
            id.clone(),
            node.address.clone(),
            state,
            incarnation.unwrap_or(node.incarnation),
        );
        apply(&mut nodes, &entry)
    }

    /// Refresh the last-updated time of a node after a confirmed probe
    pub async fn touch(&self, id: &NodeId) -> bool {
        match self.nodes.write().await.get_mut(id) {
            Some(node) => {
                node.last_updated = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Delete a node locally, bypassing merge rules
    pub async fn remove(&self, id: &NodeId) -> bool {
        self.nodes.write().await.remove(id).is_some()
    }

    /// Remove dead and left nodes whose state is older than `retention`
    pub async fn reap(&self, now: DateTime<Utc>, retention: Duration) -> Vec<NodeId> {
        let mut nodes = self.nodes.write().await;
        let expired: Vec<NodeId> = nodes
            .values()
            .filter(|n| n.state.is_tombstone())
            .filter(|n| {
                (now - n.last_updated)
                    .to_std()
                    .is_ok_and(|age| age > retention)
            })
            .map(|n| n.id.clone())
            .collect();
        for id in &expired {
            nodes.remove(id);
        }
        expired
    }
}

impl Default for Membership {
    fn default() -> Self {
        Self::new()
    }
}

fn bump(
    nodes: &mut HashMap<NodeId, Node>,
    id: &NodeId,
    address: &str,
    state: NodeState,
    floor: u64,
    metadata: Option<NodeMetadata>,
) -> Option<GossipEntry> {
    let (incarnation, kept) = match nodes.get(id) {
        Some(node) if node.state == NodeState::Left => return None,
        Some(node) => (node.incarnation, node.metadata.clone()),
        None => (0, NodeMetadata::default()),
    };
    let entry = GossipEntry::new(id.clone(), address, state, incarnation.max(floor) + 1)
        .with_metadata(metadata.unwrap_or(kept));
    apply(nodes, &entry).map(|_| entry)
}

fn apply(nodes: &mut HashMap<NodeId, Node>, entry: &GossipEntry) -> Option<Transition> {
    let now = Utc::now();
    if !nodes.contains_key(&entry.node_id) {
        let mut node = Node::new(entry.node_id.clone(), entry.address.clone())
            .with_state(entry.state)
            .with_incarnation(entry.incarnation);
        if let Some(metadata) = &entry.metadata {
            node.metadata = metadata.clone();
        }
        node.last_updated = now;
        nodes.insert(entry.node_id.clone(), node);
        return Some(Transition {
            previous: None,
            current: entry.state,
            incarnation: entry.incarnation,
        });
    }

    let node = nodes.get_mut(&entry.node_id)?;
    let previous = node.state;
    if entry.incarnation > node.incarnation {
        node.incarnation = entry.incarnation;
        node.address.clone_from(&entry.address);
    } else if entry.incarnation != node.incarnation || entry.state <= node.state {
        return None;
    }

    node.state = entry.state;
    if let Some(metadata) = &entry.metadata {
        node.metadata = metadata.clone();
    }
    node.last_updated = now;
    Some(Transition {
        previous: Some(previous),
        current: node.state,
        incarnation: node.incarnation,
    })
}
