//! Multi-node simulation harness.
//!
//! Builds a cluster of failure detectors on one [`SimNetwork`], joins them
//! through the first node and exposes fault injection plus convergence
//! queries. Node `i` has ID `node-{i}` and address `node-{i}:7946`.

use crate::network::{SimNetwork, SimTransport};
use crate::seed::SimSeed;
use futures::future::join_all;
use hive_cluster::{Detector, DetectorResult, Membership};
use hive_core::{Config, FailureDetectorConfig, GossipConfig, NodeConfig, NodeId, NodeState};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, Instant};
use tracing::info;

const SIM_PORT: u16 = 7946;

/// Simulation configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimConfig {
    /// Seed for reproducibility
    pub seed: SimSeed,
    /// Number of nodes
    pub nodes: usize,
    /// Dissemination tuning shared by all nodes
    pub gossip: GossipConfig,
    /// Failure detector tuning shared by all nodes
    pub failure_detector: FailureDetectorConfig,
}

impl SimConfig {
    /// Create a configuration for `nodes` nodes with default tuning
    #[must_use]
    pub fn new(seed: SimSeed, nodes: usize) -> Self {
        Self {
            seed,
            nodes,
            gossip: GossipConfig::default(),
            failure_detector: FailureDetectorConfig::default(),
        }
    }

    /// Set dissemination tuning
    #[must_use]
    pub fn with_gossip(mut self, gossip: GossipConfig) -> Self {
        self.gossip = gossip;
        self
    }

    /// Set failure detector tuning
    #[must_use]
    pub fn with_failure_detector(mut self, failure_detector: FailureDetectorConfig) -> Self {
        self.failure_detector = failure_detector;
        self
    }

    fn node_config(&self, index: usize) -> Config {
        Config::new(NodeConfig::new(node_id(index), node_host(index), SIM_PORT))
            .with_gossip(self.gossip.clone())
            .with_failure_detector(self.failure_detector.clone())
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        Self::new(SimSeed::default(), 3)
    }
}

/// ID of the node at `index`
#[must_use]
pub fn node_id(index: usize) -> NodeId {
    NodeId::new(node_host(index))
}

fn node_host(index: usize) -> String {
    format!("node-{index}")
}

/// One simulated cluster member
pub struct SimNode {
    /// Failure detector
    pub detector: Detector,
    /// Its transport, for fault injection
    pub transport: SimTransport,
    crashed: bool,
}

impl SimNode {
    /// Whether the node was crashed
    #[must_use]
    pub fn is_crashed(&self) -> bool {
        self.crashed
    }
}

/// Running simulated cluster
pub struct SimCluster {
    config: SimConfig,
    network: SimNetwork,
    nodes: Vec<SimNode>,
}

impl SimCluster {
    /// Start every node and join all of them through node 0
    ///
    /// # Errors
    ///
    /// Returns error if a detector fails to start or join
    pub async fn start(config: SimConfig) -> DetectorResult<Self> {
        let network = SimNetwork::new(&config.seed);
        let mut nodes = Vec::with_capacity(config.nodes);

        for index in 0..config.nodes {
            let node_config = config.node_config(index);
            let transport = network.transport(node_config.node.advertise_addr()).await;
            let membership =
                Membership::with_seed(config.seed.derive(node_config.node.id.as_str()).seed);
            let detector =
                Detector::with_membership(node_config, Arc::new(transport.clone()), membership);
            detector.start().await?;
            nodes.push(SimNode {
                detector,
                transport,
                crashed: false,
            });
        }

        if let Some((first, rest)) = nodes.split_first() {
            let seeds = [first.detector.local_addr().to_string()];
            for node in rest {
                node.detector.join(&seeds).await?;
            }
        }
        info!(nodes = config.nodes, seed = config.seed.seed, "simulated cluster started");

        Ok(Self {
            config,
            network,
            nodes,
        })
    }

    /// Number of nodes, crashed ones included
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the cluster has no nodes
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Configuration the cluster was built from
    #[must_use]
    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Shared network
    #[must_use]
    pub fn network(&self) -> &SimNetwork {
        &self.network
    }

    /// Node at `index`
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range
    #[must_use]
    pub fn node(&self, index: usize) -> &SimNode {
        &self.nodes[index]
    }

    /// All nodes
    #[must_use]
    pub fn nodes(&self) -> &[SimNode] {
        &self.nodes
    }

    /// Address of the node at `index`
    #[must_use]
    pub fn addr(&self, index: usize) -> &str {
        self.nodes[index].detector.local_addr()
    }

    /// Stop a node without any announcement
    ///
    /// # Errors
    ///
    /// Returns error if the detector fails to stop
    pub async fn crash(&mut self, index: usize) -> DetectorResult<()> {
        let node = &mut self.nodes[index];
        node.detector.shutdown().await?;
        node.crashed = true;
        info!(node = %node.detector.local_id(), "crashed");
        Ok(())
    }

    /// Cut both directions between two nodes
    pub async fn partition(&self, a: usize, b: usize) {
        self.network.partition(self.addr(a), &[self.addr(b)]).await;
    }

    /// Cut a node off from every other node
    pub async fn isolate(&self, index: usize) {
        let others: Vec<&str> = (0..self.len())
            .filter(|i| *i != index)
            .map(|i| self.addr(i))
            .collect();
        self.network.partition(self.addr(index), &others).await;
    }

    /// Restore both directions between two nodes
    pub async fn heal(&self, a: usize, b: usize) {
        self.network.heal(self.addr(a), self.addr(b)).await;
    }

    /// Remove every partition
    pub async fn heal_all(&self) {
        self.network.heal_all().await;
    }

    /// State of `subject` in `observer`'s view
    pub async fn state_of(&self, observer: usize, subject: usize) -> Option<NodeState> {
        self.nodes[observer]
            .detector
            .membership()
            .get_node(&node_id(subject))
            .await
            .map(|n| n.state)
    }

    /// `observer`'s view as id -> (state, incarnation), sorted by id
    pub async fn view(&self, observer: usize) -> BTreeMap<NodeId, (NodeState, u64)> {
        self.nodes[observer]
            .detector
            .membership()
            .all_nodes()
            .await
            .into_iter()
            .map(|n| (n.id, (n.state, n.incarnation)))
            .collect()
    }

    /// Whether every running node other than `subject` sees it in `state`
    pub async fn all_see(&self, subject: usize, state: NodeState) -> bool {
        for (observer, node) in self.nodes.iter().enumerate() {
            if observer == subject || node.crashed {
                continue;
            }
            if self.state_of(observer, subject).await != Some(state) {
                return false;
            }
        }
        true
    }

    /// Whether every running node sees every other running node alive
    pub async fn converged(&self) -> bool {
        for (subject, node) in self.nodes.iter().enumerate() {
            if !node.crashed && !self.all_see(subject, NodeState::Alive).await {
                return false;
            }
        }
        true
    }

    /// Poll once per probe interval until `all_see(subject, state)` or `within` elapses
    pub async fn await_state(&self, subject: usize, state: NodeState, within: Duration) -> bool {
        let deadline = Instant::now() + within;
        let step = self.config.failure_detector.probe_interval();
        loop {
            if self.all_see(subject, state).await {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            time::sleep(step).await;
        }
    }

    /// Poll once per probe interval until the cluster converges or `within` elapses
    pub async fn await_converged(&self, within: Duration) -> bool {
        let deadline = Instant::now() + within;
        let step = self.config.failure_detector.probe_interval();
        loop {
            if self.converged().await {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            time::sleep(step).await;
        }
    }

    /// Shut down every running node
    ///
    /// # Errors
    ///
    /// Returns the first error any detector reported
    pub async fn shutdown(self) -> DetectorResult<()> {
        let results = join_all(
            self.nodes
                .iter()
                .filter(|n| !n.crashed)
                .map(|n| n.detector.shutdown()),
        )
        .await;
        results.into_iter().collect()
    }
}
