//! Cluster node model.

use crate::id::NodeId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Membership state of a node.
///
/// Variants are ordered by severity: `Alive < Suspect < Dead < Left`.
/// Within one incarnation a claim may only move a node towards a more
/// severe state; `Left` is terminal.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub enum NodeState {
    /// Responding to probes
    #[default]
    Alive,
    /// Missed a probe round, waiting for refutation
    Suspect,
    /// Suspicion expired without refutation
    Dead,
    /// Left the cluster voluntarily
    Left,
}

impl NodeState {
    /// Whether nodes in this state are probed and gossiped to
    #[must_use]
    pub const fn is_live(&self) -> bool {
        matches!(self, NodeState::Alive | NodeState::Suspect)
    }

    /// Whether this state only waits for reaping
    #[must_use]
    pub const fn is_tombstone(&self) -> bool {
        matches!(self, NodeState::Dead | NodeState::Left)
    }

    /// Lowercase name used in logs and CLI output
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            NodeState::Alive => "alive",
            NodeState::Suspect => "suspect",
            NodeState::Dead => "dead",
            NodeState::Left => "left",
        }
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Resources advertised by a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Resources {
    /// CPU capacity in millicores
    pub cpu_millis: i64,
    /// Memory in bytes
    pub memory_bytes: i64,
    /// Disk in bytes
    pub disk_bytes: i64,
}

/// Scheduling metadata a node attaches to its membership entry
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeMetadata {
    /// Advertised resources
    pub resources: Resources,
    /// Free-form labels for placement constraints
    pub labels: BTreeMap<String, String>,
    /// Scheduling priority
    pub priority: i32,
}

impl NodeMetadata {
    /// Set resources
    #[must_use]
    pub fn with_resources(mut self, resources: Resources) -> Self {
        self.resources = resources;
        self
    }

    /// Add a label
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Set priority
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// A member of the cluster as seen by the local node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Node ID
    pub id: NodeId,
    /// host:port used for probes
    pub address: String,
    /// Current membership state
    pub state: NodeState,
    /// Incarnation asserted by the node itself
    pub incarnation: u64,
    /// Advertised metadata
    pub metadata: NodeMetadata,
    /// Local wall-clock time of the last accepted change
    pub last_updated: DateTime<Utc>,
}

impl Node {
    /// Create a new alive node at incarnation zero
    #[must_use]
    pub fn new(id: NodeId, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
            state: NodeState::Alive,
            incarnation: 0,
            metadata: NodeMetadata::default(),
            last_updated: Utc::now(),
        }
    }

    /// Set state
    #[must_use]
    pub fn with_state(mut self, state: NodeState) -> Self {
        self.state = state;
        self
    }

    /// Set incarnation
    #[must_use]
    pub fn with_incarnation(mut self, incarnation: u64) -> Self {
        self.incarnation = incarnation;
        self
    }

    /// Set metadata
    #[must_use]
    pub fn with_metadata(mut self, metadata: NodeMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Check if node is live (alive or suspect)
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.state.is_live()
    }

    /// Check if node is suspect
    #[must_use]
    pub fn is_suspect(&self) -> bool {
        self.state == NodeState::Suspect
    }
}
