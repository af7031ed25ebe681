//! hive Core Types
//!
//! This crate contains pure types and logic with no I/O beyond
//! configuration loading. Everything here is shared by the wire codec,
//! the membership store, and the failure detector.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod id;
pub mod node;

// Re-exports
pub use config::{Config, FailureDetectorConfig, GossipConfig, NodeConfig};
pub use error::{ConfigError, ConfigResult};
pub use id::NodeId;
pub use node::{Node, NodeMetadata, NodeState, Resources};
