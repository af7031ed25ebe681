//! Hive deterministic simulation
//!
//! In-memory network with partitions, loss and latency, plus a harness that
//! runs whole clusters of failure detectors on it. Runs are reproducible
//! from a seed.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod harness;
pub mod network;
pub mod seed;

pub use harness::{node_id, SimCluster, SimConfig, SimNode};
pub use network::{SimNetwork, SimTransport, INBOUND_CAPACITY};
pub use seed::{SeedSource, SimSeed};
