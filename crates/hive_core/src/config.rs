//! Configuration surface consumed read-only by the detector.
//!
//! Values are fixed for a run. Loading (file, environment) always ends
//! with [`Config::validate`].

use crate::error::{ConfigError, ConfigResult};
use crate::id::NodeId;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Prefix of environment overrides
pub const ENV_PREFIX: &str = "HIVE_";

/// Root configuration
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Local node identity
    pub node: NodeConfig,
    /// Dissemination tuning
    pub gossip: GossipConfig,
    /// Failure detector tuning
    pub failure_detector: FailureDetectorConfig,
}

impl Config {
    /// Create a config for a node with default tuning
    #[must_use]
    pub fn new(node: NodeConfig) -> Self {
        Self {
            node,
            ..Self::default()
        }
    }

    /// Set gossip tuning
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

    /// Parse and validate a JSON document
    ///
    /// # Errors
    ///
    /// Returns error if the document is malformed or fails validation
    pub fn from_json_str(json: &str) -> ConfigResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read, parsed, or validated
    pub fn from_json_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Apply `HIVE_*` overrides from the given variables, then validate.
    ///
    /// Unknown `HIVE_*` keys are ignored.
    ///
    /// # Errors
    ///
    /// Returns error if a value cannot be parsed or the result is invalid
    pub fn apply_env<I, K, V>(&mut self, vars: I) -> ConfigResult<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let Some(name) = key.as_ref().strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let value = value.as_ref();
            match name {
                "NODE_ID" => self.node.id = NodeId::new(value),
                "BIND_ADDR" => self.node.bind_addr = value.to_string(),
                "BIND_PORT" => self.node.bind_port = parse_env(key.as_ref(), value)?,
                "PROBE_INTERVAL_MS" => {
                    self.failure_detector.probe_interval_ms = parse_env(key.as_ref(), value)?;
                }
                "PROBE_TIMEOUT_MS" => {
                    self.failure_detector.probe_timeout_ms = parse_env(key.as_ref(), value)?;
                }
                "INDIRECT_NODES" => {
                    self.failure_detector.indirect_nodes = parse_env(key.as_ref(), value)?;
                }
                "SUSPICION_MULT" => {
                    self.failure_detector.suspicion_mult = parse_env(key.as_ref(), value)?;
                }
                "MAX_BROADCAST" => self.gossip.max_broadcast = parse_env(key.as_ref(), value)?,
                "MAX_GOSSIP_ENTRIES" => {
                    self.gossip.max_gossip_entries = parse_env(key.as_ref(), value)?;
                }
                "MAX_PACKET_SIZE" => self.gossip.max_packet_size = parse_env(key.as_ref(), value)?,
                "PUSH_PULL_INTERVAL_MS" => {
                    self.gossip.push_pull_interval_ms = parse_env(key.as_ref(), value)?;
                }
                _ => {}
            }
        }
        self.validate()
    }

    /// Apply overrides from the process environment
    ///
    /// # Errors
    ///
    /// Returns error if a value cannot be parsed or the result is invalid
    pub fn apply_process_env(&mut self) -> ConfigResult<()> {
        self.apply_env(std::env::vars())
    }

    /// Validate all sections
    ///
    /// # Errors
    ///
    /// Returns the first validation failure
    pub fn validate(&self) -> ConfigResult<()> {
        self.node.validate()?;
        self.gossip.validate()?;
        self.failure_detector.validate()
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> ConfigResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::validation(key, format!("cannot parse {value:?}")))
}

/// Identity of the local node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node ID
    pub id: NodeId,
    /// Bind host
    pub bind_addr: String,
    /// Bind port
    pub bind_port: u16,
}

impl NodeConfig {
    /// Create a node config
    #[must_use]
    pub fn new(id: impl Into<NodeId>, bind_addr: impl Into<String>, bind_port: u16) -> Self {
        Self {
            id: id.into(),
            bind_addr: bind_addr.into(),
            bind_port,
        }
    }

    /// Address other nodes use to reach this one
    #[must_use]
    pub fn advertise_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.bind_port)
    }

    /// Validate identity fields
    ///
    /// # Errors
    ///
    /// Returns error on an empty id or an unusable bind address
    pub fn validate(&self) -> ConfigResult<()> {
        if self.id.is_empty() {
            return Err(ConfigError::validation("node.id", "must not be empty"));
        }
        if self.bind_addr.is_empty() {
            return Err(ConfigError::validation("node.bind_addr", "must not be empty"));
        }
        if self.bind_addr.chars().any(char::is_whitespace) {
            return Err(ConfigError::validation(
                "node.bind_addr",
                "must not contain whitespace",
            ));
        }
        Ok(())
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::new(NodeId::random(), "127.0.0.1", 7946)
    }
}

/// Dissemination tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    /// Transmissions after which an update stops being piggybacked
    pub max_broadcast: u32,
    /// Upper bound of gossip entries per message
    pub max_gossip_entries: usize,
    /// Upper bound of an encoded message in bytes
    pub max_packet_size: usize,
    /// Interval of full-state exchange with one random known node, 0 disables
    pub push_pull_interval_ms: u64,
}

impl GossipConfig {
    /// Smallest packet budget that still fits a header and one entry
    pub const MIN_PACKET_SIZE: usize = 256;

    /// Set max broadcast
    #[must_use]
    pub fn with_max_broadcast(mut self, max: u32) -> Self {
        self.max_broadcast = max;
        self
    }

    /// Set max gossip entries
    #[must_use]
    pub fn with_max_gossip_entries(mut self, max: usize) -> Self {
        self.max_gossip_entries = max;
        self
    }

    /// Set max packet size
    #[must_use]
    pub fn with_max_packet_size(mut self, max: usize) -> Self {
        self.max_packet_size = max;
        self
    }

    /// Set push/pull interval, 0 disables it
    #[must_use]
    pub fn with_push_pull_interval(mut self, interval_ms: u64) -> Self {
        self.push_pull_interval_ms = interval_ms;
        self
    }

    /// Interval of full-state exchange, `None` when disabled
    #[must_use]
    pub fn push_pull_interval(&self) -> Option<Duration> {
        (self.push_pull_interval_ms > 0).then(|| Duration::from_millis(self.push_pull_interval_ms))
    }

    /// Validate dissemination bounds
    ///
    /// # Errors
    ///
    /// Returns error if a bound would stop dissemination entirely
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_broadcast == 0 {
            return Err(ConfigError::validation("gossip.max_broadcast", "must be at least 1"));
        }
        if self.max_gossip_entries == 0 {
            return Err(ConfigError::validation(
                "gossip.max_gossip_entries",
                "must be at least 1",
            ));
        }
        if self.max_packet_size < Self::MIN_PACKET_SIZE {
            return Err(ConfigError::validation(
                "gossip.max_packet_size",
                format!("must be at least {}", Self::MIN_PACKET_SIZE),
            ));
        }
        Ok(())
    }
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            max_broadcast: 6,
            max_gossip_entries: 8,
            max_packet_size: 1400,
            push_pull_interval_ms: 30_000,
        }
    }
}

/// Failure detector tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailureDetectorConfig {
    /// Interval between probe rounds in milliseconds
    pub probe_interval_ms: u64,
    /// Direct probe timeout in milliseconds
    pub probe_timeout_ms: u64,
    /// Relays asked to probe indirectly
    pub indirect_nodes: usize,
    /// Suspicion timeout as a multiple of the probe timeout
    pub suspicion_mult: u32,
    /// Tombstone retention as a multiple of the suspicion timeout
    pub tombstone_periods: u32,
}

impl FailureDetectorConfig {
    /// Set probe interval
    #[must_use]
    pub fn with_probe_interval(mut self, interval_ms: u64) -> Self {
        self.probe_interval_ms = interval_ms;
        self
    }

    /// Set probe timeout
    #[must_use]
    pub fn with_probe_timeout(mut self, timeout_ms: u64) -> Self {
        self.probe_timeout_ms = timeout_ms;
        self
    }

    /// Set indirect probe fanout
    #[must_use]
    pub fn with_indirect_nodes(mut self, count: usize) -> Self {
        self.indirect_nodes = count;
        self
    }

    /// Set suspicion multiplier
    #[must_use]
    pub fn with_suspicion_mult(mut self, mult: u32) -> Self {
        self.suspicion_mult = mult;
        self
    }

    /// Set tombstone retention periods
    #[must_use]
    pub fn with_tombstone_periods(mut self, periods: u32) -> Self {
        self.tombstone_periods = periods;
        self
    }

    /// Interval between probe rounds
    #[must_use]
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    /// Direct probe timeout
    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// How long a node stays suspect before it is declared dead
    #[must_use]
    pub fn suspicion_timeout(&self) -> Duration {
        self.probe_timeout() * self.suspicion_mult
    }

    /// How long dead and left nodes are kept before reaping
    #[must_use]
    pub fn tombstone_retention(&self) -> Duration {
        self.suspicion_timeout() * self.tombstone_periods
    }

    /// Validate timing
    ///
    /// # Errors
    ///
    /// Returns error if the probe round cannot fit its phases
    pub fn validate(&self) -> ConfigResult<()> {
        if self.probe_interval_ms == 0 {
            return Err(ConfigError::validation(
                "failure_detector.probe_interval_ms",
                "must be positive",
            ));
        }
        if self.probe_timeout_ms == 0 {
            return Err(ConfigError::validation(
                "failure_detector.probe_timeout_ms",
                "must be positive",
            ));
        }
        if self.probe_timeout_ms >= self.probe_interval_ms {
            return Err(ConfigError::validation(
                "failure_detector.probe_timeout_ms",
                "must be shorter than the probe interval",
            ));
        }
        if self.suspicion_mult == 0 {
            return Err(ConfigError::validation(
                "failure_detector.suspicion_mult",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

impl Default for FailureDetectorConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: 1000,
            probe_timeout_ms: 500,
            indirect_nodes: 3,
            suspicion_mult: 4,
            tombstone_periods: 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.failure_detector.probe_interval(), Duration::from_secs(1));
        assert_eq!(config.failure_detector.suspicion_timeout(), Duration::from_secs(2));
        assert_eq!(config.failure_detector.tombstone_retention(), Duration::from_secs(8));
        assert_eq!(config.gossip.push_pull_interval(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_advertise_addr() {
        let node = NodeConfig::new("a", "10.0.0.1", 7000);
        assert_eq!(node.advertise_addr(), "10.0.0.1:7000");
    }

    #[test]
    fn test_validate_empty_id() {
        let config = Config::new(NodeConfig::new("", "127.0.0.1", 1));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("node.id"));
    }

    #[test]
    fn test_validate_bind_addr() {
        let config = Config::new(NodeConfig::new("a", "bad addr", 1));
        assert!(config.validate().is_err());
        let config = Config::new(NodeConfig::new("a", "", 1));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_timeout_must_fit_interval() {
        let fd = FailureDetectorConfig::default()
            .with_probe_interval(100)
            .with_probe_timeout(100);
        let err = Config::default().with_failure_detector(fd).validate().unwrap_err();
        assert!(err.to_string().contains("probe_timeout_ms"));
    }

    #[test]
    fn test_validate_gossip_bounds() {
        let gossip = GossipConfig::default().with_max_packet_size(64);
        assert!(Config::default().with_gossip(gossip).validate().is_err());

        let gossip = GossipConfig::default().with_max_gossip_entries(0);
        assert!(Config::default().with_gossip(gossip).validate().is_err());
    }

    #[test]
    fn test_from_json_partial_document() {
        let json = r#"{
            "node": { "id": "node1", "bind_addr": "10.1.1.1", "bind_port": 9000 },
            "failure_detector": { "probe_interval_ms": 200, "probe_timeout_ms": 50 }
        }"#;
        let config = Config::from_json_str(json).unwrap();
        assert_eq!(config.node.id, NodeId::from("node1"));
        assert_eq!(config.failure_detector.probe_timeout_ms, 50);
        assert_eq!(config.failure_detector.indirect_nodes, 3);
        assert_eq!(config.gossip, GossipConfig::default());
    }

    #[test]
    fn test_from_json_rejects_invalid() {
        let json = r#"{ "failure_detector": { "probe_interval_ms": 0 } }"#;
        assert!(matches!(
            Config::from_json_str(json),
            Err(ConfigError::Validation { .. })
        ));
        assert!(matches!(Config::from_json_str("{"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_from_json_file_missing() {
        let err = Config::from_json_file("/nonexistent/hive.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn test_apply_env_overrides() {
        let mut config = Config::default();
        config
            .apply_env([
                ("HIVE_NODE_ID", "env-node"),
                ("HIVE_BIND_PORT", "8001"),
                ("HIVE_PROBE_INTERVAL_MS", "2000"),
                ("HIVE_MAX_BROADCAST", "3"),
                ("HIVE_PUSH_PULL_INTERVAL_MS", "0"),
                ("PATH", "/usr/bin"),
                ("HIVE_UNKNOWN", "ignored"),
            ])
            .unwrap();
        assert_eq!(config.node.id.as_str(), "env-node");
        assert_eq!(config.node.bind_port, 8001);
        assert_eq!(config.failure_detector.probe_interval_ms, 2000);
        assert_eq!(config.gossip.max_broadcast, 3);
        assert_eq!(config.gossip.push_pull_interval(), None);
    }

    #[test]
    fn test_apply_env_bad_number() {
        let mut config = Config::default();
        let err = config.apply_env([("HIVE_BIND_PORT", "seventy")]).unwrap_err();
        assert!(err.to_string().contains("HIVE_BIND_PORT"));
    }

    #[test]
    fn test_json_roundtrip() {
        let config = Config::new(NodeConfig::new("n", "h", 1));
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(Config::from_json_str(&json).unwrap(), config);
    }
}
