//! Configuration schema and loader for meshdb nodes.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// TCP port the sync server binds; also advertised in beacons.
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,

    /// Discovery settings.
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Sync orchestrator settings.
    #[serde(default)]
    pub sync: SyncConfig,

    /// Storage settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Cluster security settings.
    #[serde(default)]
    pub security: SecurityConfig,

    /// Conflict resolver: "lww" or "field-merge".
    #[serde(default = "default_resolver")]
    pub resolver: String,

    /// Optional Prometheus metrics HTTP port.
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            tcp_port: default_tcp_port(),
            discovery: DiscoveryConfig::default(),
            sync: SyncConfig::default(),
            storage: StorageConfig::default(),
            security: SecurityConfig::default(),
            resolver: default_resolver(),
            metrics_port: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// UDP port beacons are broadcast to and received on.
    #[serde(default = "default_udp_port")]
    pub udp_port: u16,

    /// Beacon emission interval in seconds.
    #[serde(default = "default_beacon_interval_secs")]
    pub beacon_interval_secs: u64,

    /// Peer directory sweep interval in seconds.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Seconds without a beacon before a peer is evicted.
    #[serde(default = "default_peer_ttl_secs")]
    pub peer_ttl_secs: u64,

    /// Substitute 127.0.0.1 for the beacon sender address.
    /// Useful for multi-node deployments on a single host.
    #[serde(default)]
    pub loopback_override: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            udp_port: default_udp_port(),
            beacon_interval_secs: default_beacon_interval_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            peer_ttl_secs: default_peer_ttl_secs(),
            loopback_override: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Anti-entropy round interval in seconds.
    #[serde(default = "default_sync_interval_secs")]
    pub interval_secs: u64,

    /// Gossip fanout: peers contacted per round.
    #[serde(default = "default_fanout")]
    pub fanout: usize,

    /// Per-request network timeout in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Whether to offer Brotli payload compression during handshakes.
    #[serde(default = "default_true")]
    pub compression: bool,

    /// Payloads at or below this size are sent uncompressed.
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sync_interval_secs(),
            fanout: default_fanout(),
            request_timeout_ms: default_request_timeout_ms(),
            compression: true,
            compression_threshold: default_compression_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for the WAL and the persisted node id.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Fsync policy: "always", "batch", "none".
    #[serde(default = "default_fsync")]
    pub fsync: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            fsync: default_fsync(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SecurityConfig {
    /// Shared cluster auth token; empty means an open cluster.
    #[serde(default)]
    pub auth_token: Option<String>,

    /// Encrypt sync sessions (P-256 ECDH + AES-256-GCM).
    /// Secure and plaintext nodes cannot interoperate.
    #[serde(default)]
    pub secure: bool,
}

// --- Defaults ---

fn default_tcp_port() -> u16 {
    5001
}
fn default_udp_port() -> u16 {
    5000
}
fn default_beacon_interval_secs() -> u64 {
    5
}
fn default_sweep_interval_secs() -> u64 {
    10
}
fn default_peer_ttl_secs() -> u64 {
    15
}
fn default_sync_interval_secs() -> u64 {
    2
}
fn default_fanout() -> usize {
    3
}
fn default_request_timeout_ms() -> u64 {
    5000
}
fn default_true() -> bool {
    true
}
fn default_compression_threshold() -> usize {
    1024
}
fn default_resolver() -> String {
    "lww".to_string()
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_fsync() -> String {
    "batch".to_string()
}

// --- Loading ---

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl NodeConfig {
    /// Validate that configuration values are consistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync.fanout == 0 {
            return Err(ConfigError::Invalid("sync.fanout must be > 0".into()));
        }
        if self.sync.interval_secs == 0 {
            return Err(ConfigError::Invalid("sync.interval_secs must be > 0".into()));
        }
        if self.sync.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "sync.request_timeout_ms must be > 0".into(),
            ));
        }
        if self.discovery.beacon_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "discovery.beacon_interval_secs must be > 0".into(),
            ));
        }
        if self.discovery.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "discovery.sweep_interval_secs must be > 0".into(),
            ));
        }
        if self.discovery.peer_ttl_secs <= self.discovery.beacon_interval_secs {
            return Err(ConfigError::Invalid(format!(
                "discovery.peer_ttl_secs ({}) must exceed beacon_interval_secs ({})",
                self.discovery.peer_ttl_secs, self.discovery.beacon_interval_secs
            )));
        }
        match self.resolver.as_str() {
            "lww" | "field-merge" => {}
            other => {
                return Err(ConfigError::Invalid(format!(
                    "resolver must be \"lww\" or \"field-merge\", got {:?}",
                    other
                )));
            }
        }
        if self.security.secure && self.security.auth_token.is_none() {
            return Err(ConfigError::Invalid(
                "security.secure requires security.auth_token".into(),
            ));
        }
        Ok(())
    }
}

/// Load a `NodeConfig` from a YAML file path.
pub fn load_from_file(path: &std::path::Path) -> Result<NodeConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    load_from_str(&contents)
}

/// Load a `NodeConfig` from a YAML string.
pub fn load_from_str(yaml: &str) -> Result<NodeConfig, ConfigError> {
    let config: NodeConfig = serde_yaml::from_str(yaml)?;
    config.validate()?;
    Ok(config)
}
