//! Wireflow Configuration
//!
//! This module provides configuration structures for the Wireflow
//! agent and relay server.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::peer::{ConnectType, Peer, PrivateKey, PublicKey};

/// Main Wireflow configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Local node configuration
    pub node: NodeConfig,

    /// Signaling service configuration
    #[serde(default)]
    pub signaling: SignalingConfig,

    /// Management backend configuration
    #[serde(default)]
    pub management: ManagementConfig,

    /// Relay (WRRP) configuration
    #[serde(default)]
    pub relay: RelayConfig,

    /// NAT traversal configuration
    #[serde(default)]
    pub nat: NatConfig,

    /// Probe and retry timing
    #[serde(default)]
    pub probe: ProbeConfig,

    /// Control socket configuration
    #[serde(default)]
    pub uapi: UapiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Statically configured peers
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

/// Local node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Tunnel interface name
    #[serde(default = "default_interface")]
    pub interface: String,

    /// Base64 encoded WireGuard private key
    pub private_key: String,

    /// Tunnel address (CIDR)
    #[serde(default)]
    pub address: Option<String>,

    /// UDP bind address for the NAT traversal agent
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Only use the relay path
    #[serde(default)]
    pub force_relay: bool,
}

/// Signaling service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignalingConfig {
    /// Signaling endpoint URL
    #[serde(default)]
    pub url: Option<String>,
}

/// Management backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagementConfig {
    /// Management REST endpoint
    #[serde(default = "default_management_url")]
    pub url: String,
}

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// WRRP relay address (host:port)
    #[serde(default)]
    pub url: Option<String>,

    /// TURN server URL
    #[serde(default)]
    pub turn_url: Option<String>,

    /// Keepalive ping interval in milliseconds
    #[serde(default = "default_relay_keepalive_ms")]
    pub keepalive_interval_ms: u64,

    /// Session is considered dead after this long without any frame
    #[serde(default = "default_liveness_timeout_ms")]
    pub liveness_timeout_ms: u64,

    /// Maximum accepted payload per frame
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

/// NAT traversal configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatConfig {
    /// STUN servers used to gather server-reflexive candidates
    #[serde(default = "default_stun_servers")]
    pub stun_servers: Vec<String>,

    /// Interval between connectivity checks in milliseconds
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,

    /// Give up on connectivity checks after this many milliseconds
    #[serde(default = "default_check_timeout_ms")]
    pub check_timeout_ms: u64,

    /// Keepalive interval on the selected pair in milliseconds
    #[serde(default = "default_nat_keepalive_ms")]
    pub keepalive_interval_ms: u64,

    /// Direct path is considered dead after this long without traffic
    #[serde(default = "default_liveness_timeout_ms")]
    pub liveness_timeout_ms: u64,

    /// STUN request timeout in milliseconds
    #[serde(default = "default_stun_timeout_ms")]
    pub stun_timeout_ms: u64,
}

/// Probe and retry timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// SYN resend interval in milliseconds
    #[serde(default = "default_syn_interval_ms")]
    pub syn_interval_ms: u64,

    /// Handshake timeout in milliseconds
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// How long a relay win waits for a direct transport
    #[serde(default = "default_upgrade_grace_ms")]
    pub upgrade_grace_ms: u64,

    /// Replaced transports are closed after this delay
    #[serde(default = "default_drain_grace_ms")]
    pub drain_grace_ms: u64,

    /// Start attempts per connect type
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay after the first attempt in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Delay after subsequent attempts in milliseconds
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    /// Transport liveness check interval in milliseconds
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
}

/// Control socket configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UapiConfig {
    /// Directory holding `<interface>.sock`
    #[serde(default = "default_socket_dir")]
    pub socket_dir: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl LoggingConfig {
    /// Logging section of the config at `path`, or the defaults when it
    /// cannot be loaded
    pub fn from_file_or_default(path: &Path) -> Self {
        AgentConfig::from_file(path)
            .map(|config| config.logging)
            .unwrap_or_default()
    }

    pub fn is_compact(&self) -> bool {
        self.format == "compact"
    }
}

/// Statically configured peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Base64 encoded public key
    pub public_key: String,

    #[serde(default)]
    pub allowed_ips: Vec<String>,

    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub connect_type: ConnectType,
}

impl PeerConfig {
    /// Build the registry entry for this peer
    pub fn to_peer(&self) -> crate::Result<Peer> {
        let mut peer = Peer::new(PublicKey::from_base64(&self.public_key)?);
        peer.allowed_ips = self.allowed_ips.clone();
        peer.endpoint = self.endpoint.clone();
        peer.connect_type = self.connect_type;
        Ok(peer)
    }
}

// Default value functions
fn default_interface() -> String {
    "wf0".to_string()
}

fn default_listen_address() -> String {
    "0.0.0.0:0".to_string()
}

fn default_management_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_relay_keepalive_ms() -> u64 {
    5000
}

fn default_liveness_timeout_ms() -> u64 {
    15000
}

fn default_max_frame_size() -> usize {
    65535
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_stun_servers() -> Vec<String> {
    vec!["stun.l.google.com:19302".to_string()]
}

fn default_check_interval_ms() -> u64 {
    200
}

fn default_check_timeout_ms() -> u64 {
    30000
}

fn default_nat_keepalive_ms() -> u64 {
    2000
}

fn default_stun_timeout_ms() -> u64 {
    3000
}

fn default_syn_interval_ms() -> u64 {
    2000
}

fn default_handshake_timeout_ms() -> u64 {
    60000
}

fn default_upgrade_grace_ms() -> u64 {
    500
}

fn default_drain_grace_ms() -> u64 {
    2000
}

fn default_max_attempts() -> u32 {
    7
}

fn default_initial_backoff_ms() -> u64 {
    1000
}

fn default_retry_interval_ms() -> u64 {
    30000
}

fn default_ping_interval_ms() -> u64 {
    5000
}

fn default_socket_dir() -> PathBuf {
    PathBuf::from("/var/run/wireflow")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ManagementConfig {
    fn default() -> Self {
        Self {
            url: default_management_url(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: None,
            turn_url: None,
            keepalive_interval_ms: default_relay_keepalive_ms(),
            liveness_timeout_ms: default_liveness_timeout_ms(),
            max_frame_size: default_max_frame_size(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl Default for NatConfig {
    fn default() -> Self {
        Self {
            stun_servers: default_stun_servers(),
            check_interval_ms: default_check_interval_ms(),
            check_timeout_ms: default_check_timeout_ms(),
            keepalive_interval_ms: default_nat_keepalive_ms(),
            liveness_timeout_ms: default_liveness_timeout_ms(),
            stun_timeout_ms: default_stun_timeout_ms(),
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            syn_interval_ms: default_syn_interval_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            upgrade_grace_ms: default_upgrade_grace_ms(),
            drain_grace_ms: default_drain_grace_ms(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            retry_interval_ms: default_retry_interval_ms(),
            ping_interval_ms: default_ping_interval_ms(),
        }
    }
}

impl Default for UapiConfig {
    fn default() -> Self {
        Self {
            socket_dir: default_socket_dir(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl RelayConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl NatConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_millis(self.check_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn stun_timeout(&self) -> Duration {
        Duration::from_millis(self.stun_timeout_ms)
    }
}

impl ProbeConfig {
    pub fn syn_interval(&self) -> Duration {
        Duration::from_millis(self.syn_interval_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn upgrade_grace(&self) -> Duration {
        Duration::from_millis(self.upgrade_grace_ms)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }
}

impl NodeConfig {
    pub fn new(private_key: &PrivateKey) -> Self {
        Self {
            interface: default_interface(),
            private_key: private_key.to_base64(),
            address: None,
            listen_address: default_listen_address(),
            force_relay: false,
        }
    }
}

impl AgentConfig {
    /// Defaults everywhere except the node section
    pub fn new(node: NodeConfig) -> Self {
        Self {
            node,
            signaling: SignalingConfig::default(),
            management: ManagementConfig::default(),
            relay: RelayConfig::default(),
            nat: NatConfig::default(),
            probe: ProbeConfig::default(),
            uapi: UapiConfig::default(),
            logging: LoggingConfig::default(),
            peers: Vec::new(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: AgentConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: AgentConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as TOML
    pub fn save(&self, path: &Path) -> crate::Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.interface.is_empty() {
            return Err(crate::Error::Config("node.interface cannot be empty".into()));
        }

        PrivateKey::from_base64(&self.node.private_key)
            .map_err(|e| crate::Error::Config(format!("node.private_key: {}", e)))?;

        if self.node.force_relay && self.relay.url.is_none() {
            return Err(crate::Error::Config(
                "node.force_relay requires relay.url".into(),
            ));
        }

        if self.relay.max_frame_size == 0 {
            return Err(crate::Error::Config("relay.max_frame_size must be > 0".into()));
        }

        if !matches!(self.logging.format.as_str(), "pretty" | "compact") {
            return Err(crate::Error::Config(format!(
                "logging.format must be pretty or compact, got {}",
                self.logging.format
            )));
        }

        if self.probe.max_attempts == 0 {
            return Err(crate::Error::Config("probe.max_attempts must be > 0".into()));
        }

        for (i, peer) in self.peers.iter().enumerate() {
            PublicKey::from_base64(&peer.public_key)
                .map_err(|e| crate::Error::Config(format!("peers[{}].public_key: {}", i, e)))?;
        }

        Ok(())
    }

    /// The local private key
    pub fn private_key(&self) -> crate::Result<PrivateKey> {
        PrivateKey::from_base64(&self.node.private_key)
    }

    /// Path of the UAPI control socket
    pub fn socket_path(&self) -> PathBuf {
        self.uapi
            .socket_dir
            .join(format!("{}.sock", self.node.interface))
    }
}
