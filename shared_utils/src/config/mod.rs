//! Configuration management module for AIOVPN.
//!
//! This module provides functionality for loading, parsing, and managing
//! the client configuration: gateway endpoints, credentials, protocol
//! options and the timing knobs used by the tunnel session manager.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading configuration file
    #[error("Failed to read config file: {0}")]
    IoError(#[from] io::Error),

    /// Error parsing TOML configuration
    #[error("Failed to parse TOML config: {0}")]
    TomlError(#[from] toml::de::Error),

    /// Error serializing configuration to TOML
    #[error("Failed to serialize config to TOML: {0}")]
    TomlSerError(#[from] toml::ser::Error),

    /// Missing required configuration value
    #[error("Missing required configuration value: {0}")]
    MissingValue(String),

    /// Invalid configuration value
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration file not found
    #[error("Configuration file not found at {0}")]
    FileNotFound(PathBuf),
}

/// Transport used to reach the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Datagram transport (default)
    #[default]
    Udp,
    /// Length-framed stream transport
    Tcp,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Udp => write!(f, "udp"),
            TransportKind::Tcp => write!(f, "tcp"),
        }
    }
}

/// One remote gateway the client may connect to.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ServerEntry {
    /// Hostname or IP address of the gateway
    pub host: String,

    /// Port of the gateway (default: 1194)
    #[serde(default = "default_server_port")]
    pub port: u16,

    /// Transport kind (default: udp)
    #[serde(default)]
    pub transport: TransportKind,
}

fn default_server_port() -> u16 {
    1194
}

impl ServerEntry {
    /// Parse `host:port` or `host:port/tcp`.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let invalid = |message: &str| ConfigError::InvalidValue {
            key: "client.servers".to_string(),
            message: format!("{message}: {s:?}"),
        };

        let (addr, transport) = match s.rsplit_once('/') {
            Some((addr, "udp")) => (addr, TransportKind::Udp),
            Some((addr, "tcp")) => (addr, TransportKind::Tcp),
            Some(_) => return Err(invalid("unknown transport suffix")),
            None => (s, TransportKind::Udp),
        };

        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| invalid("expected host:port"))?;
        let port = port.parse::<u16>().map_err(|_| invalid("invalid port"))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');

        Ok(ServerEntry {
            host: host.to_string(),
            port,
            transport,
        })
    }
}

/// Client-specific configuration settings.
#[derive(Clone, Deserialize, Serialize, Default)]
pub struct ClientConfig {
    /// Gateways to try, in order
    #[serde(default)]
    pub servers: Vec<ServerEntry>,

    /// Username presented during negotiation
    pub username: Option<String>,

    /// Password presented during negotiation
    pub password: Option<String>,
}

// Credentials never reach the logs.
impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("servers", &self.servers)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Cipher and authentication preferences handed to the protocol engine.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ProtocolConfig {
    /// Preferred data channel cipher
    pub cipher: Option<String>,

    /// Preferred HMAC digest
    pub auth: Option<String>,

    /// Additional engine options, passed through verbatim
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

/// Reconnection policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReconnectConfig {
    /// Reconnect automatically after a transport failure (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum attempts before giving up (default: 5)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry in milliseconds (default: 5000)
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Growth factor between retries (default: 2.0)
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Upper bound for the retry delay in milliseconds (default: 60000)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    5
}

fn default_initial_delay_ms() -> u64 {
    5_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    60_000
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        ReconnectConfig {
            enabled: default_true(),
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Keepalive settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KeepaliveConfig {
    /// Interval between protocol keepalives in seconds (default: 10)
    #[serde(default = "default_keepalive_interval")]
    pub interval_secs: u64,

    /// Silent intervals tolerated before the link is considered stale (default: 6)
    #[serde(default = "default_missed_beats")]
    pub missed_beats: u32,
}

fn default_keepalive_interval() -> u64 {
    10
}

fn default_missed_beats() -> u32 {
    6
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        KeepaliveConfig {
            interval_secs: default_keepalive_interval(),
            missed_beats: default_missed_beats(),
        }
    }
}

impl KeepaliveConfig {
    /// Returns the keepalive interval as a [`Duration`].
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Handshake settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NegotiationConfig {
    /// Upper bound for connect plus handshake in seconds (default: 30)
    #[serde(default = "default_negotiation_timeout")]
    pub timeout_secs: u64,
}

fn default_negotiation_timeout() -> u64 {
    30
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        NegotiationConfig {
            timeout_secs: default_negotiation_timeout(),
        }
    }
}

/// Local virtual interface settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct InterfaceConfig {
    /// Requested interface name (may be ignored on some platforms)
    pub name: Option<String>,

    /// Keep local networks reachable outside the tunnel (default: false)
    #[serde(default)]
    pub allow_lan: bool,

    /// Local networks (CIDRs) excluded from the tunnel when `allow_lan` is set
    #[serde(default)]
    pub local_networks: Vec<String>,

    /// Routes (CIDRs) that always bypass the tunnel
    #[serde(default)]
    pub excluded_routes: Vec<String>,
}

/// Packet forwarding settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PumpConfig {
    /// Outbound packets buffered while the transport is congested (default: 256)
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    /// How long the interface reader waits for queue space before dropping
    /// the oldest packet, in milliseconds (default: 50)
    #[serde(default = "default_block_timeout_ms")]
    pub block_timeout_ms: u64,
}

fn default_queue_depth() -> usize {
    256
}

fn default_block_timeout_ms() -> u64 {
    50
}

impl Default for PumpConfig {
    fn default() -> Self {
        PumpConfig {
            queue_depth: default_queue_depth(),
            block_timeout_ms: default_block_timeout_ms(),
        }
    }
}

/// Main configuration structure for AIOVPN.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Client configuration
    #[serde(default)]
    pub client: ClientConfig,

    /// Protocol options
    #[serde(default)]
    pub protocol: ProtocolConfig,

    /// Reconnection policy
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Keepalive settings
    #[serde(default)]
    pub keepalive: KeepaliveConfig,

    /// Handshake settings
    #[serde(default)]
    pub negotiation: NegotiationConfig,

    /// Virtual interface settings
    #[serde(default)]
    pub interface: InterfaceConfig,

    /// Packet forwarding settings
    #[serde(default)]
    pub pump: PumpConfig,

    /// Log level (default: "info")
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            client: ClientConfig::default(),
            protocol: ProtocolConfig::default(),
            reconnect: ReconnectConfig::default(),
            keepalive: KeepaliveConfig::default(),
            negotiation: NegotiationConfig::default(),
            interface: InterfaceConfig::default(),
            pump: PumpConfig::default(),
            log_level: default_log_level(),
        }
    }
}

/// Parse a CIDR such as `10.0.0.0/8` or `fd00::/64`.
///
/// A bare address is treated as a host route.
pub fn parse_cidr(s: &str) -> Result<(IpAddr, u8), String> {
    let s = s.trim();
    let (addr, prefix) = match s.split_once('/') {
        Some((addr, prefix)) => (addr, Some(prefix)),
        None => (s, None),
    };

    let addr: IpAddr = addr
        .parse()
        .map_err(|e| format!("invalid address {addr:?}: {e}"))?;
    let max = if addr.is_ipv4() { 32 } else { 128 };

    let prefix = match prefix {
        Some(p) => p
            .parse::<u8>()
            .map_err(|e| format!("invalid prefix length {p:?}: {e}"))?,
        None => max,
    };
    if prefix > max {
        return Err(format!("prefix length {prefix} exceeds {max}"));
    }

    Ok((addr, prefix))
}

impl Config {
    /// Create a new default configuration
    pub fn new() -> Self {
        Config::default()
    }

    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;

        // Environment takes precedence over the file; credentials usually
        // arrive this way, so overrides are applied before validation.
        Self::apply_env_overrides(&mut config);
        config.validate()?;

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    /// Render the configuration as pretty TOML
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client.servers.is_empty() {
            return Err(ConfigError::MissingValue("client.servers".to_string()));
        }
        for server in &self.client.servers {
            if server.host.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: "client.servers.host".to_string(),
                    message: "host cannot be empty".to_string(),
                });
            }
            if server.port == 0 {
                return Err(ConfigError::InvalidValue {
                    key: "client.servers.port".to_string(),
                    message: format!("port must be non-zero for {}", server.host),
                });
            }
        }

        if self.client.username.is_some() && self.client.password.is_none() {
            return Err(ConfigError::MissingValue(
                "client.password must be provided when client.username is set".to_string(),
            ));
        }

        if self.reconnect.multiplier < 1.0 {
            return Err(ConfigError::InvalidValue {
                key: "reconnect.multiplier".to_string(),
                message: "must be at least 1.0".to_string(),
            });
        }
        if self.reconnect.max_delay_ms < self.reconnect.initial_delay_ms {
            return Err(ConfigError::InvalidValue {
                key: "reconnect.max_delay_ms".to_string(),
                message: "must not be smaller than reconnect.initial_delay_ms".to_string(),
            });
        }

        if self.keepalive.interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "keepalive.interval_secs".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
        if self.keepalive.missed_beats == 0 {
            return Err(ConfigError::InvalidValue {
                key: "keepalive.missed_beats".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        if self.negotiation.timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "negotiation.timeout_secs".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        if self.pump.queue_depth == 0 {
            return Err(ConfigError::InvalidValue {
                key: "pump.queue_depth".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        for (key, list) in [
            ("interface.local_networks", &self.interface.local_networks),
            ("interface.excluded_routes", &self.interface.excluded_routes),
        ] {
            for cidr in list {
                parse_cidr(cidr).map_err(|message| ConfigError::InvalidValue {
                    key: key.to_string(),
                    message,
                })?;
            }
        }

        match self.log_level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(ConfigError::InvalidValue {
                    key: "log_level".to_string(),
                    message: format!("unknown level {other:?}"),
                });
            }
        }

        Ok(())
    }

    /// Apply environment variable overrides (prefix: AIOVPN_)
    /// Example keys:
    /// - AIOVPN_LOG_LEVEL
    /// - AIOVPN_CLIENT_SERVERS (`host:port[/tcp],...`), AIOVPN_CLIENT_USERNAME, AIOVPN_CLIENT_PASSWORD
    /// - AIOVPN_RECONNECT_ENABLED, AIOVPN_RECONNECT_MAX_RETRIES, AIOVPN_RECONNECT_INITIAL_DELAY_MS,
    ///   AIOVPN_RECONNECT_MAX_DELAY_MS
    /// - AIOVPN_KEEPALIVE_INTERVAL_SECS, AIOVPN_KEEPALIVE_MISSED_BEATS, AIOVPN_NEGOTIATION_TIMEOUT_SECS
    /// - AIOVPN_INTERFACE_NAME, AIOVPN_INTERFACE_ALLOW_LAN, AIOVPN_INTERFACE_EXCLUDED_ROUTES
    /// - AIOVPN_PUMP_QUEUE_DEPTH
    fn apply_env_overrides(cfg: &mut Config) {
        use std::env;

        fn parse_bool(s: &str) -> Option<bool> {
            match s.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "y" => Some(true),
                "false" | "0" | "no" | "n" => Some(false),
                _ => None,
            }
        }

        if let Ok(v) = env::var("AIOVPN_LOG_LEVEL") {
            cfg.log_level = v.to_ascii_lowercase();
        }

        // Client
        if let Ok(v) = env::var("AIOVPN_CLIENT_SERVERS") {
            let servers: Vec<ServerEntry> = split_csv(&v)
                .iter()
                .filter_map(|s| ServerEntry::parse(s).ok())
                .collect();
            if !servers.is_empty() {
                cfg.client.servers = servers;
            }
        }
        if let Ok(v) = env::var("AIOVPN_CLIENT_USERNAME") {
            if !v.is_empty() {
                cfg.client.username = Some(v);
            }
        }
        if let Ok(v) = env::var("AIOVPN_CLIENT_PASSWORD") {
            if !v.is_empty() {
                cfg.client.password = Some(v);
            }
        }

        // Reconnect
        if let Ok(v) = env::var("AIOVPN_RECONNECT_ENABLED") {
            if let Some(b) = parse_bool(&v) {
                cfg.reconnect.enabled = b;
            }
        }
        if let Ok(v) = env::var("AIOVPN_RECONNECT_MAX_RETRIES") {
            if let Ok(n) = v.parse() {
                cfg.reconnect.max_retries = n;
            }
        }
        if let Ok(v) = env::var("AIOVPN_RECONNECT_INITIAL_DELAY_MS") {
            if let Ok(n) = v.parse() {
                cfg.reconnect.initial_delay_ms = n;
            }
        }
        if let Ok(v) = env::var("AIOVPN_RECONNECT_MAX_DELAY_MS") {
            if let Ok(n) = v.parse() {
                cfg.reconnect.max_delay_ms = n;
            }
        }

        // Keepalive and negotiation
        if let Ok(v) = env::var("AIOVPN_KEEPALIVE_INTERVAL_SECS") {
            if let Ok(n) = v.parse() {
                cfg.keepalive.interval_secs = n;
            }
        }
        if let Ok(v) = env::var("AIOVPN_KEEPALIVE_MISSED_BEATS") {
            if let Ok(n) = v.parse() {
                cfg.keepalive.missed_beats = n;
            }
        }
        if let Ok(v) = env::var("AIOVPN_NEGOTIATION_TIMEOUT_SECS") {
            if let Ok(n) = v.parse() {
                cfg.negotiation.timeout_secs = n;
            }
        }

        // Interface
        if let Ok(v) = env::var("AIOVPN_INTERFACE_NAME") {
            if !v.is_empty() {
                cfg.interface.name = Some(v);
            }
        }
        if let Ok(v) = env::var("AIOVPN_INTERFACE_ALLOW_LAN") {
            if let Some(b) = parse_bool(&v) {
                cfg.interface.allow_lan = b;
            }
        }
        if let Ok(v) = env::var("AIOVPN_INTERFACE_EXCLUDED_ROUTES") {
            let list = split_csv(&v);
            if !list.is_empty() {
                cfg.interface.excluded_routes = list;
            }
        }

        // Pump
        if let Ok(v) = env::var("AIOVPN_PUMP_QUEUE_DEPTH") {
            if let Ok(n) = v.parse() {
                cfg.pump.queue_depth = n;
            }
        }
    }

    /// Reload configuration from the same file it was loaded from
    pub fn reload(&mut self, path: &Path) -> Result<(), ConfigError> {
        *self = Self::load(path)?;
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("aiovpn").join("config.toml")
        } else {
            PathBuf::from("config.toml")
        }
    }
}

fn split_csv(s: &str) -> Vec<String> {
    s.split(',')
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}

/// Configuration manager for handling configuration loading and reloading.
#[derive(Debug)]
pub struct ConfigManager {
    /// Current configuration
    config: Config,
    /// Path to the configuration file
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new configuration manager with the default configuration
    pub fn new() -> Self {
        ConfigManager {
            config: Config::default(),
            config_path: Config::default_path(),
        }
    }

    /// Load configuration from the specified path
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let config = Config::load(&path)?;

        Ok(ConfigManager {
            config,
            config_path: path,
        })
    }

    /// Load configuration from the default path
    pub fn load_default() -> Result<Self, ConfigError> {
        Self::load(Config::default_path())
    }

    /// Get a reference to the current configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get a mutable reference to the current configuration
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Reload configuration from the current path
    pub fn reload(&mut self) -> Result<(), ConfigError> {
        self.config.reload(&self.config_path)
    }

    /// Save the current configuration to the current path
    pub fn save(&self) -> Result<(), ConfigError> {
        self.config.save(&self.config_path)
    }

    /// Save the current configuration to a new path
    pub fn save_as<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        self.config.save(path)
    }

    /// Get the current configuration file path
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}
