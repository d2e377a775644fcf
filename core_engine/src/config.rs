//! Per-connection tunnel configuration.
//!
//! A [`TunnelConfig`] is handed to `start` and stays immutable for the whole
//! run. It can be built directly or derived from the global TOML
//! configuration.

use shared_utils::config::{Config, TransportKind};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::error::TunnelError;
use crate::types::Route;

/// A gateway the client may connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub transport: TransportKind,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, transport: TransportKind) -> Self {
        Endpoint {
            host: host.into(),
            port,
            transport,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.host, self.port, self.transport)
    }
}

/// Username and password presented to the gateway.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Options passed through to the protocol engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtocolOptions {
    pub cipher: Option<String>,
    pub auth: Option<String>,
    pub extra: BTreeMap<String, String>,
}

/// How failed connections are retried.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            enabled: true,
            max_retries: 5,
            initial_delay: Duration::from_secs(5),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl ReconnectPolicy {
    /// Retries allowed after the first failure; zero when reconnecting is off.
    pub fn attempts(&self) -> u32 {
        if self.enabled { self.max_retries } else { 0 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepaliveSettings {
    pub interval: Duration,
    pub missed_beats: u32,
}

impl Default for KeepaliveSettings {
    fn default() -> Self {
        KeepaliveSettings {
            interval: Duration::from_secs(10),
            missed_beats: 6,
        }
    }
}

/// Local interface preferences that do not come from the gateway.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceOptions {
    pub name: Option<String>,
    /// Keep `local_networks` reachable outside the tunnel
    pub allow_lan: bool,
    pub local_networks: Vec<Route>,
    /// Always routed outside the tunnel
    pub excluded_routes: Vec<Route>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PumpOptions {
    pub queue_depth: usize,
    pub block_timeout: Duration,
}

impl Default for PumpOptions {
    fn default() -> Self {
        PumpOptions {
            queue_depth: 256,
            block_timeout: Duration::from_millis(50),
        }
    }
}

/// Everything needed to bring up one tunnel.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Gateways, tried in order
    pub endpoints: Vec<Endpoint>,
    pub credentials: Option<Credentials>,
    pub protocol: ProtocolOptions,
    pub reconnect: ReconnectPolicy,
    pub keepalive: KeepaliveSettings,
    /// Bound on connect and on each handshake
    pub negotiation_timeout: Duration,
    pub interface: InterfaceOptions,
    pub pump: PumpOptions,
}

impl TunnelConfig {
    /// A configuration for the given endpoints with default timings.
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        TunnelConfig {
            endpoints,
            credentials: None,
            protocol: ProtocolOptions::default(),
            reconnect: ReconnectPolicy::default(),
            keepalive: KeepaliveSettings::default(),
            negotiation_timeout: Duration::from_secs(30),
            interface: InterfaceOptions::default(),
            pump: PumpOptions::default(),
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Check the configuration before a run starts.
    pub fn validate(&self) -> Result<(), TunnelError> {
        let invalid = |msg: &str| Err(TunnelError::InvalidConfig(msg.to_string()));

        if self.endpoints.is_empty() {
            return invalid("at least one endpoint is required");
        }
        for endpoint in &self.endpoints {
            if endpoint.host.trim().is_empty() {
                return invalid("endpoint host cannot be empty");
            }
            if endpoint.port == 0 {
                return Err(TunnelError::InvalidConfig(format!(
                    "endpoint {} has port 0",
                    endpoint.host
                )));
            }
        }

        if self.keepalive.interval.is_zero() {
            return invalid("keepalive interval must be greater than 0");
        }
        if self.keepalive.missed_beats == 0 {
            return invalid("keepalive missed beats must be greater than 0");
        }
        if self.negotiation_timeout.is_zero() {
            return invalid("negotiation timeout must be greater than 0");
        }

        if self.reconnect.multiplier.is_nan() || self.reconnect.multiplier < 1.0 {
            return invalid("reconnect multiplier must be at least 1.0");
        }
        if self.reconnect.max_delay < self.reconnect.initial_delay {
            return invalid("reconnect max delay must not be smaller than the initial delay");
        }

        if self.pump.queue_depth == 0 {
            return invalid("pump queue depth must be greater than 0");
        }

        for route in self
            .interface
            .excluded_routes
            .iter()
            .chain(&self.interface.local_networks)
        {
            if route.prefix_len > route.max_prefix_len() {
                return Err(TunnelError::InvalidConfig(format!(
                    "invalid prefix length in {route}"
                )));
            }
        }

        Ok(())
    }

    /// Derive a tunnel configuration from the global client configuration.
    pub fn from_global_config(config: &Config) -> Result<Self, TunnelError> {
        let endpoints = config
            .client
            .servers
            .iter()
            .map(|server| Endpoint::new(server.host.clone(), server.port, server.transport))
            .collect();

        let credentials = match (&config.client.username, &config.client.password) {
            (Some(username), Some(password)) => Some(Credentials::new(username, password)),
            (Some(_), None) => {
                return Err(TunnelError::InvalidConfig(
                    "username given without a password".to_string(),
                ));
            }
            _ => None,
        };

        let parse_routes = |list: &[String]| -> Result<Vec<Route>, TunnelError> {
            list.iter()
                .map(|cidr| Route::parse(cidr).map_err(TunnelError::InvalidConfig))
                .collect()
        };

        let tunnel = TunnelConfig {
            endpoints,
            credentials,
            protocol: ProtocolOptions {
                cipher: config.protocol.cipher.clone(),
                auth: config.protocol.auth.clone(),
                extra: config.protocol.extra.clone(),
            },
            reconnect: ReconnectPolicy {
                enabled: config.reconnect.enabled,
                max_retries: config.reconnect.max_retries,
                initial_delay: Duration::from_millis(config.reconnect.initial_delay_ms),
                multiplier: config.reconnect.multiplier,
                max_delay: Duration::from_millis(config.reconnect.max_delay_ms),
            },
            keepalive: KeepaliveSettings {
                interval: config.keepalive.interval(),
                missed_beats: config.keepalive.missed_beats,
            },
            negotiation_timeout: Duration::from_secs(config.negotiation.timeout_secs),
            interface: InterfaceOptions {
                name: config.interface.name.clone(),
                allow_lan: config.interface.allow_lan,
                local_networks: parse_routes(&config.interface.local_networks)?,
                excluded_routes: parse_routes(&config.interface.excluded_routes)?,
            },
            pump: PumpOptions {
                queue_depth: config.pump.queue_depth,
                block_timeout: Duration::from_millis(config.pump.block_timeout_ms),
            },
        };

        tunnel.validate()?;
        Ok(tunnel)
    }
}
