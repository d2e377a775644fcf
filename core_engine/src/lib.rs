//! Tunnel session manager for AIOVPN.
//!
//! This crate owns the lifecycle of a client tunnel: it negotiates a session
//! with the remote gateway through a pluggable protocol engine, configures the
//! local virtual interface, forwards packets between the two, supervises the
//! link and publishes an ordered stream of status events.

pub mod backoff;
pub mod config;
pub mod configurator;
pub mod error;
pub mod keepalive;
pub mod manager;
pub mod negotiator;
pub mod network;
pub mod pump;
pub mod session;
pub mod status;
pub mod transport;
pub mod types;

pub use config::{
    Credentials, Endpoint, InterfaceOptions, KeepaliveSettings, ProtocolOptions, PumpOptions,
    ReconnectPolicy, TunnelConfig,
};
pub use error::{FailureReason, TunnelError};
pub use manager::TunnelSessionManager;
pub use network::{NetworkError, NetworkManager, TunConfig, TunDevice};
pub use shared_utils::config::TransportKind;
pub use status::StatusSubscription;
pub use transport::{Inbound, ProtocolEngine, TransportChannel, TransportError};
pub use types::{
    NetworkEvent, Route, SessionParameters, StatusEvent, TrafficSnapshot, TrafficStats,
    TunnelState,
};
