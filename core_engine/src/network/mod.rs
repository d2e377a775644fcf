//! Network Manager for AIOVPN
//!
//! This module defines the traits through which the tunnel reaches the
//! operating system: a [`NetworkManager`] for the interface, routing table
//! and DNS, and a [`TunDevice`] for packet I/O on the virtual interface.

use async_trait::async_trait;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use thiserror::Error;

use crate::types::Route;

#[cfg(target_os = "linux")]
pub mod linux;

/// Result type for network operations
pub type NetworkResult<T> = Result<T, NetworkError>;

/// Error type for network operations
#[derive(Error, Debug)]
pub enum NetworkError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// TUN device error
    #[error("TUN device error: {0}")]
    TunDevice(String),

    /// Routing error
    #[error("Routing error: {0}")]
    Routing(String),

    /// DNS configuration error
    #[error("DNS configuration error: {0}")]
    DnsConfig(String),

    /// Permission error
    #[error("Permission error: {0}")]
    Permission(String),

    /// The resource is temporarily held by someone else
    #[error("Resource busy: {0}")]
    Busy(String),

    /// The resource no longer exists
    #[error("Not found: {0}")]
    NotFound(String),

    /// System command error
    #[error("System command error: {0}")]
    SystemCommand(String),

    /// Other error
    #[error("Other error: {0}")]
    Other(String),
}

/// Configuration for a TUN interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunConfig {
    /// Name of the interface (may be ignored on some platforms)
    pub name: Option<String>,

    /// Local IPv4 address of the tunnel
    pub address: Option<Ipv4Addr>,

    /// Prefix length of the IPv4 tunnel subnet
    pub prefix_len: u8,

    /// Local IPv6 address and its prefix length
    pub address_v6: Option<(Ipv6Addr, u8)>,

    /// Remote end of a point-to-point link
    pub peer: Option<IpAddr>,

    /// MTU value
    pub mtu: u32,
}

/// Packet I/O on a virtual interface.
#[async_trait]
pub trait TunDevice: Send + Sync {
    /// Name the OS gave the interface
    fn name(&self) -> &str;

    /// Read one outbound IP packet written by local applications.
    async fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Deliver one IP packet to local applications.
    async fn write_packet(&self, packet: &[u8]) -> io::Result<()>;
}

/// Network Manager trait
#[async_trait]
pub trait NetworkManager: Send + Sync {
    /// Create a TUN interface with its address assigned and bring it up
    async fn create_tun(&self, config: TunConfig) -> NetworkResult<Arc<dyn TunDevice>>;

    /// Destroy a TUN interface
    async fn destroy_tun(&self, name: &str) -> NetworkResult<()>;

    /// Route `route` through `interface`
    async fn add_route(&self, route: &Route, interface: &str) -> NetworkResult<()>;

    /// Remove a route previously added with `add_route`
    async fn remove_route(&self, route: &Route, interface: &str) -> NetworkResult<()>;

    /// Keep `route` on the physical network, outside the tunnel
    async fn exclude_route(&self, route: &Route) -> NetworkResult<()>;

    /// Remove an exclusion previously added with `exclude_route`
    async fn remove_exclusion(&self, route: &Route) -> NetworkResult<()>;

    /// Point name resolution for `interface` at the given servers
    async fn configure_dns(
        &self,
        interface: &str,
        servers: &[IpAddr],
        search_domains: &[String],
    ) -> NetworkResult<()>;

    /// Restore the DNS configuration that was active before `configure_dns`
    async fn restore_dns(&self, interface: &str) -> NetworkResult<()>;
}

/// Create the network manager for the current platform
#[cfg(target_os = "linux")]
pub fn create_network_manager() -> Arc<dyn NetworkManager> {
    Arc::new(linux::LinuxNetworkManager::new())
}
