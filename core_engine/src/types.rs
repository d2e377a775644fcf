//! Core types shared across the tunnel session manager.

use serde::Serialize;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use tokio::time::Instant;

use crate::error::FailureReason;

/// Lifecycle state of a tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    /// Created, never started
    Idle,
    /// Opening the transport channel to a gateway
    Connecting,
    /// Running the handshake over an open channel
    Negotiating,
    /// Applying addresses, routes and DNS to the virtual interface
    ConfiguringInterface,
    /// Packets are flowing
    Connected,
    /// Link lost; the interface is kept while a new session is set up
    Reconnecting,
    /// Teardown in progress
    Disconnecting,
    /// Gave up
    Failed(FailureReason),
    /// Torn down on request
    Disconnected,
}

impl TunnelState {
    /// States from which `start` is accepted.
    pub fn can_start(&self) -> bool {
        matches!(
            self,
            TunnelState::Idle | TunnelState::Disconnected | TunnelState::Failed(_)
        )
    }

    /// States in which a session handle exists.
    pub fn has_session(&self) -> bool {
        matches!(
            self,
            TunnelState::Negotiating
                | TunnelState::ConfiguringInterface
                | TunnelState::Connected
                | TunnelState::Reconnecting
        )
    }

    /// States in which an interface handle exists.
    pub fn has_interface(&self) -> bool {
        matches!(
            self,
            TunnelState::ConfiguringInterface | TunnelState::Connected | TunnelState::Reconnecting
        )
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelState::Idle => write!(f, "idle"),
            TunnelState::Connecting => write!(f, "connecting"),
            TunnelState::Negotiating => write!(f, "negotiating"),
            TunnelState::ConfiguringInterface => write!(f, "configuring interface"),
            TunnelState::Connected => write!(f, "connected"),
            TunnelState::Reconnecting => write!(f, "reconnecting"),
            TunnelState::Disconnecting => write!(f, "disconnecting"),
            TunnelState::Failed(reason) => write!(f, "failed ({reason})"),
            TunnelState::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Platform network change pushed into the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkEvent {
    /// The default network switched (e.g. Wi-Fi to cellular)
    Changed,
    /// No network is available
    Lost,
    /// A network became available again
    Available,
}

/// A route: destination network, prefix length and optional next hop.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    pub destination: IpAddr,
    pub prefix_len: u8,
    pub gateway: Option<IpAddr>,
}

impl Route {
    pub fn new(destination: IpAddr, prefix_len: u8) -> Self {
        Route {
            destination,
            prefix_len,
            gateway: None,
        }
    }

    pub fn with_gateway(mut self, gateway: IpAddr) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Parse a route from CIDR notation.
    pub fn parse(cidr: &str) -> Result<Self, String> {
        let (destination, prefix_len) = shared_utils::config::parse_cidr(cidr)?;
        Ok(Route::new(destination, prefix_len))
    }

    /// Largest prefix length valid for the address family.
    pub fn max_prefix_len(&self) -> u8 {
        if self.destination.is_ipv4() { 32 } else { 128 }
    }

    /// True if the route lies inside the multicast range (224.0.0.0/3 for
    /// IPv4, ff00::/8 for IPv6).
    pub fn is_multicast(&self) -> bool {
        match self.destination {
            IpAddr::V4(addr) => self.prefix_len >= 3 && addr.octets()[0] & 0xe0 == 0xe0,
            IpAddr::V6(addr) => self.prefix_len >= 8 && addr.segments()[0] & 0xff00 == 0xff00,
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.destination, self.prefix_len)?;
        if let Some(gateway) = self.gateway {
            write!(f, " via {gateway}")?;
        }
        Ok(())
    }
}

/// Network parameters produced by a successful negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParameters {
    /// Address assigned to the local end of the tunnel
    pub local_address: Option<Ipv4Addr>,
    /// Prefix length of the tunnel subnet
    pub prefix_len: u8,
    /// IPv6 address and prefix length, when the gateway assigns one
    pub local_address_v6: Option<(Ipv6Addr, u8)>,
    /// Remote end of a point-to-point tunnel, if any
    pub peer_address: Option<IpAddr>,
    /// Routes to send through the tunnel
    pub routes: Vec<Route>,
    /// Routes that must bypass the tunnel
    pub excluded_routes: Vec<Route>,
    pub dns_servers: Vec<IpAddr>,
    pub search_domains: Vec<String>,
    pub mtu: u32,
}

/// Traffic counters shared between the packet pump and the manager.
#[derive(Debug)]
pub struct TrafficStats {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    packets_in: AtomicU64,
    packets_out: AtomicU64,
    dropped: AtomicU64,
    // Milliseconds since `epoch` of the last inbound data or keepalive.
    last_inbound_ms: AtomicU64,
    epoch: Instant,
}

impl Default for TrafficStats {
    fn default() -> Self {
        Self::new()
    }
}

impl TrafficStats {
    pub fn new() -> Self {
        TrafficStats {
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            packets_in: AtomicU64::new(0),
            packets_out: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            last_inbound_ms: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    /// A packet arrived from the gateway.
    pub fn record_inbound(&self, len: usize) {
        self.bytes_in.fetch_add(len as u64, Ordering::Relaxed);
        self.packets_in.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    /// A packet was handed to the transport.
    pub fn record_outbound(&self, len: usize) {
        self.bytes_out.fetch_add(len as u64, Ordering::Relaxed);
        self.packets_out.fetch_add(1, Ordering::Relaxed);
    }

    /// An outbound packet was discarded under backpressure.
    pub fn record_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Mark the link as alive without counting a packet.
    pub fn touch(&self) {
        let elapsed = Instant::now().saturating_duration_since(self.epoch);
        self.last_inbound_ms
            .store(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    /// When the gateway was last heard from.
    pub fn last_inbound(&self) -> Instant {
        self.epoch + Duration::from_millis(self.last_inbound_ms.load(Ordering::Relaxed))
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Zero every counter and restart the activity clock.
    pub fn reset(&self) {
        self.bytes_in.store(0, Ordering::Relaxed);
        self.bytes_out.store(0, Ordering::Relaxed);
        self.packets_in.store(0, Ordering::Relaxed);
        self.packets_out.store(0, Ordering::Relaxed);
        self.dropped.store(0, Ordering::Relaxed);
        self.touch();
    }

    pub fn snapshot(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            packets_in: self.packets_in.load(Ordering::Relaxed),
            packets_out: self.packets_out.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`TrafficStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrafficSnapshot {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub packets_in: u64,
    pub packets_out: u64,
    pub dropped: u64,
}

/// One state transition as seen by observers.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusEvent {
    /// Strictly increasing per manager
    pub seq: u64,
    pub timestamp: SystemTime,
    pub state: TunnelState,
    /// Attempt number while connecting or reconnecting, 0 otherwise
    pub retry_count: u32,
    pub traffic: TrafficSnapshot,
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multicast_detection() {
        assert!(Route::parse("224.0.0.0/4").unwrap().is_multicast());
        assert!(Route::parse("239.255.255.250/32").unwrap().is_multicast());
        assert!(Route::parse("224.0.0.0/3").unwrap().is_multicast());
        assert!(Route::parse("ff02::/16").unwrap().is_multicast());
        assert!(!Route::parse("10.0.0.0/8").unwrap().is_multicast());
        assert!(!Route::parse("0.0.0.0/0").unwrap().is_multicast());
        // 192.0.0.0/2 covers multicast but is not inside it
        assert!(!Route::parse("192.0.0.0/2").unwrap().is_multicast());
    }

    #[test]
    fn test_route_display() {
        let route = Route::parse("10.8.0.0/16")
            .unwrap()
            .with_gateway("10.8.0.1".parse().unwrap());
        assert_eq!(route.to_string(), "10.8.0.0/16 via 10.8.0.1");
    }

    #[test]
    fn test_state_predicates() {
        assert!(TunnelState::Idle.can_start());
        assert!(TunnelState::Failed(FailureReason::AuthRejected).can_start());
        assert!(!TunnelState::Reconnecting.can_start());
        assert!(TunnelState::Reconnecting.has_interface());
        assert!(TunnelState::Negotiating.has_session());
        assert!(!TunnelState::Negotiating.has_interface());
    }

    #[tokio::test(start_paused = true)]
    async fn test_traffic_counters() {
        let stats = TrafficStats::new();
        stats.record_outbound(100);
        stats.record_outbound(50);
        stats.record_inbound(1400);
        stats.record_drop();

        let snap = stats.snapshot();
        assert_eq!(snap.bytes_out, 150);
        assert_eq!(snap.packets_out, 2);
        assert_eq!(snap.bytes_in, 1400);
        assert_eq!(snap.packets_in, 1);
        assert_eq!(snap.dropped, 1);

        tokio::time::advance(Duration::from_secs(5)).await;
        stats.touch();
        assert!(stats.last_inbound() >= stats.epoch + Duration::from_secs(5));

        stats.reset();
        assert_eq!(stats.snapshot(), TrafficSnapshot::default());
    }
}
