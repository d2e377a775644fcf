//! Linux-specific implementation of the Network Manager
//!
//! The TUN device is created with the `tun` crate; addresses, routes and
//! DNS are managed through `ip` and `resolvectl`.

use super::{NetworkError, NetworkManager, NetworkResult, TunConfig, TunDevice};
use async_trait::async_trait;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use tun::{AsyncDevice, Configuration, Device as _, Layer};

use crate::types::Route;

/// A TUN device opened by this process.
pub struct LinuxTun {
    name: String,
    reader: Mutex<ReadHalf<AsyncDevice>>,
    writer: Mutex<WriteHalf<AsyncDevice>>,
}

#[async_trait]
impl TunDevice for LinuxTun {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut reader = self.reader.lock().await;
        reader.read(buf).await
    }

    async fn write_packet(&self, packet: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(packet).await
    }
}

/// Linux Network Manager implementation
#[derive(Debug, Default)]
pub struct LinuxNetworkManager;

impl LinuxNetworkManager {
    /// Create a new Linux Network Manager
    pub fn new() -> Self {
        Self
    }

    /// Run a system command and return its stdout
    async fn run_command(&self, cmd: &str, args: &[&str]) -> NetworkResult<String> {
        debug!(command = cmd, ?args, "Running command");

        let output = Command::new(cmd).args(args).output().await.map_err(|e| {
            NetworkError::SystemCommand(format!("Failed to execute {cmd}: {e}"))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(classify_failure(cmd, args, &stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn ip_args(route: &Route) -> &'static str {
        if route.destination.is_ipv4() { "-4" } else { "-6" }
    }

    /// Find the gateway and device of the physical default route.
    async fn default_route(&self, ipv6: bool) -> NetworkResult<(Option<String>, String)> {
        let family = if ipv6 { "-6" } else { "-4" };
        let output = self
            .run_command("ip", &[family, "route", "show", "default"])
            .await?;

        parse_default_route(&output).ok_or_else(|| {
            NetworkError::Routing("no default route to exclude traffic through".to_string())
        })
    }
}

/// Map a failed command onto the error variant the caller can act on.
fn classify_failure(cmd: &str, args: &[&str], stderr: &str) -> NetworkError {
    let message = format!("{cmd} {}: {stderr}", args.join(" "));
    let lower = stderr.to_ascii_lowercase();

    if lower.contains("busy") {
        NetworkError::Busy(message)
    } else if lower.contains("not permitted") || lower.contains("permission denied") {
        NetworkError::Permission(message)
    } else if lower.contains("cannot find device")
        || lower.contains("no such process")
        || lower.contains("no such device")
        || lower.contains("does not exist")
    {
        NetworkError::NotFound(message)
    } else if cmd == "resolvectl" {
        NetworkError::DnsConfig(message)
    } else {
        NetworkError::SystemCommand(message)
    }
}

/// Parse the first line of `ip route show default`.
fn parse_default_route(output: &str) -> Option<(Option<String>, String)> {
    let line = output.lines().find(|l| l.starts_with("default"))?;
    let mut words = line.split_whitespace();
    let mut gateway = None;
    let mut device = None;

    while let Some(word) = words.next() {
        match word {
            "via" => gateway = words.next().map(str::to_string),
            "dev" => device = words.next().map(str::to_string),
            _ => {}
        }
    }

    device.map(|dev| (gateway, dev))
}

/// A default route through the tunnel is installed as two halves so the
/// physical default route stays in place for excluded traffic.
fn split_default(route: &Route) -> Vec<String> {
    if route.prefix_len != 0 {
        return vec![format!("{}/{}", route.destination, route.prefix_len)];
    }
    match route.destination {
        IpAddr::V4(_) => vec!["0.0.0.0/1".to_string(), "128.0.0.0/1".to_string()],
        IpAddr::V6(_) => vec!["::/1".to_string(), "8000::/1".to_string()],
    }
}

fn netmask(prefix_len: u8) -> Ipv4Addr {
    let bits = u32::MAX
        .checked_shl(32 - u32::from(prefix_len.min(32)))
        .unwrap_or(0);
    Ipv4Addr::from(bits)
}

fn tun_error(err: tun::Error) -> NetworkError {
    match err {
        tun::Error::Io(io) if io.kind() == io::ErrorKind::PermissionDenied => {
            NetworkError::Permission(format!("Failed to create TUN device: {io}"))
        }
        tun::Error::Io(io) if io.raw_os_error() == Some(16) => {
            NetworkError::Busy(format!("Failed to create TUN device: {io}"))
        }
        other => NetworkError::TunDevice(format!("Failed to create TUN device: {other}")),
    }
}

#[async_trait]
impl NetworkManager for LinuxNetworkManager {
    async fn create_tun(&self, config: TunConfig) -> NetworkResult<Arc<dyn TunDevice>> {
        info!(?config, "Creating TUN interface");

        let mut tun_config = Configuration::default();
        if let Some(name) = &config.name {
            tun_config.name(name);
        }
        tun_config.layer(Layer::L3).mtu(config.mtu as i32).up();
        if let Some(address) = config.address {
            tun_config.address(address).netmask(netmask(config.prefix_len));
        }
        if let Some(IpAddr::V4(peer)) = config.peer {
            tun_config.destination(peer);
        }
        tun_config.platform(|platform| {
            platform.packet_information(false);
        });

        let device = tun::create_as_async(&tun_config).map_err(tun_error)?;
        let name = device.get_ref().name().to_string();
        info!(interface = %name, "Created TUN device");

        // On error the device is dropped here, which removes the interface
        if let Some((address, prefix_len)) = config.address_v6 {
            let cidr = format!("{address}/{prefix_len}");
            self.run_command("ip", &["-6", "addr", "add", cidr.as_str(), "dev", name.as_str()])
                .await?;
        }

        let (reader, writer) = tokio::io::split(device);
        Ok(Arc::new(LinuxTun {
            name,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        }))
    }

    async fn destroy_tun(&self, name: &str) -> NetworkResult<()> {
        info!(interface = %name, "Destroying TUN interface");

        match self.run_command("ip", &["link", "delete", "dev", name]).await {
            Ok(_) => Ok(()),
            // The device disappears by itself once its last descriptor closes
            Err(NetworkError::NotFound(_)) => {
                debug!(interface = %name, "TUN interface already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn add_route(&self, route: &Route, interface: &str) -> NetworkResult<()> {
        info!(%route, interface, "Adding route");

        let family = Self::ip_args(route);
        let gateway = route.gateway.map(|gw| gw.to_string());
        for destination in split_default(route) {
            let mut args = vec![family, "route", "replace", destination.as_str()];
            if let Some(gw) = &gateway {
                args.extend(["via", gw.as_str()]);
            }
            args.extend(["dev", interface]);
            self.run_command("ip", &args)
                .await
                .map_err(|e| match e {
                    NetworkError::SystemCommand(msg) => NetworkError::Routing(msg),
                    other => other,
                })?;
        }
        Ok(())
    }

    async fn remove_route(&self, route: &Route, interface: &str) -> NetworkResult<()> {
        info!(%route, interface, "Removing route");

        let family = Self::ip_args(route);
        let mut first_err = None;
        for destination in split_default(route) {
            let args = [family, "route", "del", destination.as_str(), "dev", interface];
            if let Err(e) = self.run_command("ip", &args).await {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    async fn exclude_route(&self, route: &Route) -> NetworkResult<()> {
        let (gateway, device) = self.default_route(route.destination.is_ipv6()).await?;
        info!(%route, ?gateway, device = %device, "Excluding route from tunnel");

        let destination = format!("{}/{}", route.destination, route.prefix_len);
        let mut args = vec![Self::ip_args(route), "route", "replace", destination.as_str()];
        if let Some(gw) = &gateway {
            args.extend(["via", gw.as_str()]);
        }
        args.extend(["dev", device.as_str()]);

        self.run_command("ip", &args).await.map(|_| ())
    }

    async fn remove_exclusion(&self, route: &Route) -> NetworkResult<()> {
        info!(%route, "Removing route exclusion");

        let destination = format!("{}/{}", route.destination, route.prefix_len);
        self.run_command("ip", &[Self::ip_args(route), "route", "del", &destination])
            .await
            .map(|_| ())
    }

    async fn configure_dns(
        &self,
        interface: &str,
        servers: &[IpAddr],
        search_domains: &[String],
    ) -> NetworkResult<()> {
        info!(interface, ?servers, ?search_domains, "Configuring DNS");

        let servers: Vec<String> = servers.iter().map(IpAddr::to_string).collect();
        let mut args = vec!["dns", interface];
        args.extend(servers.iter().map(String::as_str));
        self.run_command("resolvectl", &args).await?;

        if !search_domains.is_empty() {
            let mut args = vec!["domain", interface];
            args.extend(search_domains.iter().map(String::as_str));
            if let Err(e) = self.run_command("resolvectl", &args).await {
                warn!(interface, error = %e, "Failed to set DNS search domains");
                let _ = self.run_command("resolvectl", &["revert", interface]).await;
                return Err(e);
            }
        }

        Ok(())
    }

    async fn restore_dns(&self, interface: &str) -> NetworkResult<()> {
        info!(interface, "Restoring DNS configuration");
        self.run_command("resolvectl", &["revert", interface])
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_default_route() {
        let output = "default via 192.168.1.1 dev wlp2s0 proto dhcp metric 600 \n";
        assert_eq!(
            parse_default_route(output),
            Some((Some("192.168.1.1".to_string()), "wlp2s0".to_string()))
        );

        let output = "default dev ppp0 scope link\n";
        assert_eq!(
            parse_default_route(output),
            Some((None, "ppp0".to_string()))
        );

        assert_eq!(parse_default_route(""), None);
    }

    #[test]
    fn test_split_default() {
        let route = Route::parse("0.0.0.0/0").unwrap();
        assert_eq!(split_default(&route), vec!["0.0.0.0/1", "128.0.0.0/1"]);

        let route = Route::parse("10.0.0.0/8").unwrap();
        assert_eq!(split_default(&route), vec!["10.0.0.0/8"]);
    }

    #[test]
    fn test_netmask() {
        assert_eq!(netmask(24), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(netmask(32), Ipv4Addr::new(255, 255, 255, 255));
        assert_eq!(netmask(0), Ipv4Addr::new(0, 0, 0, 0));
    }

    #[test]
    fn test_classify_failure() {
        assert!(matches!(
            classify_failure("ip", &["link"], "RTNETLINK answers: Device or resource busy"),
            NetworkError::Busy(_)
        ));
        assert!(matches!(
            classify_failure("ip", &["link"], "Cannot find device \"tun9\""),
            NetworkError::NotFound(_)
        ));
        assert!(matches!(
            classify_failure("ip", &["route"], "RTNETLINK answers: Operation not permitted"),
            NetworkError::Permission(_)
        ));
        assert!(matches!(
            classify_failure("resolvectl", &["dns"], "Failed to set DNS"),
            NetworkError::DnsConfig(_)
        ));
    }
}
