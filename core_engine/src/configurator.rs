//! Interface configuration.
//!
//! Turns negotiated [`SessionParameters`] into a configured virtual
//! interface. `apply` either installs everything (address, routes,
//! exclusions, DNS) or rolls back what it did before returning the error.
//! `release` undoes an applied configuration in reverse order and never
//! fails. When new parameters replace a live configuration, the new one is
//! applied first and `release_superseded` retires the old one.

use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::config::InterfaceOptions;
use crate::network::{NetworkError, NetworkManager, TunConfig, TunDevice};
use crate::types::{Route, SessionParameters};

/// Errors returned by [`InterfaceConfigurator::apply`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The parameters cannot be applied as given
    #[error("Invalid session parameters: {0}")]
    InvalidParameters(String),

    /// The OS refused a configuration step
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),
}

impl ConfigError {
    /// Only contention on an OS resource is worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConfigError::Network(NetworkError::Busy(_)))
    }
}

/// A configured virtual interface and the record of what was installed.
pub struct InterfaceHandle {
    device: Arc<dyn TunDevice>,
    name: String,
    params: SessionParameters,
    routes: Vec<Route>,
    exclusions: Vec<Route>,
    dns_configured: bool,
}

impl InterfaceHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Packet I/O on the interface, for the packet pump.
    pub fn device(&self) -> Arc<dyn TunDevice> {
        Arc::clone(&self.device)
    }

    /// Parameters the interface was configured from.
    pub fn params(&self) -> &SessionParameters {
        &self.params
    }

    /// Routes installed through the tunnel.
    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Routes installed outside the tunnel.
    pub fn exclusions(&self) -> &[Route] {
        &self.exclusions
    }

    pub fn dns_configured(&self) -> bool {
        self.dns_configured
    }
}

impl std::fmt::Debug for InterfaceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterfaceHandle")
            .field("name", &self.name)
            .field("routes", &self.routes)
            .field("exclusions", &self.exclusions)
            .field("dns_configured", &self.dns_configured)
            .finish_non_exhaustive()
    }
}

/// Applies and removes interface configuration through a [`NetworkManager`].
#[derive(Clone)]
pub struct InterfaceConfigurator {
    network: Arc<dyn NetworkManager>,
}

impl InterfaceConfigurator {
    pub fn new(network: Arc<dyn NetworkManager>) -> Self {
        InterfaceConfigurator { network }
    }

    /// Create the interface and install routes, exclusions and DNS.
    #[instrument(level = "info", skip_all, fields(mtu = params.mtu))]
    pub async fn apply(
        &self,
        params: &SessionParameters,
        options: &InterfaceOptions,
    ) -> Result<InterfaceHandle, ConfigError> {
        if params.local_address.is_none() && params.local_address_v6.is_none() {
            return Err(ConfigError::InvalidParameters(
                "gateway did not assign a local address".to_string(),
            ));
        }

        let device = self
            .network
            .create_tun(TunConfig {
                name: options.name.clone(),
                address: params.local_address,
                prefix_len: params.prefix_len,
                address_v6: params.local_address_v6,
                peer: params.peer_address,
                mtu: params.mtu,
            })
            .await?;

        let mut handle = InterfaceHandle {
            name: device.name().to_string(),
            device,
            params: params.clone(),
            routes: Vec::new(),
            exclusions: Vec::new(),
            dns_configured: false,
        };

        if let Err(err) = self.install(&mut handle, params, options).await {
            error!(interface = %handle.name, error = %err, "Interface configuration failed, rolling back");
            self.release(handle).await;
            return Err(err);
        }

        info!(
            interface = %handle.name,
            routes = handle.routes.len(),
            exclusions = handle.exclusions.len(),
            dns = handle.dns_configured,
            "Interface configured"
        );
        Ok(handle)
    }

    async fn install(
        &self,
        handle: &mut InterfaceHandle,
        params: &SessionParameters,
        options: &InterfaceOptions,
    ) -> Result<(), ConfigError> {
        for route in &params.routes {
            if route.is_multicast() {
                debug!(%route, "Ignoring multicast route");
                continue;
            }
            self.network.add_route(route, &handle.name).await?;
            handle.routes.push(route.clone());
        }

        let lan: &[Route] = if options.allow_lan {
            options.local_networks.as_slice()
        } else {
            &[]
        };
        for route in params
            .excluded_routes
            .iter()
            .chain(&options.excluded_routes)
            .chain(lan)
        {
            if handle.exclusions.contains(route) {
                continue;
            }
            self.network.exclude_route(route).await?;
            handle.exclusions.push(route.clone());
        }

        if params.dns_servers.is_empty() {
            warn!(interface = %handle.name, "No DNS servers pushed, keeping system resolvers");
        } else {
            self.network
                .configure_dns(&handle.name, &params.dns_servers, &params.search_domains)
                .await?;
            handle.dns_configured = true;
        }

        Ok(())
    }

    /// Undo everything `apply` installed, in reverse order.
    ///
    /// Errors are logged and skipped; resources that have already
    /// disappeared are not an error.
    #[instrument(level = "info", skip_all, fields(interface = %handle.name))]
    pub async fn release(&self, handle: InterfaceHandle) {
        self.release_keeping(handle, &[]).await;
    }

    /// Release `old` after `current` has taken over from it.
    ///
    /// Exclusions are not tied to an interface, so the ones `current` also
    /// installed are left in place.
    #[instrument(
        level = "info",
        skip_all,
        fields(interface = %old.name, replacement = %current.name)
    )]
    pub async fn release_superseded(&self, old: InterfaceHandle, current: &InterfaceHandle) {
        self.release_keeping(old, &current.exclusions).await;
    }

    async fn release_keeping(&self, handle: InterfaceHandle, keep_exclusions: &[Route]) {
        let InterfaceHandle {
            device,
            name,
            routes,
            exclusions,
            dns_configured,
            ..
        } = handle;

        if dns_configured {
            if let Err(e) = self.network.restore_dns(&name).await {
                log_release_error("restore DNS", &e);
            }
        }

        for route in exclusions.iter().rev() {
            if keep_exclusions.contains(route) {
                debug!(%route, "Exclusion still in use");
                continue;
            }
            if let Err(e) = self.network.remove_exclusion(route).await {
                log_release_error("remove exclusion", &e);
            }
        }

        for route in routes.iter().rev() {
            if let Err(e) = self.network.remove_route(route, &name).await {
                log_release_error("remove route", &e);
            }
        }

        if let Err(e) = self.network.destroy_tun(&name).await {
            log_release_error("destroy interface", &e);
        }
        drop(device);

        info!("Interface released");
    }
}

fn log_release_error(step: &str, err: &NetworkError) {
    match err {
        NetworkError::NotFound(_) => debug!(step, error = %err, "Already gone"),
        _ => warn!(step, error = %err, "Release step failed"),
    }
}
