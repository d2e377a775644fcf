//! Session negotiation.
//!
//! Opens a channel to the first reachable gateway, runs the handshake and
//! checks that the parameters pushed by the gateway are usable. Nothing in
//! here touches the operating system.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{info, instrument, warn};

use crate::config::TunnelConfig;
use crate::error::FailureReason;
use crate::session::SessionHandle;
use crate::transport::{ProtocolEngine, TransportError};
use crate::types::SessionParameters;

/// Smallest MTU an IPv4 host must accept.
pub const MIN_MTU: u32 = 576;
pub const MAX_MTU: u32 = 65535;

/// Errors produced while establishing or renewing a session.
#[derive(Debug, Error)]
pub enum NegotiationError {
    /// The handshake did not finish in time
    #[error("Negotiation timed out after {0:?}")]
    Timeout(Duration),

    /// The gateway rejected the credentials
    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    /// Protocol mismatch or unusable session parameters
    #[error("Incompatible session: {0}")]
    Incompatible(String),

    /// The channel failed underneath the handshake
    #[error("Transport error: {0}")]
    Transport(TransportError),
}

impl From<TransportError> for NegotiationError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::AuthRejected(msg) => NegotiationError::AuthRejected(msg),
            TransportError::Incompatible(msg) => NegotiationError::Incompatible(msg),
            other => NegotiationError::Transport(other),
        }
    }
}

impl NegotiationError {
    pub fn classify(&self) -> FailureReason {
        match self {
            NegotiationError::Timeout(_) | NegotiationError::Transport(_) => {
                FailureReason::TransientNetwork
            }
            NegotiationError::AuthRejected(_) => FailureReason::AuthRejected,
            NegotiationError::Incompatible(_) => FailureReason::ProtocolIncompatible,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NegotiationError::Timeout(_) | NegotiationError::Transport(_)
        )
    }
}

/// Drives connect, handshake and key renewal through the protocol engine.
#[derive(Clone)]
pub struct SessionNegotiator {
    engine: Arc<dyn ProtocolEngine>,
}

impl SessionNegotiator {
    pub fn new(engine: Arc<dyn ProtocolEngine>) -> Self {
        SessionNegotiator { engine }
    }

    /// Open a channel to the first endpoint that answers.
    ///
    /// Endpoints are tried in order, each bounded by the negotiation
    /// timeout. A non-retryable error stops the walk immediately.
    #[instrument(level = "debug", skip_all, fields(endpoints = config.endpoints.len()))]
    pub async fn connect(&self, config: &TunnelConfig) -> Result<SessionHandle, NegotiationError> {
        let mut last_err = None;

        for endpoint in &config.endpoints {
            match timeout(config.negotiation_timeout, self.engine.connect(endpoint)).await {
                Ok(Ok(channel)) => {
                    info!(endpoint = %endpoint, "Connected to gateway");
                    return Ok(SessionHandle::new(endpoint.clone(), channel));
                }
                Ok(Err(err)) => {
                    let err = NegotiationError::from(err);
                    if !err.is_retryable() {
                        return Err(err);
                    }
                    warn!(endpoint = %endpoint, error = %err, "Gateway unreachable");
                    last_err = Some(err);
                }
                Err(_) => {
                    warn!(endpoint = %endpoint, "Connect timed out");
                    last_err = Some(NegotiationError::Timeout(config.negotiation_timeout));
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            NegotiationError::Transport(TransportError::Connect(
                "no endpoints configured".to_string(),
            ))
        }))
    }

    /// Run the handshake on a freshly connected session.
    #[instrument(level = "debug", skip_all, fields(session_id = %session.id()))]
    pub async fn negotiate(
        &self,
        session: &SessionHandle,
        config: &TunnelConfig,
    ) -> Result<SessionParameters, NegotiationError> {
        let channel = session.channel();
        let handshake = channel.negotiate(config.credentials.as_ref(), &config.protocol);

        let params = timeout(config.negotiation_timeout, handshake)
            .await
            .map_err(|_| NegotiationError::Timeout(config.negotiation_timeout))??;

        validate_parameters(&params)?;
        info!(
            local_address = ?params.local_address,
            local_address_v6 = ?params.local_address_v6,
            prefix_len = params.prefix_len,
            mtu = params.mtu,
            routes = params.routes.len(),
            "Session negotiated"
        );
        Ok(params)
    }

    /// Renew keys on a live session.
    #[instrument(level = "debug", skip_all, fields(session_id = %session.id()))]
    pub async fn renegotiate(
        &self,
        session: &SessionHandle,
        limit: Duration,
    ) -> Result<(), NegotiationError> {
        let channel = session.channel();
        timeout(limit, channel.renegotiate())
            .await
            .map_err(|_| NegotiationError::Timeout(limit))??;
        info!("Session keys renewed");
        Ok(())
    }
}

/// Reject parameters that cannot be applied to an interface.
pub fn validate_parameters(params: &SessionParameters) -> Result<(), NegotiationError> {
    if !(MIN_MTU..=MAX_MTU).contains(&params.mtu) {
        return Err(NegotiationError::Incompatible(format!(
            "MTU {} outside {MIN_MTU}..={MAX_MTU}",
            params.mtu
        )));
    }
    if params.prefix_len > 32 {
        return Err(NegotiationError::Incompatible(format!(
            "prefix length {} is not a valid IPv4 prefix",
            params.prefix_len
        )));
    }
    if let Some((address, prefix_len)) = params.local_address_v6 {
        if prefix_len > 128 {
            return Err(NegotiationError::Incompatible(format!(
                "{address}/{prefix_len} is not a valid IPv6 prefix"
            )));
        }
    }
    for route in params.routes.iter().chain(&params.excluded_routes) {
        if route.prefix_len > route.max_prefix_len() {
            return Err(NegotiationError::Incompatible(format!(
                "route {route} has an invalid prefix length"
            )));
        }
    }
    Ok(())
}
