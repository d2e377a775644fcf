//! Error types exposed by the tunnel session manager.

use std::fmt;
use thiserror::Error;

use crate::configurator::ConfigError;
use crate::negotiator::NegotiationError;
use crate::pump::PumpError;
use crate::transport::TransportError;
use crate::types::TunnelState;

/// Why a tunnel ended up in the `Failed` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureReason {
    /// Network errors persisted until the retry budget ran out
    TransientNetwork,
    /// The gateway rejected the credentials
    AuthRejected,
    /// The gateway speaks an incompatible protocol or sent unusable parameters
    ProtocolIncompatible,
    /// The virtual interface could not be configured
    InterfaceConfigError,
    /// A bug: a handle went missing or the supervisor panicked
    InternalInvariantViolation,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FailureReason::TransientNetwork => "network unreachable",
            FailureReason::AuthRejected => "authentication rejected",
            FailureReason::ProtocolIncompatible => "protocol incompatible",
            FailureReason::InterfaceConfigError => "interface configuration error",
            FailureReason::InternalInvariantViolation => "internal error",
        };
        f.write_str(text)
    }
}

/// Errors returned by the manager API and carried through the supervisor.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// `start` was called while a tunnel is active
    #[error("Tunnel already running (state: {0})")]
    AlreadyRunning(TunnelState),

    /// The supplied configuration was rejected
    #[error("Invalid tunnel configuration: {0}")]
    InvalidConfig(String),

    /// Handshake failure
    #[error("Negotiation error: {0}")]
    Negotiation(#[from] NegotiationError),

    /// Transport failure on an established session
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Interface configuration failure
    #[error("Interface error: {0}")]
    Interface(#[from] ConfigError),

    /// Packet forwarding failure
    #[error("Packet pump error: {0}")]
    Pump(#[from] PumpError),

    /// Broken internal invariant
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TunnelError {
    /// Map the error onto the failure reason reported to observers.
    pub fn classify(&self) -> FailureReason {
        match self {
            TunnelError::Negotiation(err) => err.classify(),
            TunnelError::Transport(err) => err.classify(),
            TunnelError::Interface(_) => FailureReason::InterfaceConfigError,
            TunnelError::Pump(_) => FailureReason::TransientNetwork,
            TunnelError::AlreadyRunning(_)
            | TunnelError::InvalidConfig(_)
            | TunnelError::Internal(_) => FailureReason::InternalInvariantViolation,
        }
    }

    /// Whether another attempt might succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            TunnelError::Negotiation(err) => err.is_retryable(),
            TunnelError::Transport(err) => err.is_retryable(),
            TunnelError::Interface(err) => err.is_retryable(),
            TunnelError::Pump(_) => true,
            TunnelError::AlreadyRunning(_)
            | TunnelError::InvalidConfig(_)
            | TunnelError::Internal(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::NetworkError;
    use std::time::Duration;

    #[test]
    fn test_classification() {
        let err = TunnelError::from(NegotiationError::Timeout(Duration::from_secs(30)));
        assert_eq!(err.classify(), FailureReason::TransientNetwork);
        assert!(err.is_retryable());

        let err = TunnelError::from(NegotiationError::AuthRejected("bad password".into()));
        assert_eq!(err.classify(), FailureReason::AuthRejected);
        assert!(!err.is_retryable());

        let err = TunnelError::from(NegotiationError::Incompatible("mtu 100".into()));
        assert_eq!(err.classify(), FailureReason::ProtocolIncompatible);
        assert!(!err.is_retryable());

        let err = TunnelError::from(ConfigError::Network(NetworkError::Routing("x".into())));
        assert_eq!(err.classify(), FailureReason::InterfaceConfigError);
        assert!(!err.is_retryable());

        let err = TunnelError::from(ConfigError::Network(NetworkError::Busy("tun0".into())));
        assert_eq!(err.classify(), FailureReason::InterfaceConfigError);
        assert!(err.is_retryable());

        let err = TunnelError::Internal("missing session".into());
        assert_eq!(err.classify(), FailureReason::InternalInvariantViolation);
    }
}
