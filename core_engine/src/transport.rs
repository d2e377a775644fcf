//! Transport abstraction for AIOVPN.
//!
//! The cryptographic protocol engine is an external collaborator. It is
//! reached only through the two traits in this module: a [`ProtocolEngine`]
//! opens channels to gateways, and a [`TransportChannel`] carries one
//! session. Channels encrypt on `send` and decrypt before `receive`
//! returns, so the rest of the crate only ever handles plaintext packets.

use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use thiserror::Error;

use crate::config::{Credentials, Endpoint, ProtocolOptions};
use crate::error::FailureReason;
use crate::types::SessionParameters;

/// Errors reported by the protocol engine.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Could not reach the gateway (DNS, refused, unreachable)
    #[error("Connect error: {0}")]
    Connect(String),

    /// An engine operation did not complete in time
    #[error("Operation timed out")]
    Timeout,

    /// The channel is closed
    #[error("Channel closed")]
    Closed,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The gateway rejected the credentials
    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    /// The gateway does not speak a compatible protocol
    #[error("Protocol mismatch: {0}")]
    Incompatible(String),

    /// Any other engine failure
    #[error("Transport error: {0}")]
    Other(String),
}

impl TransportError {
    pub fn classify(&self) -> FailureReason {
        match self {
            TransportError::AuthRejected(_) => FailureReason::AuthRejected,
            TransportError::Incompatible(_) => FailureReason::ProtocolIncompatible,
            _ => FailureReason::TransientNetwork,
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            TransportError::AuthRejected(_) | TransportError::Incompatible(_)
        )
    }
}

/// Something received from the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A decrypted IP packet for the local interface
    Packet(Vec<u8>),
    /// Protocol keepalive; proves the link is alive
    Keepalive,
    /// The gateway asked for new session keys
    RenegotiationRequested,
    /// The gateway closed the session
    Closed,
}

/// Opens channels to gateways.
#[async_trait]
pub trait ProtocolEngine: Send + Sync {
    /// Open a channel to `endpoint`. No handshake is performed yet.
    async fn connect(&self, endpoint: &Endpoint)
    -> Result<Arc<dyn TransportChannel>, TransportError>;
}

/// One encrypted duplex channel to a gateway.
///
/// Methods take `&self` so the send and receive directions can run
/// concurrently from separate tasks.
#[async_trait]
pub trait TransportChannel: Send + Sync {
    /// Run the handshake and return the parameters pushed by the gateway.
    async fn negotiate(
        &self,
        credentials: Option<&Credentials>,
        options: &ProtocolOptions,
    ) -> Result<SessionParameters, TransportError>;

    /// Renew session keys on the established channel.
    async fn renegotiate(&self) -> Result<(), TransportError>;

    /// Encrypt and send one packet.
    async fn send(&self, packet: &[u8]) -> Result<(), TransportError>;

    /// Wait for the next inbound item.
    async fn receive(&self) -> Result<Inbound, TransportError>;

    /// Send a protocol keepalive.
    async fn send_keepalive(&self) -> Result<(), TransportError>;

    /// Close the channel. Must tolerate being called on a dead channel.
    async fn close(&self);
}
