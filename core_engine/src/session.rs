//! Session handles for AIOVPN.
//!
//! A [`SessionHandle`] ties an open transport channel to the endpoint it was
//! opened against and a unique session id used in logs. Closing consumes
//! the handle, so a released session cannot be used again.

use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::Endpoint;
use crate::transport::TransportChannel;

/// A live session with one gateway.
pub struct SessionHandle {
    id: Uuid,
    endpoint: Endpoint,
    channel: Arc<dyn TransportChannel>,
    opened_at: Instant,
}

impl SessionHandle {
    pub fn new(endpoint: Endpoint, channel: Arc<dyn TransportChannel>) -> Self {
        let id = Uuid::new_v4();
        debug!(session_id = %id, endpoint = %endpoint, "Session opened");
        SessionHandle {
            id,
            endpoint,
            channel,
            opened_at: Instant::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Shared reference to the channel, for the packet pump.
    pub fn channel(&self) -> Arc<dyn TransportChannel> {
        Arc::clone(&self.channel)
    }

    /// Close the channel and invalidate the handle.
    pub async fn close(self) {
        info!(
            session_id = %self.id,
            endpoint = %self.endpoint,
            lifetime_ms = self.opened_at.elapsed().as_millis() as u64,
            "Closing session"
        );
        self.channel.close().await;
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}
