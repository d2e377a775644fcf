//! Status publication.
//!
//! The hub owns the single authoritative [`TunnelState`]. Every transition
//! bumps the sequence number and is delivered to every observer while the
//! state lock is held, so observers see transitions in exactly the order
//! they happened.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::types::{StatusEvent, TrafficStats, TunnelState};

/// An observer's view of the status stream.
#[derive(Debug)]
pub struct StatusSubscription {
    id: u64,
    initial: TunnelState,
    events: mpsc::UnboundedReceiver<StatusEvent>,
}

impl StatusSubscription {
    /// Id to pass to `unsubscribe`.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// State at the moment of subscribing. Every later transition is
    /// delivered through [`recv`](Self::recv).
    pub fn initial_state(&self) -> TunnelState {
        self.initial
    }

    /// Next event, or `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<StatusEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<StatusEvent> {
        self.events.try_recv().ok()
    }
}

struct HubState {
    state: TunnelState,
    seq: u64,
    next_observer: u64,
    observers: HashMap<u64, mpsc::UnboundedSender<StatusEvent>>,
}

pub(crate) struct StatusHub {
    inner: Mutex<HubState>,
    traffic: Arc<TrafficStats>,
}

impl StatusHub {
    pub(crate) fn new(traffic: Arc<TrafficStats>) -> Self {
        StatusHub {
            inner: Mutex::new(HubState {
                state: TunnelState::Idle,
                seq: 0,
                next_observer: 1,
                observers: HashMap::new(),
            }),
            traffic,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn current(&self) -> TunnelState {
        self.lock().state
    }

    /// Move to `state` and publish it.
    pub(crate) fn transition(
        &self,
        state: TunnelState,
        retry_count: u32,
        last_error: Option<String>,
    ) -> StatusEvent {
        let mut hub = self.lock();
        self.publish(&mut hub, state, retry_count, last_error)
    }

    /// Move to `state` only if the current state satisfies `allowed`.
    /// Returns the rejected current state otherwise.
    pub(crate) fn transition_if(
        &self,
        allowed: impl FnOnce(&TunnelState) -> bool,
        state: TunnelState,
    ) -> Result<StatusEvent, TunnelState> {
        let mut hub = self.lock();
        if !allowed(&hub.state) {
            return Err(hub.state);
        }
        Ok(self.publish(&mut hub, state, 0, None))
    }

    fn publish(
        &self,
        hub: &mut HubState,
        state: TunnelState,
        retry_count: u32,
        last_error: Option<String>,
    ) -> StatusEvent {
        hub.seq += 1;
        hub.state = state;

        let event = StatusEvent {
            seq: hub.seq,
            timestamp: SystemTime::now(),
            state,
            retry_count,
            traffic: self.traffic.snapshot(),
            last_error,
        };

        info!(
            seq = event.seq,
            state = %state,
            retry_count,
            error = event.last_error.as_deref().unwrap_or(""),
            "Tunnel state changed"
        );

        hub.observers.retain(|id, observer| {
            let delivered = observer.send(event.clone()).is_ok();
            if !delivered {
                debug!(observer = *id, "Dropping closed status observer");
            }
            delivered
        });

        event
    }

    pub(crate) fn subscribe(&self) -> StatusSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut hub = self.lock();
        let id = hub.next_observer;
        hub.next_observer += 1;
        hub.observers.insert(id, tx);

        StatusSubscription {
            id,
            initial: hub.state,
            events: rx,
        }
    }

    pub(crate) fn unsubscribe(&self, id: u64) -> bool {
        self.lock().observers.remove(&id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureReason;

    fn hub() -> StatusHub {
        StatusHub::new(Arc::new(TrafficStats::new()))
    }

    #[tokio::test]
    async fn test_ordered_delivery() {
        let hub = hub();
        let mut sub = hub.subscribe();
        assert_eq!(sub.initial_state(), TunnelState::Idle);

        hub.transition(TunnelState::Connecting, 0, None);
        hub.transition(TunnelState::Connecting, 1, Some("refused".into()));
        hub.transition(TunnelState::Negotiating, 1, None);

        let a = sub.recv().await.unwrap();
        let b = sub.recv().await.unwrap();
        let c = sub.recv().await.unwrap();
        assert_eq!((a.seq, a.state), (1, TunnelState::Connecting));
        assert_eq!((b.seq, b.retry_count), (2, 1));
        assert_eq!(b.last_error.as_deref(), Some("refused"));
        assert_eq!((c.seq, c.state), (3, TunnelState::Negotiating));
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let hub = hub();
        let mut sub = hub.subscribe();
        assert!(hub.unsubscribe(sub.id()));
        assert!(!hub.unsubscribe(sub.id()));

        hub.transition(TunnelState::Connecting, 0, None);
        assert!(sub.recv().await.is_none());
    }

    #[test]
    fn test_conditional_transition() {
        let hub = hub();
        hub.transition(TunnelState::Failed(FailureReason::AuthRejected), 0, None);

        let first = hub.transition_if(
            |s| matches!(s, TunnelState::Failed(_)),
            TunnelState::Disconnected,
        );
        assert!(first.is_ok());

        let second = hub.transition_if(
            |s| matches!(s, TunnelState::Failed(_)),
            TunnelState::Disconnected,
        );
        assert_eq!(second.unwrap_err(), TunnelState::Disconnected);
        assert_eq!(hub.current(), TunnelState::Disconnected);
    }

    #[test]
    fn test_dropped_observer_is_pruned() {
        let hub = hub();
        let sub = hub.subscribe();
        drop(sub);
        hub.transition(TunnelState::Connecting, 0, None);
        assert!(hub.lock().observers.is_empty());
    }
}
