//! Link liveness tracking.

use std::time::Duration;
use tokio::time::Instant;

use crate::config::KeepaliveSettings;

/// Decides when a silent link is considered dead.
///
/// The link is dead once nothing (data or protocol keepalive) has arrived
/// for `interval * missed_beats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveMonitor {
    interval: Duration,
    missed_beats: u32,
}

impl KeepaliveMonitor {
    pub fn new(settings: &KeepaliveSettings) -> Self {
        KeepaliveMonitor {
            interval: settings.interval,
            missed_beats: settings.missed_beats.max(1),
        }
    }

    /// How often a keepalive is sent.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Silence tolerated before the link is declared dead.
    pub fn timeout(&self) -> Duration {
        self.interval.saturating_mul(self.missed_beats)
    }

    pub fn is_expired(&self, last_inbound: Instant, now: Instant) -> bool {
        now.saturating_duration_since(last_inbound) >= self.timeout()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_interval_times_beats() {
        let monitor = KeepaliveMonitor::new(&KeepaliveSettings::default());
        assert_eq!(monitor.interval(), Duration::from_secs(10));
        assert_eq!(monitor.timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_expiry() {
        let monitor = KeepaliveMonitor::new(&KeepaliveSettings {
            interval: Duration::from_secs(2),
            missed_beats: 3,
        });
        let start = Instant::now();

        assert!(!monitor.is_expired(start, start));
        assert!(!monitor.is_expired(start, start + Duration::from_millis(5_999)));
        assert!(monitor.is_expired(start, start + Duration::from_secs(6)));
        // Activity recorded after `now` never counts as expired
        assert!(!monitor.is_expired(start + Duration::from_secs(1), start));
    }
}
