//! Restart tracker for channel encoders.
//!
//! Channels are always restarted; the tracker only decides *when*.
//! With backoff disabled (the default) every restart is immediate. With
//! backoff enabled:
//!
//! - failures below the threshold within the failure window restart
//!   immediately
//! - from the threshold on, the delay is `base * 2^(failures - threshold)`
//! - the delay is capped at `max_backoff`
//! - failures older than the window are forgotten

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::channel::ChannelId;

/// Maximum exponent to prevent overflow.
const MAX_EXPONENT: u32 = 10;

/// Configuration for the restart tracker.
#[derive(Debug, Clone)]
pub struct RestartTrackerConfig {
    /// Apply backoff at all.
    pub backoff_enabled: bool,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Window for counting failures.
    pub failure_window: Duration,
    /// Number of failures before applying backoff.
    pub failure_threshold: usize,
}

impl Default for RestartTrackerConfig {
    fn default() -> Self {
        Self {
            backoff_enabled: false,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
            failure_window: Duration::from_secs(60),
            failure_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct RestartHistory {
    failures: Vec<Instant>,
    total_restarts: u64,
    next_attempt: Option<Instant>,
}

impl RestartHistory {
    /// Record a failure and return the number of recent failures.
    fn record_failure(&mut self, now: Instant, window: Duration) -> usize {
        self.failures.retain(|&t| now.duration_since(t) < window);
        self.failures.push(now);
        self.failures.len()
    }

    fn recent_failures(&self, now: Instant, window: Duration) -> usize {
        self.failures
            .iter()
            .filter(|&&t| now.duration_since(t) < window)
            .count()
    }
}

/// Tracks per-channel restart history.
#[derive(Debug, Default)]
pub struct RestartTracker {
    history: HashMap<ChannelId, RestartHistory>,
    config: RestartTrackerConfig,
}

impl RestartTracker {
    pub fn with_config(config: RestartTrackerConfig) -> Self {
        Self {
            history: HashMap::new(),
            config,
        }
    }

    /// Record an exit of `id` and return the delay before it may restart.
    pub fn record_failure(&mut self, id: ChannelId) -> Duration {
        let now = Instant::now();
        let window = self.config.failure_window;
        let history = self.history.entry(id).or_default();
        let failures = history.record_failure(now, window);

        let backoff = self.calculate_backoff(failures);
        if let Some(history) = self.history.get_mut(&id) {
            history.next_attempt = Some(now + backoff);
        }

        if backoff.is_zero() {
            debug!(channel = %id, "Exited ({} times in window), immediate restart", failures);
        } else {
            info!(channel = %id, "Exited ({} times in window), restart in {:?}", failures, backoff);
        }

        backoff
    }

    /// Count a restart attempt of `id`; returns the total so far.
    pub fn record_restart(&mut self, id: ChannelId) -> u64 {
        let history = self.history.entry(id).or_default();
        history.total_restarts += 1;
        history.total_restarts
    }

    /// Whether the backoff delay for `id` has elapsed.
    pub fn is_ready(&self, id: ChannelId) -> bool {
        self.history
            .get(&id)
            .and_then(|h| h.next_attempt)
            .is_none_or(|at| Instant::now() >= at)
    }

    fn calculate_backoff(&self, failures: usize) -> Duration {
        if !self.config.backoff_enabled || failures < self.config.failure_threshold {
            return Duration::ZERO;
        }

        let exponent =
            (failures - self.config.failure_threshold).min(MAX_EXPONENT as usize) as u32;
        let multiplier = 2u32.saturating_pow(exponent);
        let backoff = self.config.base_backoff.saturating_mul(multiplier);

        backoff.min(self.config.max_backoff)
    }

    pub fn recent_failures(&self, id: ChannelId) -> usize {
        let now = Instant::now();
        self.history
            .get(&id)
            .map(|h| h.recent_failures(now, self.config.failure_window))
            .unwrap_or(0)
    }

    pub fn total_restarts(&self, id: ChannelId) -> u64 {
        self.history.get(&id).map(|h| h.total_restarts).unwrap_or(0)
    }

    /// Forget recent failures once a channel has stayed up for a full window.
    pub fn note_uptime(&mut self, id: ChannelId, uptime: Duration) {
        if uptime < self.config.failure_window {
            return;
        }
        if let Some(history) = self.history.get_mut(&id) {
            if !history.failures.is_empty() {
                debug!(channel = %id, "Stable for {:?}, clearing failure history", uptime);
                history.failures.clear();
                history.next_attempt = None;
            }
        }
    }

    /// Drop all history for a channel (its unit was replaced).
    pub fn remove(&mut self, id: ChannelId) {
        self.history.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u16) -> ChannelId {
        ChannelId::new(n).unwrap()
    }

    fn backoff_config() -> RestartTrackerConfig {
        RestartTrackerConfig {
            backoff_enabled: true,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
            failure_window: Duration::from_secs(60),
            failure_threshold: 3,
        }
    }

    #[test]
    fn test_default_never_delays() {
        let mut tracker = RestartTracker::default();
        for _ in 0..50 {
            assert_eq!(tracker.record_failure(id(1)), Duration::ZERO);
            assert!(tracker.is_ready(id(1)));
        }
        assert_eq!(tracker.recent_failures(id(1)), 50);
    }

    #[test]
    fn test_exponential_backoff() {
        let mut tracker = RestartTracker::with_config(backoff_config());

        assert_eq!(tracker.record_failure(id(1)), Duration::ZERO);
        assert_eq!(tracker.record_failure(id(1)), Duration::ZERO);
        assert_eq!(tracker.record_failure(id(1)), Duration::from_secs(1));
        assert!(!tracker.is_ready(id(1)));
        assert_eq!(tracker.record_failure(id(1)), Duration::from_secs(2));
        assert_eq!(tracker.record_failure(id(1)), Duration::from_secs(4));
        assert_eq!(tracker.record_failure(id(1)), Duration::from_secs(8));
        assert_eq!(tracker.record_failure(id(1)), Duration::from_secs(10));
        assert_eq!(tracker.record_failure(id(1)), Duration::from_secs(10));
    }

    #[test]
    fn test_channels_tracked_independently() {
        let mut tracker = RestartTracker::with_config(backoff_config());
        for _ in 0..5 {
            tracker.record_failure(id(1));
        }
        tracker.record_failure(id(2));

        assert_eq!(tracker.recent_failures(id(1)), 5);
        assert_eq!(tracker.recent_failures(id(2)), 1);
        assert!(!tracker.is_ready(id(1)));
        assert!(tracker.is_ready(id(2)));
        assert!(tracker.is_ready(id(3)));
    }

    #[test]
    fn test_uptime_clears_failures() {
        let mut tracker = RestartTracker::with_config(backoff_config());
        for _ in 0..4 {
            tracker.record_failure(id(1));
        }

        tracker.note_uptime(id(1), Duration::from_secs(10));
        assert_eq!(tracker.recent_failures(id(1)), 4);

        tracker.note_uptime(id(1), Duration::from_secs(60));
        assert_eq!(tracker.recent_failures(id(1)), 0);
        assert!(tracker.is_ready(id(1)));
    }

    #[test]
    fn test_restarts_counted_apart_from_failures() {
        let mut tracker = RestartTracker::default();
        tracker.record_failure(id(1));
        tracker.record_failure(id(1));
        assert_eq!(tracker.total_restarts(id(1)), 0);

        assert_eq!(tracker.record_restart(id(1)), 1);
        assert_eq!(tracker.record_restart(id(1)), 2);
        assert_eq!(tracker.recent_failures(id(1)), 2);

        tracker.note_uptime(id(1), Duration::from_secs(60));
        assert_eq!(tracker.total_restarts(id(1)), 2);
    }

    #[test]
    fn test_remove() {
        let mut tracker = RestartTracker::with_config(backoff_config());
        tracker.record_failure(id(1));
        tracker.record_restart(id(1));
        tracker.remove(id(1));
        assert_eq!(tracker.recent_failures(id(1)), 0);
        assert_eq!(tracker.total_restarts(id(1)), 0);
    }
}
