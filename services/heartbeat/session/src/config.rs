//! Heartbeat policy configuration.

use std::time::Duration;

/// Shortest interval between timer expiries
pub const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Probe ceiling used when the caller supplies a non-positive value
pub const DEFAULT_MAX_PROBES: u32 = 3;

/// Caller-facing heartbeat configuration.
///
/// Values are accepted as given and clamped by [`HeartbeatConfig::normalized`]
/// when a session is registered.
#[derive(Clone, Debug)]
pub struct HeartbeatConfig {
    /// Time between timer expiries
    pub interval: Duration,
    /// Consecutive unanswered probes tolerated before the peer is presumed dead
    pub max_probes: i64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            max_probes: DEFAULT_MAX_PROBES as i64,
        }
    }
}

impl HeartbeatConfig {
    /// Create a configuration from raw caller input
    pub fn new(interval: Duration, max_probes: i64) -> Self {
        Self { interval, max_probes }
    }

    /// Apply the interval floor and the probe ceiling default
    pub fn normalized(&self) -> HeartbeatPolicy {
        let interval = self.interval.max(MIN_INTERVAL);
        let max_probes = if self.max_probes < 1 {
            DEFAULT_MAX_PROBES
        } else {
            u32::try_from(self.max_probes).unwrap_or(u32::MAX)
        };
        HeartbeatPolicy { interval, max_probes }
    }
}

/// Clamped policy in force for a registered session
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeartbeatPolicy {
    /// Time between timer expiries, at least [`MIN_INTERVAL`]
    pub interval: Duration,
    /// Probe ceiling, at least 1
    pub max_probes: u32,
}

impl HeartbeatPolicy {
    /// Worst-case time from the last liveness signal to the broken callback
    pub fn detection_window(&self) -> Duration {
        self.interval
            .checked_mul(self.max_probes.saturating_add(1))
            .unwrap_or(Duration::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamps_invalid_input() {
        let policy = HeartbeatConfig::new(Duration::ZERO, -5).normalized();
        assert_eq!(policy.interval, Duration::from_secs(1));
        assert_eq!(policy.max_probes, 3);

        let policy = HeartbeatConfig::new(Duration::from_millis(200), 0).normalized();
        assert_eq!(policy.interval, MIN_INTERVAL);
        assert_eq!(policy.max_probes, DEFAULT_MAX_PROBES);
    }

    #[test]
    fn test_keeps_valid_input() {
        let policy = HeartbeatConfig::new(Duration::from_secs(5), 7).normalized();
        assert_eq!(policy.interval, Duration::from_secs(5));
        assert_eq!(policy.max_probes, 7);

        let policy = HeartbeatConfig::new(Duration::from_secs(1), 1).normalized();
        assert_eq!(policy.max_probes, 1);
    }

    #[test]
    fn test_huge_probe_count_saturates() {
        let policy = HeartbeatConfig::new(Duration::from_secs(1), i64::MAX).normalized();
        assert_eq!(policy.max_probes, u32::MAX);
    }

    #[test]
    fn test_detection_window() {
        let policy = HeartbeatConfig::new(Duration::from_secs(1), 3).normalized();
        assert_eq!(policy.detection_window(), Duration::from_secs(4));
    }
}
