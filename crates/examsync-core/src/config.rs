//! Engine configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for the offline sync engine and session clock.
///
/// All knobs have production defaults; tests shrink the timers to keep runs
/// fast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Quiet window after the last edit before a draft is persisted and
    /// pushed (milliseconds)
    pub debounce_ms: u64,
    /// Interval between periodic background sync passes (milliseconds)
    pub sync_interval_ms: u64,
    /// Maximum attempts for one queued mutation before it is dead-lettered
    pub max_retries: u32,
    /// Base delay for exponential backoff of failed queue items (milliseconds)
    pub base_backoff_ms: u64,
    /// Ticks between remote flushes of the elapsed-time counter
    pub checkpoint_flush_ticks: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 1_000,
            sync_interval_ms: 30_000,
            max_retries: 3,
            base_backoff_ms: 1_000,
            checkpoint_flush_ticks: 30,
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub const fn with_debounce(mut self, window: Duration) -> Self {
        self.debounce_ms = window.as_millis() as u64;
        self
    }

    #[must_use]
    pub const fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval_ms = interval.as_millis() as u64;
        self
    }

    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub const fn with_base_backoff(mut self, delay: Duration) -> Self {
        self.base_backoff_ms = delay.as_millis() as u64;
        self
    }

    #[must_use]
    pub const fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    #[must_use]
    pub const fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    /// Backoff delay after `retries` failed attempts: `base * 2^retries`
    #[must_use]
    pub const fn backoff_after(&self, retries: u32) -> Duration {
        // Cap the exponent so the shift cannot overflow
        let exponent = if retries < 16 { retries } else { 16 };
        Duration::from_millis(self.base_backoff_ms.saturating_mul(1 << exponent))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_match_production_values() {
        let config = EngineConfig::default();
        assert_eq!(config.debounce_ms, 1_000);
        assert_eq!(config.sync_interval_ms, 30_000);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.checkpoint_flush_ticks, 30);
    }

    #[test]
    fn backoff_doubles_per_retry() {
        let config = EngineConfig::default().with_base_backoff(Duration::from_millis(100));
        assert_eq!(config.backoff_after(0), Duration::from_millis(100));
        assert_eq!(config.backoff_after(1), Duration::from_millis(200));
        assert_eq!(config.backoff_after(3), Duration::from_millis(800));
        // Exponent saturates instead of overflowing the shift
        assert_eq!(config.backoff_after(40), config.backoff_after(16));
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: EngineConfig = serde_json::from_str("{\"max_retries\": 5}").unwrap();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.debounce_ms, 1_000);
    }
}
