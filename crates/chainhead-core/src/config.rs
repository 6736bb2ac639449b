//! Head tracker configuration and its fluent builder.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ChainHeadError;

/// Configuration shared by the tracker, listener and broadcaster of one chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeadTrackerConfig {
    /// Blocks below the tip considered safe from reorgs. Also the backfill
    /// horizon and the very-old-head threshold.
    pub finality_depth: u64,
    /// How many blocks below the tip the saver keeps in memory.
    pub history_depth: u64,
    /// Capacity of the backfill and broadcast mailboxes.
    pub max_buffer_size: usize,
    /// Broadcast at most one head per interval. Zero broadcasts every head.
    #[serde(with = "duration_ms")]
    pub sampling_interval: Duration,
    /// Warn when no head arrived for this long. Zero disables the alarm.
    #[serde(with = "duration_ms")]
    pub block_emission_idle_warning_threshold: Duration,
    /// First delay between subscribe attempts.
    #[serde(with = "duration_ms")]
    pub subscribe_backoff_min: Duration,
    /// Upper bound of the subscribe backoff.
    #[serde(with = "duration_ms")]
    pub subscribe_backoff_max: Duration,
    /// Time budget of a single subscriber callback.
    #[serde(with = "duration_ms")]
    pub callback_timeout: Duration,
    /// Time budget of one backfill pass. A pass that runs over is abandoned
    /// and the next new highest head starts a fresh one.
    #[serde(with = "duration_ms")]
    pub backfill_timeout: Duration,
}

impl Default for HeadTrackerConfig {
    fn default() -> Self {
        Self {
            finality_depth: 50,
            history_depth: 100,
            max_buffer_size: 3,
            sampling_interval: Duration::from_secs(1),
            block_emission_idle_warning_threshold: Duration::ZERO,
            subscribe_backoff_min: Duration::from_secs(1),
            subscribe_backoff_max: Duration::from_secs(30),
            callback_timeout: Duration::from_secs(2),
            backfill_timeout: Duration::from_secs(10),
        }
    }
}

impl HeadTrackerConfig {
    /// Parse a JSON config document. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ChainHeadError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ChainHeadError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the workers cannot run with.
    pub fn validate(&self) -> Result<(), ChainHeadError> {
        if self.finality_depth == 0 {
            return Err(ChainHeadError::Config(
                "finality_depth must be greater than or equal to 1".into(),
            ));
        }
        if self.history_depth < self.finality_depth {
            return Err(ChainHeadError::Config(format!(
                "history_depth ({}) must be equal to or greater than finality_depth ({})",
                self.history_depth, self.finality_depth
            )));
        }
        if self.max_buffer_size == 0 {
            return Err(ChainHeadError::Config(
                "max_buffer_size must be at least 1".into(),
            ));
        }
        if self.backfill_timeout.is_zero() {
            return Err(ChainHeadError::Config("backfill_timeout must be positive".into()));
        }
        if self.subscribe_backoff_min > self.subscribe_backoff_max {
            return Err(ChainHeadError::Config(format!(
                "subscribe_backoff_min ({:?}) exceeds subscribe_backoff_max ({:?})",
                self.subscribe_backoff_min, self.subscribe_backoff_max
            )));
        }
        Ok(())
    }

    /// `true` when the broadcast worker decimates heads on a ticker.
    pub fn sampling_enabled(&self) -> bool {
        !self.sampling_interval.is_zero()
    }
}

/// Fluent builder for `HeadTrackerConfig`.
///
/// ```rust
/// use std::time::Duration;
/// use chainhead_core::HeadTrackerBuilder;
///
/// let config = HeadTrackerBuilder::new()
///     .finality_depth(12)
///     .sampling_interval(Duration::ZERO)
///     .build()
///     .unwrap();
/// assert!(!config.sampling_enabled());
/// ```
#[derive(Default)]
pub struct HeadTrackerBuilder {
    config: HeadTrackerConfig,
}

impl HeadTrackerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the finality depth (reorg and backfill horizon).
    pub fn finality_depth(mut self, depth: u64) -> Self {
        self.config.finality_depth = depth;
        self
    }

    /// Set how many blocks the saver retains below the tip.
    pub fn history_depth(mut self, depth: u64) -> Self {
        self.config.history_depth = depth;
        self
    }

    /// Set the mailbox capacity.
    pub fn max_buffer_size(mut self, size: usize) -> Self {
        self.config.max_buffer_size = size;
        self
    }

    /// Set the broadcast sampling interval (zero = every head).
    pub fn sampling_interval(mut self, interval: Duration) -> Self {
        self.config.sampling_interval = interval;
        self
    }

    /// Set the idle-alarm threshold (zero = disabled).
    pub fn idle_warning_threshold(mut self, threshold: Duration) -> Self {
        self.config.block_emission_idle_warning_threshold = threshold;
        self
    }

    /// Set the subscribe backoff bounds.
    pub fn subscribe_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.config.subscribe_backoff_min = min;
        self.config.subscribe_backoff_max = max;
        self
    }

    /// Set the per-subscriber callback timeout.
    pub fn callback_timeout(mut self, timeout: Duration) -> Self {
        self.config.callback_timeout = timeout;
        self
    }

    /// Set the time budget of one backfill pass.
    pub fn backfill_timeout(mut self, timeout: Duration) -> Self {
        self.config.backfill_timeout = timeout;
        self
    }

    /// Validate and return the config.
    pub fn build(self) -> Result<HeadTrackerConfig, ChainHeadError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
