use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// How concurrent outcomes are merged into a batch's aggregate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Every merge is funneled through a single collector task.
    Serialized,
    /// Each task merges its own outcome under a short-lived lock.
    Locked,
    /// Tasks hand their outcome back to the coordinator, which merges sequentially.
    #[default]
    Structured,
}

/// What a finished batch keeps from failed items.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Failed and cancelled items keep their slot in the aggregate.
    #[default]
    Record,
    /// Failed items are logged and left out of the aggregate.
    Drop,
}

/// What happens to fetches that are already running when a batch is cancelled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InFlightPolicy {
    /// Running fetches are allowed to finish and report their real outcome.
    #[default]
    Complete,
    /// Running fetches are dropped and reported as cancelled.
    Abandon,
}

/// Configuration of a fan-out batch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanOutConfig {
    /// Maximum number of fetches running at the same time.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Optional deadline for a single fetch, in milliseconds.
    #[serde(default)]
    pub item_timeout_ms: Option<u64>,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    #[serde(default)]
    pub merge_strategy: MergeStrategy,
    #[serde(default)]
    pub in_flight_on_cancel: InFlightPolicy,
}

impl FanOutConfig {
    /// Default maximum number of concurrently running fetches.
    pub const DEFAULT_MAX_CONCURRENCY: usize = 16;

    /// Validates the configuration.
    ///
    /// Ensures `max_concurrency` is non-zero and that a configured timeout is positive.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_concurrency == 0 {
            return Err(ValidationError::MaxConcurrencyZero);
        }

        if self.item_timeout_ms == Some(0) {
            return Err(ValidationError::ItemTimeoutZero);
        }

        Ok(())
    }

    /// Returns the per-item timeout as a [`Duration`], if one is configured.
    pub fn item_timeout(&self) -> Option<Duration> {
        self.item_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for FanOutConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            item_timeout_ms: None,
            failure_policy: FailurePolicy::default(),
            merge_strategy: MergeStrategy::default(),
            in_flight_on_cancel: InFlightPolicy::default(),
        }
    }
}

fn default_max_concurrency() -> usize {
    FanOutConfig::DEFAULT_MAX_CONCURRENCY
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = FanOutConfig::default();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.merge_strategy, MergeStrategy::Structured);
        assert_eq!(config.failure_policy, FailurePolicy::Record);
        assert!(config.item_timeout().is_none());
    }

    #[test]
    fn test_zero_concurrency_is_rejected() {
        let config = FanOutConfig {
            max_concurrency: 0,
            ..FanOutConfig::default()
        };
        assert_eq!(config.validate(), Err(ValidationError::MaxConcurrencyZero));
    }

    #[test]
    fn test_zero_timeout_is_rejected() {
        let config = FanOutConfig {
            item_timeout_ms: Some(0),
            ..FanOutConfig::default()
        };
        assert_eq!(config.validate(), Err(ValidationError::ItemTimeoutZero));
    }

    #[test]
    fn test_deserialize_fills_defaults() {
        let config: FanOutConfig =
            serde_json::from_str(r#"{"merge_strategy": "locked", "item_timeout_ms": 250}"#)
                .unwrap();

        assert_eq!(config.max_concurrency, FanOutConfig::DEFAULT_MAX_CONCURRENCY);
        assert_eq!(config.merge_strategy, MergeStrategy::Locked);
        assert_eq!(config.item_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.in_flight_on_cancel, InFlightPolicy::Complete);
    }
}
