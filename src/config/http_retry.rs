//! Retry policy configuration for outgoing HTTP calls to payment providers.

use std::time::Duration;

use serde::Deserialize;

use super::helpers::{deserialize_duration_from_ms, deserialize_duration_from_seconds};

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(250)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(10)
}

fn default_backoff_base() -> u32 {
    2
}

/// Whether to randomize backoff delays between retries.
#[derive(Default, Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JitterSetting {
    /// No jitter applied to the backoff duration.
    None,
    /// Full jitter, randomizing the backoff duration.
    #[default]
    Full,
}

/// Exponential-backoff retry policy for HTTP clients.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct HttpRetryConfig {
    /// Maximum number of retries for transient errors.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base of the exponential backoff curve.
    #[serde(default = "default_backoff_base")]
    pub base_for_backoff: u32,
    /// Backoff before the first retry.
    #[serde(
        default = "default_initial_backoff",
        deserialize_with = "deserialize_duration_from_ms"
    )]
    pub initial_backoff_ms: Duration,
    /// Upper bound on any single backoff delay.
    #[serde(
        default = "default_max_backoff",
        deserialize_with = "deserialize_duration_from_seconds"
    )]
    pub max_backoff_secs: Duration,
    /// Jitter applied to backoff delays.
    #[serde(default)]
    pub jitter: JitterSetting,
}

impl Default for HttpRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_for_backoff: default_backoff_base(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
            jitter: JitterSetting::default(),
        }
    }
}
