//! Exponential backoff between retries of a single beacon request.

use std::time::Duration;

use beaconrpc_core::ProviderError;
use serde::Deserialize;
use serde_with::{serde_as, DurationMilliSeconds};

/// Retry settings for one HTTP provider.
///
/// Retries stay inside one dispatcher attempt, so the total time spent here
/// is still bounded by the attempt timeout.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first try; 0 disables retrying.
    pub max_retries: u32,
    #[serde(rename = "initial_backoff_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub initial_backoff: Duration,
    #[serde(rename = "max_backoff_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Never retry.
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Reject a multiplier that is not a finite number of at least 1.
    pub fn validate(&self) -> Result<(), ProviderError> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ProviderError::Other(format!(
                "retry multiplier must be finite and >= 1, got {}",
                self.multiplier
            )));
        }
        Ok(())
    }

    /// Delay before retry number `retry` (1-based), or `None` once retries
    /// are exhausted.
    pub fn backoff(&self, retry: u32) -> Option<Duration> {
        if retry == 0 || retry > self.max_retries {
            return None;
        }
        if self.initial_backoff.is_zero() {
            return Some(Duration::ZERO);
        }
        // Capped in f64 milliseconds so large exponents never reach `Duration`.
        let exponent = i32::try_from(retry - 1).unwrap_or(i32::MAX);
        let base_ms = self.initial_backoff.as_millis() as f64 * self.multiplier.max(1.0).powi(exponent);
        let cap_ms = self.max_backoff.as_millis() as f64;
        Some(Duration::from_millis(base_ms.min(cap_ms) as u64))
    }
}
