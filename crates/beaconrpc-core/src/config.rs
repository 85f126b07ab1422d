//! Configuration for the multi-provider client.
//!
//! Every struct implements `Default` and deserializes with missing fields
//! falling back to those defaults, so a TOML file only names what it changes:
//!
//! ```toml
//! probe_interval_ms = 5000
//!
//! [health]
//! degraded_after = 2
//!
//! [dispatch]
//! default_policy = "majority:2"
//! attempt_timeout_ms = 2000
//! ```

use std::time::Duration;

use serde::Deserialize;
use serde_with::{serde_as, DisplayFromStr, DurationMilliSeconds};
use thiserror::Error;

use crate::policy::{AggregationPolicy, Selection};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("health.degraded_after must be at least 1")]
    ZeroDegradedThreshold,

    #[error("health.inactive_after ({inactive}) must be greater than degraded_after ({degraded})")]
    InactiveBelowDegraded { degraded: u32, inactive: u32 },

    #[error("dispatch.max_parallelism must be at least 1")]
    ZeroParallelism,

    #[error("dispatch.attempt_timeout must not exceed dispatch.call_timeout")]
    AttemptExceedsCall,

    #[error("probe_interval must be greater than zero")]
    ZeroProbeInterval,

    #[error("dispatch.default_policy is invalid: {0}")]
    Policy(String),
}

/// Health state-machine thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Consecutive errors before `Active` → `Degraded` (the `K` threshold).
    pub degraded_after: u32,
    /// Consecutive errors before → `Inactive`; `2 * degraded_after` if unset.
    pub inactive_after: Option<u32>,
}

impl HealthConfig {
    pub fn inactive_threshold(&self) -> u32 {
        self.inactive_after
            .unwrap_or_else(|| self.degraded_after.saturating_mul(2))
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            degraded_after: 3,
            inactive_after: None,
        }
    }
}

/// Fan-out and timing parameters of the dispatcher.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Policy used when a call does not override it.
    #[serde_as(as = "DisplayFromStr")]
    pub default_policy: AggregationPolicy,
    /// Health states eligible when a call does not override it.
    pub selection: Selection,
    /// Maximum attempts in flight per call.
    pub max_parallelism: usize,
    /// Upper bound for a single provider attempt.
    #[serde(rename = "attempt_timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub attempt_timeout: Duration,
    /// Upper bound for a whole call when the caller gives no deadline.
    #[serde(rename = "call_timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub call_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_policy: AggregationPolicy::FirstSuccess,
            selection: Selection::ActiveOnly,
            max_parallelism: 8,
            attempt_timeout: Duration::from_secs(10),
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// Top-level configuration for [`MultiClient`](crate::multi::MultiClient).
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MultiClientConfig {
    pub health: HealthConfig,
    pub dispatch: DispatchConfig,
    /// Interval of the background prober for unhealthy providers.
    #[serde(rename = "probe_interval_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub probe_interval: Duration,
}

impl Default for MultiClientConfig {
    fn default() -> Self {
        Self {
            health: HealthConfig::default(),
            dispatch: DispatchConfig::default(),
            probe_interval: Duration::from_secs(12),
        }
    }
}

impl MultiClientConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.health.degraded_after == 0 {
            return Err(ConfigError::ZeroDegradedThreshold);
        }
        let inactive = self.health.inactive_threshold();
        if inactive <= self.health.degraded_after {
            return Err(ConfigError::InactiveBelowDegraded {
                degraded: self.health.degraded_after,
                inactive,
            });
        }
        if self.dispatch.max_parallelism == 0 {
            return Err(ConfigError::ZeroParallelism);
        }
        if self.dispatch.attempt_timeout > self.dispatch.call_timeout {
            return Err(ConfigError::AttemptExceedsCall);
        }
        if self.probe_interval.is_zero() {
            return Err(ConfigError::ZeroProbeInterval);
        }
        self.dispatch
            .default_policy
            .validate()
            .map_err(|e| ConfigError::Policy(e.to_string()))
    }
}
