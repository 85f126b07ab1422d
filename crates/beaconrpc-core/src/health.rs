//! Per-provider health state machine.
//!
//! State transitions:
//! - `Active` → `Degraded`:   consecutive errors reach `degraded_after` (K)
//! - `Degraded` → `Inactive`: consecutive errors reach `inactive_after` (2K)
//! - any → `Active`:          a single success (a call or a probe)
//!
//! Each provider's record sits behind its own mutex, so outcome reports for
//! one provider are serialized while different providers never contend.

use std::fmt;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::config::HealthConfig;
use crate::error::ProviderError;
use crate::provider::ProviderId;

/// Provider health state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// Selected by default.
    Active,
    /// Selected only under relaxed selection.
    Degraded,
    /// Never selected until a probe succeeds.
    Inactive,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Degraded => write!(f, "degraded"),
            Self::Inactive => write!(f, "inactive"),
        }
    }
}

/// A point-in-time copy of one provider's health record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    pub state: HealthState,
    pub consecutive_errors: u32,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl HealthSnapshot {
    fn initial() -> Self {
        Self {
            state: HealthState::Active,
            consecutive_errors: 0,
            last_success: None,
            last_error: None,
        }
    }
}

/// Mutable health record owned by a registry entry.
pub struct HealthCell {
    inner: Mutex<HealthSnapshot>,
}

impl HealthCell {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HealthSnapshot::initial()),
        }
    }

    /// Current state.
    pub fn state(&self) -> HealthState {
        self.inner.lock().state
    }

    /// Consistent copy of the state and its counters.
    pub fn snapshot(&self) -> HealthSnapshot {
        self.inner.lock().clone()
    }
}

impl Default for HealthCell {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HealthCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthCell")
            .field("state", &self.state())
            .finish()
    }
}

/// A state change caused by one reported outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: HealthState,
    pub to: HealthState,
}

/// Applies call outcomes to health records.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    degraded_after: u32,
    inactive_after: u32,
}

impl HealthTracker {
    pub fn new(config: &HealthConfig) -> Self {
        Self {
            degraded_after: config.degraded_after.max(1),
            inactive_after: config.inactive_threshold().max(config.degraded_after.max(1)),
        }
    }

    /// Record a successful call or probe.
    pub fn record_success(&self, provider: &ProviderId, cell: &HealthCell) -> Option<Transition> {
        let mut record = cell.inner.lock();
        let from = record.state;
        record.consecutive_errors = 0;
        record.last_success = Some(Utc::now());
        record.state = HealthState::Active;
        if from != HealthState::Active {
            tracing::info!(provider = %provider, from = %from, "provider → active");
            return Some(Transition { from, to: HealthState::Active });
        }
        None
    }

    /// Record a failed call or probe.
    ///
    /// Errors that say nothing about the endpoint (see
    /// [`ProviderError::counts_against_health`]) leave the record untouched.
    pub fn record_failure(
        &self,
        provider: &ProviderId,
        cell: &HealthCell,
        error: &ProviderError,
    ) -> Option<Transition> {
        if !error.counts_against_health() {
            return None;
        }
        let mut record = cell.inner.lock();
        let from = record.state;
        record.consecutive_errors = record.consecutive_errors.saturating_add(1);
        record.last_error = Some(error.to_string());
        let to = self.state_for(record.consecutive_errors);
        record.state = to;
        if from != to {
            tracing::warn!(
                provider = %provider,
                failures = record.consecutive_errors,
                from = %from,
                to = %to,
                "provider health demoted"
            );
            return Some(Transition { from, to });
        }
        None
    }

    fn state_for(&self, consecutive_errors: u32) -> HealthState {
        if consecutive_errors >= self.inactive_after {
            HealthState::Inactive
        } else if consecutive_errors >= self.degraded_after {
            HealthState::Degraded
        } else {
            HealthState::Active
        }
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new(&HealthConfig::default())
    }
}
