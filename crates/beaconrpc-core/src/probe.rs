//! Recovery probing for unhealthy providers.
//!
//! Calls never reach an `Inactive` provider, so the only way back is a
//! successful [`BeaconProvider::probe`](crate::provider::BeaconProvider::probe)
//! recorded through the tracker. [`probe_unhealthy`] does one round;
//! [`HealthProber`] repeats it in the background. [`probe_all`] checks every
//! provider, healthy ones included.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures::FutureExt;
use serde::Serialize;
use serde_with::{serde_as, DurationMilliSeconds};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;
use crate::health::{HealthState, HealthTracker};
use crate::provider::ProviderId;
use crate::registry::{ProviderEntry, ProviderRegistry};

/// Shortest interval the background prober runs at.
pub const MIN_PROBE_INTERVAL: Duration = Duration::from_millis(1);

/// Outcome of probing one provider.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeReport {
    pub provider: ProviderId,
    pub before: HealthState,
    pub after: HealthState,
    #[serde(rename = "latency_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub latency: Duration,
    /// Why the probe failed; `None` on success.
    pub error: Option<String>,
}

impl ProbeReport {
    /// `true` when an unhealthy provider came back to `Active`.
    pub fn recovered(&self) -> bool {
        self.before != HealthState::Active && self.after == HealthState::Active
    }
}

/// Probe every provider that is not `Active`, concurrently, each bounded by
/// `timeout`. Returns one report per probed provider in registration order.
pub async fn probe_unhealthy(
    registry: &ProviderRegistry,
    tracker: &HealthTracker,
    timeout: Duration,
) -> Vec<ProbeReport> {
    probe_where(registry, tracker, timeout, |e| e.health().state() != HealthState::Active).await
}

/// Probe every registered provider regardless of state, concurrently.
pub async fn probe_all(
    registry: &ProviderRegistry,
    tracker: &HealthTracker,
    timeout: Duration,
) -> Vec<ProbeReport> {
    probe_where(registry, tracker, timeout, |_| true).await
}

async fn probe_where(
    registry: &ProviderRegistry,
    tracker: &HealthTracker,
    timeout: Duration,
    filter: impl Fn(&ProviderEntry) -> bool,
) -> Vec<ProbeReport> {
    let snapshot = registry.snapshot();
    let probes = snapshot
        .iter()
        .filter(|e| filter(e))
        .map(|entry| probe_entry(entry, tracker, timeout));
    join_all(probes).await
}

async fn probe_entry(entry: &ProviderEntry, tracker: &HealthTracker, timeout: Duration) -> ProbeReport {
    let before = entry.health().state();
    let started = Instant::now();
    let probe = AssertUnwindSafe(entry.provider().probe()).catch_unwind();
    let result = match tokio::time::timeout(timeout, probe).await {
        Ok(Ok(result)) => result,
        Ok(Err(_panic)) => Err(ProviderError::Other("probe panicked".into())),
        Err(_) => Err(ProviderError::Timeout {
            ms: timeout.as_millis() as u64,
        }),
    };
    let latency = started.elapsed();
    let error = match result {
        Ok(()) => {
            tracker.record_success(entry.id(), entry.health());
            None
        }
        Err(e) => {
            tracing::debug!(provider = %entry.id(), error = %e, "probe failed");
            tracker.record_failure(entry.id(), entry.health(), &e);
            Some(e.to_string())
        }
    };
    ProbeReport {
        provider: entry.id().clone(),
        before,
        after: entry.health().state(),
        latency,
        error,
    }
}

/// Handle to a background probing task. Dropping it stops the task.
pub struct HealthProber {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl HealthProber {
    /// Start probing unhealthy providers every `interval`, raised to
    /// [`MIN_PROBE_INTERVAL`] if shorter.
    pub fn spawn(registry: Arc<ProviderRegistry>, tracker: HealthTracker, interval: Duration) -> Self {
        if interval < MIN_PROBE_INTERVAL {
            tracing::warn!(
                interval_ms = interval.as_millis() as u64,
                "probe interval too short, using the minimum"
            );
        }
        let interval = interval.max(MIN_PROBE_INTERVAL);
        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        // A probe may not outlive the round it belongs to.
        let probe_timeout = interval;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::debug!(interval_ms = interval.as_millis() as u64, "health prober started");
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let reports = probe_unhealthy(&registry, &tracker, probe_timeout).await;
                let recovered = reports.iter().filter(|r| r.recovered()).count();
                if recovered > 0 {
                    tracing::info!(recovered, probed = reports.len(), "providers recovered");
                }
            }
            tracing::debug!("health prober stopped");
        });

        Self {
            cancel,
            task: Some(task),
        }
    }

    /// Stop the task and wait for it to exit.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "health prober task ended abnormally");
            }
        }
    }
}

impl Drop for HealthProber {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
