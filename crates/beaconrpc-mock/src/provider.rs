//! Scriptable in-memory beacon provider.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use beaconrpc_core::capability::{Capability, CapabilitySet};
use beaconrpc_core::error::ProviderError;
use beaconrpc_core::provider::BeaconProvider;
use beaconrpc_core::types::{
    AggregateAttestationOpts, ApiResponse, Attestation, AttesterDutiesOpts, AttesterDuty,
    Finality, FinalityOpts, SignedVoluntaryExit, VersionedAttestation, VoluntaryExitPoolOpts,
};

use crate::fixtures;

type Handler<O, T> = Arc<dyn Fn(&O) -> Result<ApiResponse<T>, ProviderError> + Send + Sync>;

/// Per-capability call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    /// Calls that reached the provider.
    pub started: u32,
    /// Calls that got past the configured delay and produced an answer.
    pub completed: u32,
}

/// A beacon provider answering from closures or fixtures.
///
/// Every operation waits for the configured delay before answering, so
/// tests can order completions. While the mock is marked down every
/// operation and the probe fail with a transport error.
pub struct MockProvider {
    name: String,
    capabilities: CapabilitySet,
    delay: Duration,
    down: AtomicBool,
    counts: Mutex<HashMap<Capability, CallCounts>>,
    probes: Mutex<u32>,
    attester_duties: Option<Handler<AttesterDutiesOpts, Vec<AttesterDuty>>>,
    aggregate_attestation: Option<Handler<AggregateAttestationOpts, Attestation>>,
    aggregate_attestation_v2: Option<Handler<AggregateAttestationOpts, VersionedAttestation>>,
    finality: Option<Handler<FinalityOpts, Finality>>,
    voluntary_exit_pool: Option<Handler<VoluntaryExitPoolOpts, Vec<SignedVoluntaryExit>>>,
}

impl MockProvider {
    /// A healthy mock declaring every capability and answering from fixtures.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capabilities: CapabilitySet::all(),
            delay: Duration::ZERO,
            down: AtomicBool::new(false),
            counts: Mutex::new(HashMap::new()),
            probes: Mutex::new(0),
            attester_duties: None,
            aggregate_attestation: None,
            aggregate_attestation_v2: None,
            finality: None,
            voluntary_exit_pool: None,
        }
    }

    pub fn with_capabilities(mut self, capabilities: CapabilitySet) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Start out down; see [`set_down`](Self::set_down).
    pub fn down(self) -> Self {
        self.set_down(true);
        self
    }

    pub fn with_attester_duties<F>(mut self, f: F) -> Self
    where
        F: Fn(&AttesterDutiesOpts) -> Result<ApiResponse<Vec<AttesterDuty>>, ProviderError> + Send + Sync + 'static,
    {
        self.attester_duties = Some(Arc::new(f));
        self
    }

    pub fn with_aggregate_attestation<F>(mut self, f: F) -> Self
    where
        F: Fn(&AggregateAttestationOpts) -> Result<ApiResponse<Attestation>, ProviderError> + Send + Sync + 'static,
    {
        self.aggregate_attestation = Some(Arc::new(f));
        self
    }

    pub fn with_aggregate_attestation_v2<F>(mut self, f: F) -> Self
    where
        F: Fn(&AggregateAttestationOpts) -> Result<ApiResponse<VersionedAttestation>, ProviderError>
            + Send
            + Sync
            + 'static,
    {
        self.aggregate_attestation_v2 = Some(Arc::new(f));
        self
    }

    pub fn with_finality<F>(mut self, f: F) -> Self
    where
        F: Fn(&FinalityOpts) -> Result<ApiResponse<Finality>, ProviderError> + Send + Sync + 'static,
    {
        self.finality = Some(Arc::new(f));
        self
    }

    /// Always answer finality with `finalized` as the finalized epoch.
    pub fn with_finalized_epoch(self, finalized: u64) -> Self {
        self.with_finality(move |_| Ok(ApiResponse::new(fixtures::finality(finalized))))
    }

    pub fn with_voluntary_exit_pool<F>(mut self, f: F) -> Self
    where
        F: Fn(&VoluntaryExitPoolOpts) -> Result<ApiResponse<Vec<SignedVoluntaryExit>>, ProviderError>
            + Send
            + Sync
            + 'static,
    {
        self.voluntary_exit_pool = Some(Arc::new(f));
        self
    }

    /// Mark the endpoint unreachable (or reachable again).
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Calls made for `capability`.
    pub fn calls(&self, capability: Capability) -> CallCounts {
        self.counts.lock().get(&capability).copied().unwrap_or_default()
    }

    /// Calls started across all capabilities.
    pub fn total_calls(&self) -> u32 {
        self.counts.lock().values().map(|c| c.started).sum()
    }

    /// Number of `probe` calls received.
    pub fn probes(&self) -> u32 {
        *self.probes.lock()
    }

    async fn respond<O, T>(
        &self,
        capability: Capability,
        opts: &O,
        handler: Option<&Handler<O, T>>,
        fixture: impl FnOnce(&O) -> ApiResponse<T> + Send,
    ) -> Result<ApiResponse<T>, ProviderError>
    where
        O: Sync,
    {
        if !self.capabilities.supports(capability) {
            return Err(ProviderError::NotSupported { capability });
        }
        self.counts.lock().entry(capability).or_default().started += 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.counts.lock().entry(capability).or_default().completed += 1;

        if self.down.load(Ordering::SeqCst) {
            tracing::trace!(provider = %self.name, %capability, "mock is down");
            return Err(ProviderError::Http("connection refused".into()));
        }
        match handler {
            Some(handler) => handler(opts),
            None => Ok(fixture(opts)),
        }
    }
}

#[async_trait]
impl BeaconProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> CapabilitySet {
        self.capabilities
    }

    async fn probe(&self) -> Result<(), ProviderError> {
        *self.probes.lock() += 1;
        if self.down.load(Ordering::SeqCst) {
            return Err(ProviderError::Http("connection refused".into()));
        }
        Ok(())
    }

    async fn attester_duties(
        &self,
        opts: &AttesterDutiesOpts,
    ) -> Result<ApiResponse<Vec<AttesterDuty>>, ProviderError> {
        self.respond(
            Capability::AttesterDuties,
            opts,
            self.attester_duties.as_ref(),
            fixtures::attester_duties,
        )
        .await
    }

    async fn aggregate_attestation(
        &self,
        opts: &AggregateAttestationOpts,
    ) -> Result<ApiResponse<Attestation>, ProviderError> {
        self.respond(
            Capability::AggregateAttestation,
            opts,
            self.aggregate_attestation.as_ref(),
            fixtures::aggregate_attestation,
        )
        .await
    }

    async fn aggregate_attestation_v2(
        &self,
        opts: &AggregateAttestationOpts,
    ) -> Result<ApiResponse<VersionedAttestation>, ProviderError> {
        self.respond(
            Capability::AggregateAttestation,
            opts,
            self.aggregate_attestation_v2.as_ref(),
            fixtures::aggregate_attestation_v2,
        )
        .await
    }

    async fn finality(&self, opts: &FinalityOpts) -> Result<ApiResponse<Finality>, ProviderError> {
        self.respond(
            Capability::Finality,
            opts,
            self.finality.as_ref(),
            |_: &FinalityOpts| ApiResponse::new(fixtures::finality(1)),
        )
        .await
    }

    async fn voluntary_exit_pool(
        &self,
        opts: &VoluntaryExitPoolOpts,
    ) -> Result<ApiResponse<Vec<SignedVoluntaryExit>>, ProviderError> {
        self.respond(
            Capability::VoluntaryExitPool,
            opts,
            self.voluntary_exit_pool.as_ref(),
            |_: &VoluntaryExitPoolOpts| fixtures::voluntary_exit_pool(),
        )
        .await
    }
}
