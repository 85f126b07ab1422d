//! Typed multi-provider beacon client.
//!
//! [`MultiClient`] owns a registry and a dispatcher and exposes each beacon
//! operation as a method returning an [`Envelope`]. Answers are compared on
//! their `data` only; node metadata such as `execution_optimistic` may differ
//! between agreeing providers and the envelope keeps the first one heard.
//!
//! A `MultiClient` is itself a [`BeaconProvider`], so one pool can sit inside
//! another. Used that way it returns the agreed value and turns a
//! disagreement into [`ProviderError::Disagreement`].

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::capability::{Capability, CapabilitySet};
use crate::config::{ConfigError, MultiClientConfig};
use crate::dispatch::{CallContext, Dispatcher};
use crate::envelope::Envelope;
use crate::error::{DispatchError, ProviderError, RegistryError};
use crate::health::{HealthState, HealthTracker};
use crate::probe::{self, HealthProber, ProbeReport};
use crate::provider::{BeaconProvider, ProviderId};
use crate::registry::{ProviderRegistry, ProviderStatus};
use crate::types::{
    AggregateAttestationOpts, ApiResponse, Attestation, AttesterDutiesOpts, AttesterDuty,
    Finality, FinalityOpts, SignedVoluntaryExit, VersionedAttestation, VoluntaryExitPoolOpts,
};

/// Errors from building a [`MultiClient`].
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

type Reply<T> = Result<Envelope<ApiResponse<T>>, DispatchError>;

pub struct MultiClient {
    name: String,
    dispatcher: Dispatcher,
    config: MultiClientConfig,
}

impl MultiClient {
    /// Validate `config` and register `providers` in order.
    pub fn new(
        providers: impl IntoIterator<Item = Arc<dyn BeaconProvider>>,
        config: MultiClientConfig,
    ) -> Result<Self, BuildError> {
        config.validate()?;
        let registry = Arc::new(ProviderRegistry::with_providers(providers)?);
        let tracker = HealthTracker::new(&config.health);
        Ok(Self {
            name: "multi".into(),
            dispatcher: Dispatcher::new(registry, tracker, config.dispatch.clone()),
            config,
        })
    }

    /// Name reported when this client is registered inside another pool.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn config(&self) -> &MultiClientConfig {
        &self.config
    }

    /// Register another provider; calls already in flight do not see it.
    pub fn add_provider(&self, provider: Arc<dyn BeaconProvider>) -> Result<ProviderId, RegistryError> {
        self.dispatcher.registry().add(provider)
    }

    /// Unregister a provider; calls already in flight keep using it.
    pub fn remove_provider(&self, id: &ProviderId) -> Option<Arc<dyn BeaconProvider>> {
        self.dispatcher.registry().remove(id)
    }

    /// Health of every provider in registration order.
    pub fn health_summary(&self) -> Vec<ProviderStatus> {
        self.dispatcher.registry().health_summary()
    }

    /// Probe every unhealthy provider once.
    pub async fn probe_unhealthy(&self) -> Vec<ProbeReport> {
        probe::probe_unhealthy(
            self.dispatcher.registry(),
            self.dispatcher.tracker(),
            self.config.dispatch.attempt_timeout,
        )
        .await
    }

    /// Probe every provider once, healthy or not, each bounded by the
    /// attempt timeout.
    pub async fn probe_all(&self) -> Vec<ProbeReport> {
        probe::probe_all(
            self.dispatcher.registry(),
            self.dispatcher.tracker(),
            self.config.dispatch.attempt_timeout,
        )
        .await
    }

    /// Start the background prober at the configured interval.
    pub fn spawn_prober(&self) -> HealthProber {
        HealthProber::spawn(
            Arc::clone(self.dispatcher.registry()),
            self.dispatcher.tracker().clone(),
            self.config.probe_interval,
        )
    }

    pub async fn attester_duties(&self, opts: &AttesterDutiesOpts) -> Reply<Vec<AttesterDuty>> {
        self.attester_duties_with(CallContext::new(Capability::AttesterDuties), opts)
            .await
    }

    /// [`attester_duties`](Self::attester_duties) under the caller's
    /// deadline, cancellation and policy.
    pub async fn attester_duties_with(
        &self,
        ctx: CallContext,
        opts: &AttesterDutiesOpts,
    ) -> Reply<Vec<AttesterDuty>> {
        let opts = opts.clone();
        self.call(ctx, Capability::AttesterDuties, move |p| {
            let opts = opts.clone();
            async move { p.attester_duties(&opts).await }
        })
        .await
    }

    pub async fn aggregate_attestation(&self, opts: &AggregateAttestationOpts) -> Reply<Attestation> {
        self.aggregate_attestation_with(CallContext::new(Capability::AggregateAttestation), opts)
            .await
    }

    pub async fn aggregate_attestation_with(
        &self,
        ctx: CallContext,
        opts: &AggregateAttestationOpts,
    ) -> Reply<Attestation> {
        let opts = opts.clone();
        self.call(ctx, Capability::AggregateAttestation, move |p| {
            let opts = opts.clone();
            async move { p.aggregate_attestation(&opts).await }
        })
        .await
    }

    pub async fn aggregate_attestation_v2(
        &self,
        opts: &AggregateAttestationOpts,
    ) -> Reply<VersionedAttestation> {
        self.aggregate_attestation_v2_with(CallContext::new(Capability::AggregateAttestation), opts)
            .await
    }

    pub async fn aggregate_attestation_v2_with(
        &self,
        ctx: CallContext,
        opts: &AggregateAttestationOpts,
    ) -> Reply<VersionedAttestation> {
        let opts = opts.clone();
        self.call(ctx, Capability::AggregateAttestation, move |p| {
            let opts = opts.clone();
            async move { p.aggregate_attestation_v2(&opts).await }
        })
        .await
    }

    pub async fn finality(&self, opts: &FinalityOpts) -> Reply<Finality> {
        self.finality_with(CallContext::new(Capability::Finality), opts).await
    }

    pub async fn finality_with(&self, ctx: CallContext, opts: &FinalityOpts) -> Reply<Finality> {
        let opts = opts.clone();
        self.call(ctx, Capability::Finality, move |p| {
            let opts = opts.clone();
            async move { p.finality(&opts).await }
        })
        .await
    }

    pub async fn voluntary_exit_pool(&self, opts: &VoluntaryExitPoolOpts) -> Reply<Vec<SignedVoluntaryExit>> {
        self.voluntary_exit_pool_with(CallContext::new(Capability::VoluntaryExitPool), opts)
            .await
    }

    pub async fn voluntary_exit_pool_with(
        &self,
        ctx: CallContext,
        opts: &VoluntaryExitPoolOpts,
    ) -> Reply<Vec<SignedVoluntaryExit>> {
        let opts = opts.clone();
        self.call(ctx, Capability::VoluntaryExitPool, move |p| {
            let opts = opts.clone();
            async move { p.voluntary_exit_pool(&opts).await }
        })
        .await
    }

    /// The operation decides the capability; whatever `ctx` names is replaced.
    async fn call<T, F, Fut>(&self, mut ctx: CallContext, capability: Capability, op: F) -> Reply<T>
    where
        T: PartialEq + Send + 'static,
        F: Fn(Arc<dyn BeaconProvider>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ApiResponse<T>, ProviderError>> + Send + 'static,
    {
        ctx.capability = capability;
        self.dispatcher
            .dispatch_by(
                ctx,
                move |provider, _| op(provider),
                |a: &ApiResponse<T>, b: &ApiResponse<T>| a.data == b.data,
            )
            .await
    }
}

/// Collapse an envelope into a single provider answer.
fn settle<T>(reply: Reply<T>) -> Result<ApiResponse<T>, ProviderError> {
    let envelope = reply.map_err(|e| match e {
        DispatchError::NoProviders { capability } => ProviderError::NotSupported { capability },
        DispatchError::DeadlineExceeded { ms } => ProviderError::Timeout { ms },
        other => ProviderError::Other(other.to_string()),
    })?;
    let candidates = envelope.candidates().len();
    envelope
        .into_value()
        .ok_or(ProviderError::Disagreement { candidates })
}

#[async_trait]
impl BeaconProvider for MultiClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> CapabilitySet {
        self.dispatcher.registry().capabilities()
    }

    /// Healthy while at least one inner provider is `Active`, after giving
    /// the unhealthy ones a chance to recover.
    async fn probe(&self) -> Result<(), ProviderError> {
        let any_active = |client: &Self| {
            client
                .dispatcher
                .registry()
                .snapshot()
                .iter()
                .any(|e| e.health().state() == HealthState::Active)
        };
        if any_active(self) {
            return Ok(());
        }
        MultiClient::probe_unhealthy(self).await;
        if any_active(self) {
            Ok(())
        } else {
            Err(ProviderError::Other("no active providers".into()))
        }
    }

    async fn attester_duties(
        &self,
        opts: &AttesterDutiesOpts,
    ) -> Result<ApiResponse<Vec<AttesterDuty>>, ProviderError> {
        settle(MultiClient::attester_duties(self, opts).await)
    }

    async fn aggregate_attestation(
        &self,
        opts: &AggregateAttestationOpts,
    ) -> Result<ApiResponse<Attestation>, ProviderError> {
        settle(MultiClient::aggregate_attestation(self, opts).await)
    }

    async fn aggregate_attestation_v2(
        &self,
        opts: &AggregateAttestationOpts,
    ) -> Result<ApiResponse<VersionedAttestation>, ProviderError> {
        settle(MultiClient::aggregate_attestation_v2(self, opts).await)
    }

    async fn finality(&self, opts: &FinalityOpts) -> Result<ApiResponse<Finality>, ProviderError> {
        settle(MultiClient::finality(self, opts).await)
    }

    async fn voluntary_exit_pool(
        &self,
        opts: &VoluntaryExitPoolOpts,
    ) -> Result<ApiResponse<Vec<SignedVoluntaryExit>>, ProviderError> {
        settle(MultiClient::voluntary_exit_pool(self, opts).await)
    }
}
