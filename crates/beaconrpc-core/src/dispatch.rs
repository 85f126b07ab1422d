//! Fan-out/fan-in call dispatcher.
//!
//! ```text
//!                 ┌─ attempt(p1) ─┐
//! eligible(cap) ──┼─ attempt(p2) ─┼──► Tally ──► Envelope
//!                 └─ attempt(p3) ─┘
//! ```
//!
//! Each attempt is a Tokio task that runs the operation against one
//! provider under its own timeout and reports the outcome to the health
//! tracker before handing it back. The dispatcher feeds completions into a
//! [`Tally`] and stops as soon as the policy is satisfied; everything still
//! in flight is cancelled and never touches health.

use std::any::{type_name, Any};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::aggregate::{Outcome, Tally};
use crate::capability::Capability;
use crate::config::DispatchConfig;
use crate::envelope::Envelope;
use crate::error::{DispatchError, ProviderError, ProviderFailure};
use crate::health::HealthTracker;
use crate::policy::{AggregationPolicy, Selection};
use crate::provider::{BeaconProvider, ProviderId};
use crate::registry::{ProviderEntry, ProviderRegistry};

/// Stand-in deadline for call timeouts too large to add to the clock.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// A type-erased operation result, for [`Dispatcher::dispatch_erased`].
pub type ErasedValue = Box<dyn Any + Send>;

/// Per-call parameters.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Operation every attempted provider must support.
    pub capability: Capability,
    /// Bound on the whole call; the dispatcher default when `None`.
    pub timeout: Option<Duration>,
    pub policy: Option<AggregationPolicy>,
    pub selection: Option<Selection>,
    /// Cancelling this token aborts the call.
    pub cancel: CancellationToken,
}

impl CallContext {
    /// Context for `capability` with every other setting left to the dispatcher.
    pub fn new(capability: Capability) -> Self {
        Self {
            capability,
            timeout: None,
            policy: None,
            selection: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Bound the whole call; `Duration::MAX` means no practical bound.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Override the default aggregation policy for this call.
    pub fn with_policy(mut self, policy: AggregationPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Override which health states are eligible for this call.
    pub fn with_selection(mut self, selection: Selection) -> Self {
        self.selection = Some(selection);
        self
    }

    /// Abort the call when `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// What an operation sees about the attempt it is running in.
#[derive(Debug, Clone)]
pub struct AttemptContext {
    pub provider: ProviderId,
    /// When this attempt will be abandoned.
    pub deadline: Instant,
    /// Cancelled when the dispatcher no longer needs this attempt.
    pub cancel: CancellationToken,
}

enum Attempt<V> {
    Completed(Outcome<V>),
    /// Stopped by the dispatcher or the caller deadline; not a provider fault.
    Cancelled(ProviderId),
}

/// Runs one operation against the eligible providers of a registry.
pub struct Dispatcher {
    registry: Arc<ProviderRegistry>,
    tracker: HealthTracker,
    config: DispatchConfig,
}

impl Dispatcher {
    /// Create a dispatcher over `registry`, reporting outcomes to `tracker`.
    pub fn new(registry: Arc<ProviderRegistry>, tracker: HealthTracker, config: DispatchConfig) -> Self {
        Self {
            registry,
            tracker,
            config,
        }
    }

    /// The provider set calls are dispatched to.
    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// The tracker every attempt outcome is recorded through.
    pub fn tracker(&self) -> &HealthTracker {
        &self.tracker
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Dispatch `op` and compare answers with `PartialEq`.
    pub async fn dispatch<T, F, Fut>(&self, ctx: CallContext, op: F) -> Result<Envelope<T>, DispatchError>
    where
        T: PartialEq + Send + 'static,
        F: Fn(Arc<dyn BeaconProvider>, AttemptContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ProviderError>> + Send + 'static,
    {
        self.dispatch_by(ctx, op, |a: &T, b: &T| a == b).await
    }

    /// Dispatch `op` and compare answers with `eq`.
    pub async fn dispatch_by<T, F, Fut, E>(
        &self,
        ctx: CallContext,
        op: F,
        eq: E,
    ) -> Result<Envelope<T>, DispatchError>
    where
        T: Send + 'static,
        F: Fn(Arc<dyn BeaconProvider>, AttemptContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ProviderError>> + Send + 'static,
        E: Fn(&T, &T) -> bool + Send,
    {
        self.run(ctx, op, Ok, eq).await
    }

    /// Dispatch an operation whose result type is only known at runtime.
    ///
    /// Every successful answer must downcast to `T`; the first one that
    /// does not fails the whole call with [`DispatchError::IncorrectType`].
    /// That is an integration bug, not a provider fault, so provider health
    /// is not demoted for it.
    pub async fn dispatch_erased<T, F, Fut, E>(
        &self,
        ctx: CallContext,
        op: F,
        eq: E,
    ) -> Result<Envelope<T>, DispatchError>
    where
        T: Send + 'static,
        F: Fn(Arc<dyn BeaconProvider>, AttemptContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ErasedValue, ProviderError>> + Send + 'static,
        E: Fn(&T, &T) -> bool + Send,
    {
        let convert = |value: ErasedValue| {
            value.downcast::<T>().map(|v| *v).map_err(|_| {
                tracing::error!(expected = type_name::<T>(), "operation returned an unexpected type");
                DispatchError::IncorrectType {
                    expected: type_name::<T>(),
                }
            })
        };
        self.run(ctx, op, convert, eq).await
    }

    async fn run<V, T, F, Fut, C, E>(
        &self,
        ctx: CallContext,
        op: F,
        convert: C,
        eq: E,
    ) -> Result<Envelope<T>, DispatchError>
    where
        V: Send + 'static,
        T: Send + 'static,
        F: Fn(Arc<dyn BeaconProvider>, AttemptContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, ProviderError>> + Send + 'static,
        C: Fn(V) -> Result<T, DispatchError> + Send,
        E: Fn(&T, &T) -> bool + Send,
    {
        let policy = ctx.policy.unwrap_or(self.config.default_policy);
        policy.validate()?;
        if ctx.cancel.is_cancelled() {
            return Err(DispatchError::Cancelled);
        }

        let selection = ctx.selection.unwrap_or(self.config.selection);
        let providers = self.registry.eligible(ctx.capability, selection)?;
        let call_timeout = ctx.timeout.unwrap_or(self.config.call_timeout);
        let started = Instant::now();
        let deadline = started
            .checked_add(call_timeout)
            .unwrap_or_else(|| started + FAR_FUTURE);

        tracing::debug!(
            capability = %ctx.capability,
            policy = %policy,
            providers = providers.len(),
            timeout_ms = call_timeout.as_millis() as u64,
            "dispatching"
        );

        // Cancels every attempt on any exit path.
        let attempts_cancel = ctx.cancel.child_token();
        let _cancel_on_exit = attempts_cancel.clone().drop_guard();

        let op = Arc::new(op);
        let mut queue = providers.into_iter();
        let mut in_flight = JoinSet::new();
        for entry in queue.by_ref().take(self.config.max_parallelism.max(1)) {
            self.spawn_attempt(&mut in_flight, entry, &op, &attempts_cancel, deadline);
        }

        let mut tally = Tally::new(policy, eq);
        let mut failures = Vec::new();
        loop {
            let joined = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => {
                    tracing::debug!(capability = %ctx.capability, "call cancelled by caller");
                    return Err(DispatchError::Cancelled);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::warn!(
                        capability = %ctx.capability,
                        responded = tally.responded(),
                        failed = failures.len(),
                        "call deadline exceeded"
                    );
                    return Err(DispatchError::DeadlineExceeded {
                        ms: call_timeout.as_millis() as u64,
                    });
                }
                joined = in_flight.join_next() => joined,
            };
            let Some(joined) = joined else { break };

            match joined {
                Ok(Attempt::Completed(Outcome::Success { provider, value, latency })) => {
                    let value = convert(value)?;
                    if let Some(envelope) = tally.offer(provider, value, latency) {
                        return Ok(envelope);
                    }
                }
                Ok(Attempt::Completed(Outcome::Failure { provider, error, .. })) => {
                    failures.push(ProviderFailure::new(provider, &error));
                    if policy == AggregationPolicy::AllMustAgree {
                        return Err(DispatchError::Incomplete { failures });
                    }
                }
                Ok(Attempt::Cancelled(provider)) => {
                    tracing::debug!(provider = %provider, "attempt abandoned at call deadline");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "attempt task ended abnormally");
                }
            }

            if let Some(entry) = queue.next() {
                self.spawn_attempt(&mut in_flight, entry, &op, &attempts_cancel, deadline);
            }
        }

        tally.finish(failures)
    }

    fn spawn_attempt<V, F, Fut>(
        &self,
        set: &mut JoinSet<Attempt<V>>,
        entry: Arc<ProviderEntry>,
        op: &Arc<F>,
        cancel: &CancellationToken,
        deadline: Instant,
    ) where
        V: Send + 'static,
        F: Fn(Arc<dyn BeaconProvider>, AttemptContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, ProviderError>> + Send + 'static,
    {
        let now = Instant::now();
        let remaining = deadline.saturating_duration_since(now);
        let budget = remaining.min(self.config.attempt_timeout);
        let clipped = remaining < self.config.attempt_timeout;
        let ctx = AttemptContext {
            provider: entry.id().clone(),
            deadline: now + budget,
            cancel: cancel.child_token(),
        };
        set.spawn(run_attempt(
            entry,
            Arc::clone(op),
            ctx,
            budget,
            clipped,
            self.tracker.clone(),
        ));
    }
}

async fn run_attempt<V, F, Fut>(
    entry: Arc<ProviderEntry>,
    op: Arc<F>,
    ctx: AttemptContext,
    budget: Duration,
    clipped: bool,
    tracker: HealthTracker,
) -> Attempt<V>
where
    F: Fn(Arc<dyn BeaconProvider>, AttemptContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<V, ProviderError>> + Send + 'static,
{
    let provider = entry.id().clone();
    let cancel = ctx.cancel.clone();
    let handle = Arc::clone(entry.provider());
    let started = Instant::now();
    let call = AssertUnwindSafe(async move { op(handle, ctx).await }).catch_unwind();

    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Attempt::Cancelled(provider),
        r = tokio::time::timeout(budget, call) => r,
    };
    let latency = started.elapsed();

    let result = match result {
        Ok(Ok(result)) => result,
        Ok(Err(_panic)) => Err(ProviderError::Other("operation panicked".into())),
        Err(_elapsed) if clipped => return Attempt::Cancelled(provider),
        Err(_elapsed) => Err(ProviderError::Timeout {
            ms: budget.as_millis() as u64,
        }),
    };

    match result {
        Ok(value) => {
            tracker.record_success(&provider, entry.health());
            tracing::debug!(
                provider = %provider,
                latency_ms = latency.as_millis() as u64,
                "attempt succeeded"
            );
            Attempt::Completed(Outcome::Success {
                provider,
                value,
                latency,
            })
        }
        Err(error) => {
            tracker.record_failure(&provider, entry.health(), &error);
            tracing::debug!(
                provider = %provider,
                latency_ms = latency.as_millis() as u64,
                error = %error,
                "attempt failed"
            );
            Attempt::Completed(Outcome::Failure {
                provider,
                error,
                latency,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapabilitySet;
    use crate::config::HealthConfig;
    use crate::health::HealthState;
    use crate::types::{ApiResponse, Checkpoint, Epoch, Finality, FinalityOpts, Root};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Answers finality with a fixed epoch after a delay, or fails.
    struct Node {
        name: &'static str,
        delay: Duration,
        epoch: Option<u64>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl BeaconProvider for Node {
        fn name(&self) -> &str {
            self.name
        }
        fn capabilities(&self) -> CapabilitySet {
            CapabilitySet::empty().with(Capability::Finality)
        }
        async fn finality(&self, _opts: &FinalityOpts) -> Result<ApiResponse<Finality>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            let epoch = self.epoch.ok_or_else(|| ProviderError::Http("unreachable".into()))?;
            let cp = Checkpoint { epoch: Epoch(epoch), root: Root::from("0x00") };
            Ok(ApiResponse::new(Finality {
                previous_justified: cp.clone(),
                current_justified: cp.clone(),
                finalized: cp,
            }))
        }
    }

    fn node(name: &'static str, delay_ms: u64, epoch: Option<u64>) -> Arc<Node> {
        Arc::new(Node {
            name,
            delay: Duration::from_millis(delay_ms),
            epoch,
            calls: AtomicU32::new(0),
        })
    }

    fn dispatcher(nodes: &[Arc<Node>], config: DispatchConfig) -> Dispatcher {
        let registry = ProviderRegistry::with_providers(
            nodes.iter().map(|n| n.clone() as Arc<dyn BeaconProvider>),
        )
        .unwrap();
        Dispatcher::new(
            Arc::new(registry),
            HealthTracker::new(&HealthConfig { degraded_after: 1, inactive_after: None }),
            config,
        )
    }

    async fn finalized_epoch(
        d: &Dispatcher,
        ctx: CallContext,
    ) -> Result<Envelope<u64>, DispatchError> {
        d.dispatch(ctx, |p, _| async move {
            Ok(p.finality(&FinalityOpts::default()).await?.data.finalized.epoch.0)
        })
        .await
    }

    fn state(d: &Dispatcher, name: &str) -> HealthState {
        d.registry().get(&ProviderId::from(name)).unwrap().health().state()
    }

    #[tokio::test]
    async fn first_success_ignores_failures() {
        let d = dispatcher(
            &[node("a", 0, None), node("b", 20, Some(5))],
            DispatchConfig::default(),
        );
        let env = finalized_epoch(&d, CallContext::new(Capability::Finality)).await.unwrap();
        assert_eq!(env.value(), Some(&5));
        assert_eq!(env.providers(), &[ProviderId::from("b")]);
        assert_eq!(state(&d, "a"), HealthState::Degraded);
    }

    #[tokio::test]
    async fn all_failed_is_combined_error() {
        let d = dispatcher(&[node("a", 0, None), node("b", 0, None)], DispatchConfig::default());
        let err = finalized_epoch(&d, CallContext::new(Capability::Finality)).await.unwrap_err();
        assert!(matches!(err, DispatchError::AllProvidersFailed { .. }));
        assert_eq!(err.failures().len(), 2);
    }

    #[tokio::test]
    async fn max_parallelism_queues_in_order() {
        let nodes = [node("a", 30, None), node("b", 0, Some(1)), node("c", 0, Some(2))];
        let config = DispatchConfig { max_parallelism: 1, ..DispatchConfig::default() };
        let d = dispatcher(&nodes, config);
        let env = finalized_epoch(&d, CallContext::new(Capability::Finality)).await.unwrap();
        // "b" only starts after "a" has failed; "c" is never reached.
        assert_eq!(env.value(), Some(&1));
        assert_eq!(nodes[2].calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn attempt_timeout_counts_against_health() {
        let config = DispatchConfig {
            attempt_timeout: Duration::from_millis(20),
            ..DispatchConfig::default()
        };
        let d = dispatcher(&[node("slow", 500, Some(1))], config);
        let err = finalized_epoch(&d, CallContext::new(Capability::Finality)).await.unwrap_err();
        assert_eq!(err.failures()[0].kind, crate::error::FailureKind::Timeout);
        assert_eq!(state(&d, "slow"), HealthState::Degraded);
    }

    #[tokio::test]
    async fn call_deadline_does_not_demote() {
        let d = dispatcher(&[node("slow", 500, Some(1))], DispatchConfig::default());
        let ctx = CallContext::new(Capability::Finality).with_timeout(Duration::from_millis(20));
        let err = finalized_epoch(&d, ctx).await.unwrap_err();
        assert!(matches!(err, DispatchError::DeadlineExceeded { ms: 20 }));
        assert_eq!(state(&d, "slow"), HealthState::Active);
    }

    #[tokio::test]
    async fn unbounded_call_timeout_still_dispatches() {
        let d = dispatcher(&[node("a", 0, Some(4))], DispatchConfig::default());
        let ctx = CallContext::new(Capability::Finality).with_timeout(Duration::MAX);
        let env = tokio::spawn(async move { finalized_epoch(&d, ctx).await })
            .await
            .expect("dispatch task panicked")
            .unwrap();
        assert_eq!(env.value(), Some(&4));
    }

    #[tokio::test]
    async fn incorrect_type_is_fatal_and_not_a_health_fault() {
        let d = dispatcher(&[node("a", 0, Some(1))], DispatchConfig::default());
        let err = d
            .dispatch_erased::<u64, _, _, _>(
                CallContext::new(Capability::Finality),
                |p, _| async move {
                    let resp = p.finality(&FinalityOpts::default()).await?;
                    Ok(Box::new(resp.data) as ErasedValue)
                },
                |a, b| a == b,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::IncorrectType { .. }));
        assert!(err.is_fatal());
        let snap = d.registry().snapshot()[0].health().snapshot();
        assert_eq!(snap.state, HealthState::Active);
        assert_eq!(snap.consecutive_errors, 0);
    }

    #[tokio::test]
    async fn erased_dispatch_downcasts() {
        let d = dispatcher(&[node("a", 0, Some(9))], DispatchConfig::default());
        let env = d
            .dispatch_erased::<Finality, _, _, _>(
                CallContext::new(Capability::Finality),
                |p, _| async move {
                    let resp = p.finality(&FinalityOpts::default()).await?;
                    Ok(Box::new(resp.data) as ErasedValue)
                },
                |a, b| a == b,
            )
            .await
            .unwrap();
        assert_eq!(env.value().unwrap().finalized.epoch, Epoch(9));
    }

    #[tokio::test]
    async fn zero_quorum_rejected_before_any_call() {
        let nodes = [node("a", 0, Some(1))];
        let d = dispatcher(&nodes, DispatchConfig::default());
        let ctx = CallContext::new(Capability::Finality).with_policy(AggregationPolicy::majority(0));
        let err = finalized_epoch(&d, ctx).await.unwrap_err();
        assert!(matches!(err, DispatchError::InvalidPolicy(_)));
        assert_eq!(nodes[0].calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn panicking_operation_is_a_provider_failure() {
        let d = dispatcher(&[node("a", 0, Some(1))], DispatchConfig::default());
        let err = d
            .dispatch(CallContext::new(Capability::Finality), |_p, _| async move {
                if true {
                    panic!("bad operation");
                }
                Ok(0u64)
            })
            .await
            .unwrap_err();
        assert_eq!(err.failures()[0].kind, crate::error::FailureKind::Other);
    }
}
