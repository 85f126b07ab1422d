//! Reduction of per-provider outcomes to one envelope.
//!
//! [`Tally`] is fed outcomes one at a time, in completion order, and says
//! as soon as the policy is satisfied; [`aggregate`] runs the same reduction
//! over an already-collected set. Equality between answers is supplied by
//! the caller, so the reduction never looks inside the values.
//!
//! Under `FirstSuccess` the winner is whichever success arrives first. That
//! is inherently racy when used with live providers and is accepted as such.
//! The other policies only look at group sizes and the set of answers.

use std::time::Duration;

use crate::envelope::{Candidate, Envelope};
use crate::error::{DispatchError, ProviderError, ProviderFailure};
use crate::policy::AggregationPolicy;
use crate::provider::ProviderId;

/// The result of one provider attempt that ran to completion.
#[derive(Debug)]
pub enum Outcome<T> {
    Success {
        provider: ProviderId,
        value: T,
        latency: Duration,
    },
    Failure {
        provider: ProviderId,
        error: ProviderError,
        latency: Duration,
    },
}

impl<T> Outcome<T> {
    /// Provider the outcome came from.
    pub fn provider(&self) -> &ProviderId {
        match self {
            Self::Success { provider, .. } | Self::Failure { provider, .. } => provider,
        }
    }

    /// Time from attempt start to completion.
    pub fn latency(&self) -> Duration {
        match self {
            Self::Success { latency, .. } | Self::Failure { latency, .. } => *latency,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Incremental reducer for successful answers.
pub struct Tally<T, E> {
    policy: AggregationPolicy,
    eq: E,
    groups: Vec<Candidate<T>>,
    latencies: Vec<(ProviderId, Duration)>,
}

impl<T, E> Tally<T, E>
where
    E: Fn(&T, &T) -> bool,
{
    pub fn new(policy: AggregationPolicy, eq: E) -> Self {
        Self {
            policy,
            eq,
            groups: Vec::new(),
            latencies: Vec::new(),
        }
    }

    /// Number of successful answers seen so far.
    pub fn responded(&self) -> usize {
        self.latencies.len()
    }

    /// Add one successful answer. Returns the envelope once the policy is
    /// satisfied and no further answers are needed.
    pub fn offer(&mut self, provider: ProviderId, value: T, latency: Duration) -> Option<Envelope<T>> {
        self.latencies.push((provider.clone(), latency));
        match self.policy {
            AggregationPolicy::FirstSuccess => Some(Envelope::agreed(
                value,
                vec![provider],
                self.policy,
                std::mem::take(&mut self.latencies),
            )),
            AggregationPolicy::Majority { quorum } => {
                let idx = self.insert(provider, value);
                if self.groups[idx].providers.len() >= quorum {
                    let winner = self.groups.swap_remove(idx);
                    return Some(Envelope::agreed(
                        winner.value,
                        winner.providers,
                        self.policy,
                        std::mem::take(&mut self.latencies),
                    ));
                }
                None
            }
            AggregationPolicy::AllMustAgree => {
                self.insert(provider, value);
                None
            }
        }
    }

    /// Reduce once no more answers will arrive.
    pub fn finish(mut self, failures: Vec<ProviderFailure>) -> Result<Envelope<T>, DispatchError> {
        if self.groups.is_empty() {
            return Err(DispatchError::AllProvidersFailed { failures });
        }
        match self.policy {
            AggregationPolicy::FirstSuccess => {
                let first = self.groups.remove(0);
                Ok(Envelope::agreed(first.value, first.providers, self.policy, self.latencies))
            }
            AggregationPolicy::Majority { .. } => {
                Ok(Envelope::disagreement(self.groups, self.policy, self.latencies))
            }
            AggregationPolicy::AllMustAgree => {
                if !failures.is_empty() {
                    return Err(DispatchError::Incomplete { failures });
                }
                if self.groups.len() == 1 {
                    let only = self.groups.remove(0);
                    return Ok(Envelope::agreed(only.value, only.providers, self.policy, self.latencies));
                }
                Ok(Envelope::disagreement(self.groups, self.policy, self.latencies))
            }
        }
    }

    fn insert(&mut self, provider: ProviderId, value: T) -> usize {
        if let Some(idx) = self.groups.iter().position(|g| (self.eq)(&g.value, &value)) {
            self.groups[idx].providers.push(provider);
            return idx;
        }
        self.groups.push(Candidate {
            value,
            providers: vec![provider],
        });
        self.groups.len() - 1
    }
}

/// Reduce a complete set of outcomes under `policy`.
///
/// Outcomes are taken in the order given, which stands in for completion
/// order.
pub fn aggregate<T, E>(
    policy: AggregationPolicy,
    outcomes: impl IntoIterator<Item = Outcome<T>>,
    eq: E,
) -> Result<Envelope<T>, DispatchError>
where
    E: Fn(&T, &T) -> bool,
{
    policy.validate()?;
    let mut tally = Tally::new(policy, eq);
    let mut failures = Vec::new();
    for outcome in outcomes {
        match outcome {
            Outcome::Success { provider, value, latency } => {
                if let Some(envelope) = tally.offer(provider, value, latency) {
                    return Ok(envelope);
                }
            }
            Outcome::Failure { provider, error, .. } => {
                failures.push(ProviderFailure::new(provider, &error));
            }
        }
    }
    tally.finish(failures)
}
