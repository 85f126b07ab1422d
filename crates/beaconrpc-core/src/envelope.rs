//! The response envelope handed back to callers.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::policy::AggregationPolicy;
use crate::provider::ProviderId;

/// One distinct answer and the providers that gave it, in completion order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate<T> {
    pub value: T,
    pub providers: Vec<ProviderId>,
}

/// Provenance of an [`Envelope`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseMetadata {
    /// Providers that contributed the value, or every provider that answered
    /// when the answers disagree.
    pub providers: Vec<ProviderId>,
    pub fetched_at: DateTime<Utc>,
    pub policy: AggregationPolicy,
    pub disagreement: bool,
    /// Latency of each successful attempt that was heard, in completion order.
    #[serde(skip)]
    pub latencies: Vec<(ProviderId, Duration)>,
}

/// Result of a multi-provider call: either an agreed value or a reported
/// disagreement, plus where it came from. Read-only once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope<T> {
    value: Option<T>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    candidates: Vec<Candidate<T>>,
    metadata: ResponseMetadata,
}

impl<T> Envelope<T> {
    pub(crate) fn agreed(
        value: T,
        providers: Vec<ProviderId>,
        policy: AggregationPolicy,
        latencies: Vec<(ProviderId, Duration)>,
    ) -> Self {
        Self {
            value: Some(value),
            candidates: Vec::new(),
            metadata: ResponseMetadata {
                providers,
                fetched_at: Utc::now(),
                policy,
                disagreement: false,
                latencies,
            },
        }
    }

    pub(crate) fn disagreement(
        candidates: Vec<Candidate<T>>,
        policy: AggregationPolicy,
        latencies: Vec<(ProviderId, Duration)>,
    ) -> Self {
        let providers = candidates
            .iter()
            .flat_map(|c| c.providers.iter().cloned())
            .collect();
        Self {
            value: None,
            candidates,
            metadata: ResponseMetadata {
                providers,
                fetched_at: Utc::now(),
                policy,
                disagreement: true,
                latencies,
            },
        }
    }

    /// The agreed value, `None` on disagreement.
    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    /// Consume the envelope, returning the agreed value if there is one.
    pub fn into_value(self) -> Option<T> {
        self.value
    }

    /// `true` when no answer reached the policy's agreement.
    pub fn is_disagreement(&self) -> bool {
        self.metadata.disagreement
    }

    /// Distinct answers when the providers disagree; empty otherwise.
    pub fn candidates(&self) -> &[Candidate<T>] {
        &self.candidates
    }

    pub fn metadata(&self) -> &ResponseMetadata {
        &self.metadata
    }

    /// Shorthand for `metadata().providers`.
    pub fn providers(&self) -> &[ProviderId] {
        &self.metadata.providers
    }

    /// Map the carried value(s), keeping provenance.
    pub fn map<U>(self, mut f: impl FnMut(T) -> U) -> Envelope<U> {
        Envelope {
            value: self.value.map(&mut f),
            candidates: self
                .candidates
                .into_iter()
                .map(|c| Candidate {
                    value: f(c.value),
                    providers: c.providers,
                })
                .collect(),
            metadata: self.metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<ProviderId> {
        names.iter().map(|n| ProviderId::from(*n)).collect()
    }

    #[test]
    fn agreed_envelope() {
        let env = Envelope::agreed(7u64, ids(&["a"]), AggregationPolicy::FirstSuccess, vec![]);
        assert_eq!(env.value(), Some(&7));
        assert!(!env.is_disagreement());
        assert!(env.candidates().is_empty());
        assert_eq!(env.providers(), ids(&["a"]).as_slice());
    }

    #[test]
    fn disagreement_lists_every_responder() {
        let env = Envelope::disagreement(
            vec![
                Candidate { value: 1u64, providers: ids(&["a", "c"]) },
                Candidate { value: 2u64, providers: ids(&["b"]) },
            ],
            AggregationPolicy::majority(3),
            vec![],
        );
        assert!(env.value().is_none());
        assert!(env.is_disagreement());
        assert_eq!(env.providers(), ids(&["a", "c", "b"]).as_slice());

        let mapped = env.map(|v| v * 10);
        assert_eq!(mapped.candidates()[1].value, 20);
        assert!(mapped.metadata().disagreement);
    }

    #[test]
    fn serializes_metadata() {
        let env = Envelope::agreed("x", ids(&["a"]), AggregationPolicy::AllMustAgree, vec![]);
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["value"], "x");
        assert_eq!(json["metadata"]["providers"][0], "a");
        assert_eq!(json["metadata"]["disagreement"], false);
    }
}
