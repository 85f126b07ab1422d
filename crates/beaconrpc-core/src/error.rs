//! Provider-level and dispatch-level error types.

use std::fmt;

use thiserror::Error;

use crate::capability::Capability;
use crate::provider::ProviderId;

/// Errors a single provider can return for a single operation.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// HTTP request failed (connection refused, reset, TLS, etc.).
    #[error("HTTP error: {0}")]
    Http(String),

    /// The node answered with a non-success status.
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    /// The operation did not finish within its attempt budget.
    #[error("Request timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// The response body could not be decoded into the expected type.
    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// The provider does not implement the requested operation.
    #[error("Operation {capability} not supported")]
    NotSupported { capability: Capability },

    /// A nested multi-provider client could not reduce its answers.
    #[error("Providers disagree ({candidates} distinct answers)")]
    Disagreement { candidates: usize },

    /// An unexpected error.
    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    /// Returns `true` if this error is transient and worth retrying on the
    /// same endpoint.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(_) | Self::Timeout { .. } => true,
            Self::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Returns `true` if the error should count toward health demotion.
    ///
    /// A missing capability says nothing about the endpoint's health.
    pub fn counts_against_health(&self) -> bool {
        !matches!(self, Self::NotSupported { .. })
    }

    /// Coarse classification used in combined error reports.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Http(_) => FailureKind::Transport,
            Self::Api { .. } => FailureKind::Api,
            Self::Timeout { .. } => FailureKind::Timeout,
            Self::Decode(_) => FailureKind::Decode,
            Self::NotSupported { .. } => FailureKind::NotSupported,
            Self::Disagreement { .. } => FailureKind::Disagreement,
            Self::Other(_) => FailureKind::Other,
        }
    }
}

/// Coarse classification of a provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transport,
    Api,
    Timeout,
    Decode,
    NotSupported,
    Disagreement,
    Other,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Transport => "transport",
            Self::Api => "api",
            Self::Timeout => "timeout",
            Self::Decode => "decode",
            Self::NotSupported => "not-supported",
            Self::Disagreement => "disagreement",
            Self::Other => "other",
        };
        f.write_str(s)
    }
}

/// One provider's failure, as recorded in a combined dispatch error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderFailure {
    pub provider: ProviderId,
    pub kind: FailureKind,
    pub message: String,
}

impl ProviderFailure {
    pub fn new(provider: ProviderId, error: &ProviderError) -> Self {
        Self {
            provider,
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

impl fmt::Display for ProviderFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.provider, self.kind, self.message)
    }
}

struct FailureList<'a>(&'a [ProviderFailure]);

impl fmt::Display for FailureList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{failure}")?;
        }
        Ok(())
    }
}

/// Errors returned by [`Dispatcher`](crate::dispatch::Dispatcher) calls.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No registered provider supports the capability at all.
    #[error("No providers support {capability}")]
    NoProviders { capability: Capability },

    /// Capable providers exist but every one is excluded by health.
    #[error("All {capable} providers for {capability} are unavailable")]
    AllProvidersDown { capability: Capability, capable: usize },

    /// The operation produced a value of a different type than the caller expected.
    #[error("Incorrect response type (expected {expected})")]
    IncorrectType { expected: &'static str },

    /// Every attempted provider failed.
    #[error("All providers failed: {}", FailureList(.failures))]
    AllProvidersFailed { failures: Vec<ProviderFailure> },

    /// `AllMustAgree` could not hear from every eligible provider.
    #[error("Not every provider answered: {}", FailureList(.failures))]
    Incomplete { failures: Vec<ProviderFailure> },

    /// The caller deadline elapsed before the policy was satisfied.
    #[error("Call deadline of {ms}ms exceeded")]
    DeadlineExceeded { ms: u64 },

    /// The caller cancelled the call.
    #[error("Call cancelled")]
    Cancelled,

    /// The aggregation policy cannot be satisfied by construction.
    #[error("Invalid aggregation policy: {0}")]
    InvalidPolicy(String),
}

impl DispatchError {
    /// Per-provider failures carried by this error, if any.
    pub fn failures(&self) -> &[ProviderFailure] {
        match self {
            Self::AllProvidersFailed { failures } | Self::Incomplete { failures } => failures,
            _ => &[],
        }
    }

    /// Returns `true` for errors that indicate a configuration or
    /// integration bug rather than an unhealthy ensemble.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::NoProviders { .. } | Self::IncorrectType { .. } | Self::InvalidPolicy(_)
        )
    }
}

/// Errors from mutating the provider registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Provider '{0}' is already registered")]
    Duplicate(ProviderId),
}
