//! beaconrpc-core: multi-provider dispatch for Ethereum beacon-node clients.
//!
//! # Overview
//!
//! Consensus-layer tooling usually talks to several beacon nodes at once, for
//! redundancy or to cross-check answers. This crate runs one logical request
//! against a set of providers and reduces their answers under a policy:
//!
//! - [`BeaconProvider`]: the async trait every endpoint implements, with an
//!   explicit [`CapabilitySet`]
//! - [`ProviderRegistry`]: the provider set, read through lock-free snapshots
//! - [`HealthTracker`]: `Active` / `Degraded` / `Inactive` per provider
//! - [`Dispatcher`]: bounded fan-out with deadlines and cancellation
//! - [`AggregationPolicy`] and [`aggregate`]: first success, majority, or
//!   unanimity
//! - [`Envelope`]: the agreed value (or the disagreement) plus provenance
//! - [`MultiClient`]: typed beacon operations on top of all of the above
//! - [`probe`] module: bringing unhealthy providers back

pub mod aggregate;
pub mod capability;
pub mod config;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod health;
pub mod multi;
pub mod policy;
pub mod probe;
pub mod provider;
pub mod registry;
pub mod types;

pub use aggregate::{aggregate, Outcome, Tally};
pub use capability::{Capability, CapabilitySet};
pub use config::{ConfigError, DispatchConfig, HealthConfig, MultiClientConfig};
pub use dispatch::{AttemptContext, CallContext, Dispatcher, ErasedValue};
pub use envelope::{Candidate, Envelope, ResponseMetadata};
pub use error::{DispatchError, FailureKind, ProviderError, ProviderFailure, RegistryError};
pub use health::{HealthCell, HealthSnapshot, HealthState, HealthTracker};
pub use multi::{BuildError, MultiClient};
pub use policy::{AggregationPolicy, Selection};
pub use probe::{HealthProber, ProbeReport, MIN_PROBE_INTERVAL};
pub use provider::{BeaconProvider, ProviderId};
pub use registry::{ProviderEntry, ProviderRegistry, ProviderStatus};
