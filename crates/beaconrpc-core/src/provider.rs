//! The `BeaconProvider` trait: one beacon-node endpoint and the operations
//! it declares.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Serialize, Serializer};

use crate::capability::{Capability, CapabilitySet};
use crate::error::ProviderError;
use crate::types::{
    AggregateAttestationOpts, ApiResponse, Attestation, AttesterDutiesOpts, AttesterDuty,
    Finality, FinalityOpts, SignedVoluntaryExit, VersionedAttestation, VoluntaryExitPoolOpts,
};

/// Stable identity of a provider (its endpoint name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProviderId(Arc<str>);

impl ProviderId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for ProviderId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl From<&str> for ProviderId {
    fn from(s: &str) -> Self {
        Self(Arc::from(s))
    }
}

impl From<String> for ProviderId {
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}

/// One beacon-node endpoint.
///
/// Providers declare what they support through [`capabilities`]; the
/// dispatcher consults that set before calling an operation and never learns
/// about a missing operation by calling it. The default operation bodies
/// return [`ProviderError::NotSupported`] so an implementation only writes
/// the operations it declares.
///
/// # Thread Safety
/// Implementations must be `Send + Sync` for use across Tokio tasks.
///
/// # Cancellation
/// Operation futures may be dropped at any await point when the dispatcher
/// no longer needs the answer.
///
/// [`capabilities`]: BeaconProvider::capabilities
#[async_trait]
pub trait BeaconProvider: Send + Sync + 'static {
    /// Stable endpoint name, unique within a registry.
    fn name(&self) -> &str;

    /// The operations this provider implements.
    fn capabilities(&self) -> CapabilitySet;

    /// Cheap liveness check used to bring unhealthy providers back.
    async fn probe(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn attester_duties(
        &self,
        _opts: &AttesterDutiesOpts,
    ) -> Result<ApiResponse<Vec<AttesterDuty>>, ProviderError> {
        Err(ProviderError::NotSupported {
            capability: Capability::AttesterDuties,
        })
    }

    async fn aggregate_attestation(
        &self,
        _opts: &AggregateAttestationOpts,
    ) -> Result<ApiResponse<Attestation>, ProviderError> {
        Err(ProviderError::NotSupported {
            capability: Capability::AggregateAttestation,
        })
    }

    async fn aggregate_attestation_v2(
        &self,
        _opts: &AggregateAttestationOpts,
    ) -> Result<ApiResponse<VersionedAttestation>, ProviderError> {
        Err(ProviderError::NotSupported {
            capability: Capability::AggregateAttestation,
        })
    }

    async fn finality(
        &self,
        _opts: &FinalityOpts,
    ) -> Result<ApiResponse<Finality>, ProviderError> {
        Err(ProviderError::NotSupported {
            capability: Capability::Finality,
        })
    }

    async fn voluntary_exit_pool(
        &self,
        _opts: &VoluntaryExitPoolOpts,
    ) -> Result<ApiResponse<Vec<SignedVoluntaryExit>>, ProviderError> {
        Err(ProviderError::NotSupported {
            capability: Capability::VoluntaryExitPool,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FinalityOnly;

    #[async_trait]
    impl BeaconProvider for FinalityOnly {
        fn name(&self) -> &str {
            "finality-only"
        }
        fn capabilities(&self) -> CapabilitySet {
            CapabilitySet::empty().with(Capability::Finality)
        }
    }

    #[tokio::test]
    async fn undeclared_operations_report_not_supported() {
        let p = FinalityOnly;
        let err = p.voluntary_exit_pool(&VoluntaryExitPoolOpts::default()).await.unwrap_err();
        assert!(matches!(
            err,
            ProviderError::NotSupported { capability: Capability::VoluntaryExitPool }
        ));
        assert!(p.probe().await.is_ok());
    }

    #[test]
    fn provider_id_display() {
        let id = ProviderId::from("lighthouse-1");
        assert_eq!(id.to_string(), "lighthouse-1");
        assert_eq!(id, ProviderId::from(String::from("lighthouse-1")));
    }
}
