//! Beacon REST API provider backed by `reqwest`.
//!
//! Features:
//! - Automatic retry with exponential backoff for transient errors
//!   (transport failures, timeouts, 429 and 5xx)
//! - Response metadata (`execution_optimistic`, `finalized`, `dependent_root`,
//!   ...) preserved next to the decoded `data`
//! - Node-health probe for recovery of unhealthy providers

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::{serde_as, DurationMilliSeconds};

use beaconrpc_core::capability::{Capability, CapabilitySet};
use beaconrpc_core::error::ProviderError;
use beaconrpc_core::provider::BeaconProvider;
use beaconrpc_core::types::{
    AggregateAttestationOpts, ApiResponse, Attestation, AttesterDutiesOpts, AttesterDuty,
    DataVersion, Finality, FinalityOpts, SignedVoluntaryExit, VersionedAttestation,
    VoluntaryExitPoolOpts,
};

use crate::retry::RetryConfig;

/// Configuration for `HttpBeaconProvider`.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct HttpProviderConfig {
    pub retry: RetryConfig,
    /// Bound on one HTTP exchange, retries excluded.
    #[serde(rename = "request_timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub request_timeout: Duration,
}

impl Default for HttpProviderConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// One beacon node reached over HTTP.
pub struct HttpBeaconProvider {
    name: String,
    base_url: String,
    http: reqwest::Client,
    retry: RetryConfig,
    request_timeout: Duration,
    capabilities: CapabilitySet,
}

impl HttpBeaconProvider {
    /// Create a provider for the node at `base_url`, named after the URL and
    /// declaring every capability.
    pub fn new(base_url: impl Into<String>, config: HttpProviderConfig) -> Result<Self, ProviderError> {
        config.retry.validate()?;
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ProviderError::Http(e.to_string()))?;
        let base_url = base_url.into().trim_end_matches('/').to_string();

        Ok(Self {
            name: base_url.clone(),
            base_url,
            http,
            retry: config.retry,
            request_timeout: config.request_timeout,
            capabilities: CapabilitySet::all(),
        })
    }

    /// Create with default configuration.
    pub fn default_for(base_url: impl Into<String>) -> Result<Self, ProviderError> {
        Self::new(base_url, HttpProviderConfig::default())
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Restrict the declared operations, e.g. for a node without the
    /// validator API enabled.
    pub fn with_capabilities(mut self, capabilities: CapabilitySet) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn require(&self, capability: Capability) -> Result<(), ProviderError> {
        if self.capabilities.supports(capability) {
            Ok(())
        } else {
            Err(ProviderError::NotSupported { capability })
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<ApiResponse<T>, ProviderError> {
        let url = format!("{}{}", self.base_url, path);
        self.with_retry(path, || self.http.get(&url)).await
    }

    async fn post<T, B>(&self, path: &str, body: &B) -> Result<ApiResponse<T>, ProviderError>
    where
        T: DeserializeOwned,
        B: Serialize + Sync + ?Sized,
    {
        let url = format!("{}{}", self.base_url, path);
        self.with_retry(path, || self.http.post(&url).json(body)).await
    }

    async fn with_retry<T, R>(&self, path: &str, request: R) -> Result<ApiResponse<T>, ProviderError>
    where
        T: DeserializeOwned,
        R: Fn() -> reqwest::RequestBuilder,
    {
        let mut retry = 0u32;
        loop {
            match self.send_once(request()).await {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_retryable() => {
                    retry += 1;
                    match self.retry.backoff(retry) {
                        Some(delay) => {
                            tracing::warn!(
                                retry,
                                delay_ms = delay.as_millis() as u64,
                                error = %e,
                                provider = %self.name,
                                path,
                                "retrying request"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            tracing::debug!(
                                retry,
                                error = %e,
                                provider = %self.name,
                                path,
                                "retries exhausted"
                            );
                            return Err(e);
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_once<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<ApiResponse<T>, ProviderError> {
        let resp = request.send().await.map_err(|e| self.transport_error(e))?;
        let status = resp.status();
        let body = resp.bytes().await.map_err(|e| self.transport_error(e))?;
        if !status.is_success() {
            return Err(api_error(status.as_u16(), &body));
        }
        decode_response(&body)
    }

    fn transport_error(&self, e: reqwest::Error) -> ProviderError {
        if e.is_timeout() {
            ProviderError::Timeout {
                ms: self.request_timeout.as_millis() as u64,
            }
        } else {
            ProviderError::Http(e.to_string())
        }
    }
}

/// Error body of the beacon API: `{"code": 404, "message": "..."}`.
#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

fn api_error(status: u16, body: &[u8]) -> ProviderError {
    let message = serde_json::from_slice::<ErrorBody>(body)
        .map(|b| b.message)
        .unwrap_or_else(|_| String::from_utf8_lossy(body).into_owned());
    ProviderError::Api { status, message }
}

/// Split a `{"data": ..., ...}` body into the payload and the remaining
/// top-level fields.
pub(crate) fn decode_response<T: DeserializeOwned>(body: &[u8]) -> Result<ApiResponse<T>, ProviderError> {
    let mut fields: serde_json::Map<String, Value> = serde_json::from_slice(body)?;
    let data = fields.remove("data").unwrap_or(Value::Null);
    Ok(ApiResponse {
        data: serde_json::from_value(data)?,
        metadata: fields.into_iter().collect(),
    })
}

fn state_id(state: &str) -> Result<&str, ProviderError> {
    if state.is_empty() {
        return Err(ProviderError::Other("no state specified".into()));
    }
    Ok(state)
}

#[async_trait]
impl BeaconProvider for HttpBeaconProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> CapabilitySet {
        self.capabilities
    }

    /// `200` means ready; `206` (syncing) and anything else count as down.
    async fn probe(&self) -> Result<(), ProviderError> {
        let url = format!("{}/eth/v1/node/health", self.base_url);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        match resp.status().as_u16() {
            200 => Ok(()),
            206 => Err(ProviderError::Api {
                status: 206,
                message: "node is syncing".into(),
            }),
            status => Err(ProviderError::Api {
                status,
                message: resp.text().await.unwrap_or_default(),
            }),
        }
    }

    async fn attester_duties(
        &self,
        opts: &AttesterDutiesOpts,
    ) -> Result<ApiResponse<Vec<AttesterDuty>>, ProviderError> {
        self.require(Capability::AttesterDuties)?;
        let path = format!("/eth/v1/validator/duties/attester/{}", opts.epoch);
        self.post(&path, opts.indices.as_slice()).await
    }

    async fn aggregate_attestation(
        &self,
        opts: &AggregateAttestationOpts,
    ) -> Result<ApiResponse<Attestation>, ProviderError> {
        self.require(Capability::AggregateAttestation)?;
        let path = format!(
            "/eth/v1/validator/aggregate_attestation?attestation_data_root={}&slot={}",
            opts.attestation_data_root, opts.slot
        );
        self.get(&path).await
    }

    async fn aggregate_attestation_v2(
        &self,
        opts: &AggregateAttestationOpts,
    ) -> Result<ApiResponse<VersionedAttestation>, ProviderError> {
        self.require(Capability::AggregateAttestation)?;
        let committee_index = opts.committee_index.ok_or_else(|| {
            ProviderError::Other("committee index is required for the v2 endpoint".into())
        })?;
        let path = format!(
            "/eth/v2/validator/aggregate_attestation?attestation_data_root={}&slot={}&committee_index={}",
            opts.attestation_data_root, opts.slot, committee_index
        );
        let mut resp: ApiResponse<Attestation> = self.get(&path).await?;
        let version = resp
            .metadata
            .remove("version")
            .ok_or_else(|| ProviderError::Other("response carries no consensus version".into()))?;
        let version: DataVersion = serde_json::from_value(version)?;
        Ok(resp.map(|attestation| VersionedAttestation { version, attestation }))
    }

    async fn finality(&self, opts: &FinalityOpts) -> Result<ApiResponse<Finality>, ProviderError> {
        self.require(Capability::Finality)?;
        let path = format!(
            "/eth/v1/beacon/states/{}/finality_checkpoints",
            state_id(&opts.state)?
        );
        self.get(&path).await
    }

    async fn voluntary_exit_pool(
        &self,
        _opts: &VoluntaryExitPoolOpts,
    ) -> Result<ApiResponse<Vec<SignedVoluntaryExit>>, ProviderError> {
        self.require(Capability::VoluntaryExitPool)?;
        self.get("/eth/v1/beacon/pool/voluntary_exits").await
    }
}
