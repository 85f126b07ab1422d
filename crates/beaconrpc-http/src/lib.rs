//! beaconrpc-http: beacon REST API provider for beaconrpc.
//!
//! [`HttpBeaconProvider`] implements
//! [`BeaconProvider`](beaconrpc_core::BeaconProvider) over `reqwest`, with
//! per-provider retry and backoff configured through [`HttpProviderConfig`].

pub mod client;
pub mod retry;

pub use client::{HttpBeaconProvider, HttpProviderConfig};
pub use retry::RetryConfig;
