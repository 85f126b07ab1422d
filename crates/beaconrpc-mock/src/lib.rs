//! beaconrpc-mock: in-memory beacon providers for testing.
//!
//! A [`MockProvider`] answers every operation from a closure or a fixture,
//! after an optional delay, and counts the calls it receives. It can be
//! marked down and back up at runtime to drive health transitions.
//!
//! # Quick start
//! ```rust,no_run
//! use beaconrpc_core::{BeaconProvider, MultiClient, MultiClientConfig};
//! use beaconrpc_mock::MockProvider;
//! use std::sync::Arc;
//!
//! let nodes: Vec<Arc<dyn BeaconProvider>> = vec![
//!     Arc::new(MockProvider::new("a").with_finalized_epoch(10)),
//!     Arc::new(MockProvider::new("b").with_finalized_epoch(10)),
//! ];
//! let client = MultiClient::new(nodes, MultiClientConfig::default()).unwrap();
//! ```

pub mod fixtures;
pub mod provider;

pub use provider::{CallCounts, MockProvider};
