//! Call policies: which providers are asked, and how their answers reduce.
//!
//! ```text
//! Registry → [Selection] → Dispatcher fan-out → [AggregationPolicy] → Envelope
//! ```

pub mod aggregation;

use serde::{Deserialize, Serialize};

pub use aggregation::AggregationPolicy;

/// Which health states are eligible for a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selection {
    /// Only `Active` providers.
    #[default]
    ActiveOnly,
    /// `Active` and `Degraded` providers.
    AllowDegraded,
}
