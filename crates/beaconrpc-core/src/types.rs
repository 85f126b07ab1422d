//! Beacon-API domain types and operation options.
//!
//! Integers are carried as quoted decimal strings on the wire, matching the
//! beacon node REST conventions.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::{serde_as, DisplayFromStr};

macro_rules! quoted_u64 {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[serde_as]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
        pub struct $name(#[serde_as(as = "DisplayFromStr")] pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(v: u64) -> Self {
                Self(v)
            }
        }
    };
}

quoted_u64!(
    /// Consensus epoch number.
    Epoch
);
quoted_u64!(
    /// Consensus slot number.
    Slot
);
quoted_u64!(
    /// Index of a validator in the beacon state registry.
    ValidatorIndex
);
quoted_u64!(
    /// Committee index within a slot.
    CommitteeIndex
);

/// A 32-byte root, 0x-prefixed hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Root(pub String);

impl fmt::Display for Root {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Root {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checkpoint {
    pub epoch: Epoch,
    pub root: Root,
}

/// Finality checkpoints of a beacon state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Finality {
    pub previous_justified: Checkpoint,
    pub current_justified: Checkpoint,
    pub finalized: Checkpoint,
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttesterDuty {
    pub pubkey: String,
    pub validator_index: ValidatorIndex,
    pub committee_index: CommitteeIndex,
    #[serde_as(as = "DisplayFromStr")]
    pub committee_length: u64,
    #[serde_as(as = "DisplayFromStr")]
    pub committees_at_slot: u64,
    #[serde_as(as = "DisplayFromStr")]
    pub validator_committee_index: u64,
    pub slot: Slot,
}

impl AttesterDuty {
    /// A duty with only the validator index populated.
    pub fn for_validator(validator_index: ValidatorIndex) -> Self {
        Self {
            pubkey: String::new(),
            validator_index,
            committee_index: CommitteeIndex::default(),
            committee_length: 0,
            committees_at_slot: 0,
            validator_committee_index: 0,
            slot: Slot::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttestationData {
    pub slot: Slot,
    pub index: CommitteeIndex,
    pub beacon_block_root: Root,
    pub source: Checkpoint,
    pub target: Checkpoint,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Attestation {
    pub aggregation_bits: String,
    pub data: AttestationData,
    pub signature: String,
    /// Present from Electra onwards.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub committee_bits: Option<String>,
}

/// Consensus fork a versioned payload belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataVersion {
    Phase0,
    Altair,
    Bellatrix,
    Capella,
    Deneb,
    Electra,
}

impl fmt::Display for DataVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Phase0 => "phase0",
            Self::Altair => "altair",
            Self::Bellatrix => "bellatrix",
            Self::Capella => "capella",
            Self::Deneb => "deneb",
            Self::Electra => "electra",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionedAttestation {
    pub version: DataVersion,
    pub attestation: Attestation,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VoluntaryExit {
    pub epoch: Epoch,
    pub validator_index: ValidatorIndex,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignedVoluntaryExit {
    pub message: VoluntaryExit,
    pub signature: String,
}

// ─── Operation options ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttesterDutiesOpts {
    pub epoch: Epoch,
    /// Validators to fetch duties for.
    pub indices: Vec<ValidatorIndex>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateAttestationOpts {
    pub slot: Slot,
    pub attestation_data_root: Root,
    /// Required by the v2 endpoint.
    pub committee_index: Option<CommitteeIndex>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalityOpts {
    /// State identifier: `head`, `finalized`, a slot, or a state root.
    pub state: String,
}

impl Default for FinalityOpts {
    fn default() -> Self {
        Self { state: "head".into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoluntaryExitPoolOpts {
    pub state: String,
}

impl Default for VoluntaryExitPoolOpts {
    fn default() -> Self {
        Self { state: "head".into() }
    }
}

// ─── Responses ────────────────────────────────────────────────────────────────

/// A single provider's response: the payload plus whatever metadata the node
/// attached (`execution_optimistic`, `dependent_root`, …).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub data: T,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl<T> ApiResponse<T> {
    pub fn new(data: T) -> Self {
        Self {
            data,
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ApiResponse<U> {
        ApiResponse {
            data: f(self.data),
            metadata: self.metadata,
        }
    }
}
