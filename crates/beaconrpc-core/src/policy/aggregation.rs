//! How answers from several providers reduce to one.

use std::fmt;
use std::str::FromStr;

use serde_with::SerializeDisplay;

use crate::error::DispatchError;

/// Rule for reducing per-provider answers to one logical result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, SerializeDisplay)]
pub enum AggregationPolicy {
    /// Accept the first successful answer by completion order.
    #[default]
    FirstSuccess,
    /// Accept a value once `quorum` providers returned it.
    Majority { quorum: usize },
    /// Every eligible provider must answer, and all answers must be equal.
    AllMustAgree,
}

impl AggregationPolicy {
    pub fn majority(quorum: usize) -> Self {
        Self::Majority { quorum }
    }

    /// Reject policies that can never be satisfied.
    pub fn validate(&self) -> Result<(), DispatchError> {
        match self {
            Self::Majority { quorum: 0 } => Err(DispatchError::InvalidPolicy(
                "majority quorum must be at least 1".into(),
            )),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for AggregationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FirstSuccess => write!(f, "first"),
            Self::Majority { quorum } => write!(f, "majority:{quorum}"),
            Self::AllMustAgree => write!(f, "all"),
        }
    }
}

impl FromStr for AggregationPolicy {
    type Err = String;

    /// Parses `first`, `all`, or `majority:<quorum>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "first" | "first_success" => Ok(Self::FirstSuccess),
            "all" | "all_must_agree" => Ok(Self::AllMustAgree),
            other => {
                let quorum = other
                    .strip_prefix("majority:")
                    .ok_or_else(|| format!("unknown aggregation policy '{other}'"))?;
                let quorum = quorum
                    .parse::<usize>()
                    .map_err(|e| format!("invalid quorum '{quorum}': {e}"))?;
                Ok(Self::Majority { quorum })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trips_display() {
        for policy in [
            AggregationPolicy::FirstSuccess,
            AggregationPolicy::majority(3),
            AggregationPolicy::AllMustAgree,
        ] {
            assert_eq!(policy.to_string().parse::<AggregationPolicy>().unwrap(), policy);
        }
        assert_eq!(
            "first_success".parse::<AggregationPolicy>().unwrap(),
            AggregationPolicy::FirstSuccess
        );
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("quorum".parse::<AggregationPolicy>().is_err());
        assert!("majority:x".parse::<AggregationPolicy>().is_err());
    }

    #[test]
    fn zero_quorum_is_invalid() {
        assert!(AggregationPolicy::majority(0).validate().is_err());
        assert!(AggregationPolicy::majority(1).validate().is_ok());
    }
}
