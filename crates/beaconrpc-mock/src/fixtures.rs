//! Canned beacon responses used when a mock has no handler for an operation.

use beaconrpc_core::types::{
    AggregateAttestationOpts, ApiResponse, Attestation, AttestationData, AttesterDutiesOpts,
    AttesterDuty, Checkpoint, DataVersion, Epoch, Finality, Root, SignedVoluntaryExit,
    ValidatorIndex, VersionedAttestation, VoluntaryExit,
};

/// Number of exits in the default voluntary exit pool.
pub const EXIT_POOL_SIZE: usize = 5;

/// `0x000102…5f`, a recognisable 96-byte BLS signature.
pub fn signature() -> String {
    let hex: String = (0u8..96).map(|b| format!("{b:02x}")).collect();
    format!("0x{hex}")
}

pub fn zero_root() -> Root {
    Root(format!("0x{}", "00".repeat(32)))
}

fn checkpoint(epoch: u64) -> Checkpoint {
    Checkpoint {
        epoch: Epoch(epoch),
        root: zero_root(),
    }
}

/// Finalized at `epoch`, justified one and two epochs later.
pub fn finality(finalized: u64) -> Finality {
    Finality {
        previous_justified: checkpoint(finalized + 1),
        current_justified: checkpoint(finalized + 2),
        finalized: checkpoint(finalized),
    }
}

/// One duty per requested validator, with only the index populated.
pub fn attester_duties(opts: &AttesterDutiesOpts) -> ApiResponse<Vec<AttesterDuty>> {
    ApiResponse::new(
        opts.indices
            .iter()
            .copied()
            .map(AttesterDuty::for_validator)
            .collect(),
    )
}

pub fn aggregate_attestation(opts: &AggregateAttestationOpts) -> ApiResponse<Attestation> {
    ApiResponse::new(Attestation {
        aggregation_bits: "0x01".into(),
        data: AttestationData {
            slot: opts.slot,
            index: opts.committee_index.unwrap_or_default(),
            beacon_block_root: opts.attestation_data_root.clone(),
            source: checkpoint(0),
            target: checkpoint(1),
        },
        signature: signature(),
        committee_bits: None,
    })
}

pub fn aggregate_attestation_v2(opts: &AggregateAttestationOpts) -> ApiResponse<VersionedAttestation> {
    aggregate_attestation(opts).map(|mut attestation| {
        attestation.data.index = Default::default();
        attestation.committee_bits = Some("0x0100000000000000".into());
        VersionedAttestation {
            version: DataVersion::Electra,
            attestation,
        }
    })
}

pub fn voluntary_exit_pool() -> ApiResponse<Vec<SignedVoluntaryExit>> {
    let exit = SignedVoluntaryExit {
        message: VoluntaryExit {
            epoch: Epoch(1),
            validator_index: ValidatorIndex(1),
        },
        signature: signature(),
    };
    ApiResponse::new(vec![exit; EXIT_POOL_SIZE])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_96_bytes() {
        let sig = signature();
        assert_eq!(sig.len(), 2 + 192);
        assert!(sig.starts_with("0x000102"));
        assert!(sig.ends_with("5f"));
    }

    #[test]
    fn duties_follow_requested_indices() {
        let opts = AttesterDutiesOpts {
            epoch: Epoch(3),
            indices: vec![ValidatorIndex(7), ValidatorIndex(9)],
        };
        let duties = attester_duties(&opts).data;
        assert_eq!(duties.len(), 2);
        assert_eq!(duties[1].validator_index, ValidatorIndex(9));
    }
}
