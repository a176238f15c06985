//! Attestation verification for enclave responses
//!
//! Responses from the hosted enclave are signed under its runtime
//! attestation key. On SGX hardware the RAK comes from the attested TEE
//! capability; without a TEE the well-known insecure RAK stands in so the
//! verification path stays identical in insecure builds.

use std::collections::BTreeSet;

use crate::api::{
    insecure_rak, insecure_rek, EpochTime, PublicKey, SignedEncryptedEphemeralSecret,
    SignedInitResponse, X25519PublicKey,
};
use crate::backend::{CapabilityTee, NodeRuntime, TeeHardware};
use crate::error::{Result, WorkerError};

/// Resolves the RAK to verify enclave responses against.
pub fn rak_for(capability_tee: Option<&CapabilityTee>) -> Result<PublicKey> {
    match capability_tee {
        None => Ok(insecure_rak()),
        Some(tee) => match tee.hardware {
            TeeHardware::Invalid => Ok(insecure_rak()),
            TeeHardware::IntelSgx => Ok(tee.rak),
            TeeHardware::Other(kind) => Err(WorkerError::UnknownTee(kind)),
        },
    }
}

/// Resolves the REK a committee node's enclave receives secrets under, or
/// `None` when the node cannot participate in replication.
pub fn rek_for(hardware: TeeHardware, node_runtime: &NodeRuntime) -> Option<X25519PublicKey> {
    match hardware {
        TeeHardware::Invalid => Some(insecure_rek()),
        TeeHardware::IntelSgx => node_runtime.capability_tee.as_ref().and_then(|tee| tee.rek),
        TeeHardware::Other(_) => None,
    }
}

/// Verifies a signed init response against the current TEE capability.
pub fn verify_init_response(
    signed: &SignedInitResponse,
    capability_tee: Option<&CapabilityTee>,
) -> Result<()> {
    signed.verify(&rak_for(capability_tee)?)
}

/// Verifies a signed ephemeral secret against the epoch, the committee REK
/// set and the generating enclave's RAK.
pub fn verify_ephemeral_secret(
    signed: &SignedEncryptedEphemeralSecret,
    epoch: EpochTime,
    reks: &BTreeSet<X25519PublicKey>,
    rak: &PublicKey,
) -> Result<()> {
    signed.verify(epoch, reks, rak)
}
