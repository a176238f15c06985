//! Ephemeral secret coordination
//!
//! Each epoch the committee must publish exactly one ephemeral secret.
//! Generation is scheduled at a random block height inside the epoch to
//! avoid thundering herds, the consensus query in [`generate_ephemeral_secret`]
//! suppresses duplicates, and observed secrets are replicated into the
//! enclave with bounded retries. Races between committee members are
//! accepted; consensus deduplicates publications for the same
//! `(runtime, epoch)`.

use std::collections::BTreeSet;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::api::{
    insecure_rak, new_publish_ephemeral_secret_tx, EpochTime, GenerateEphemeralSecretRequest,
    GenerateEphemeralSecretResponse, LoadEphemeralSecretRequest, Namespace,
    SignedEncryptedEphemeralSecret, Status, RPC_METHOD_GENERATE_EPHEMERAL_SECRET,
    RPC_METHOD_LOAD_EPHEMERAL_SECRET,
};
use crate::attestation;
use crate::backend::{Beacon, Consensus, Identity, KeyManagerBackend, Registry, TeeHardware};
use crate::enclave_rpc::local_call;
use crate::error::{Result, WorkerError};
use crate::host::HostedRuntime;
use crate::worker::RuntimeStatus;

/// Retry cap for loading observed secrets into the enclave. The cap applies
/// to the whole pending queue, not per secret.
pub const LOAD_EPHEMERAL_SECRET_MAX_RETRIES: u32 = 5;

/// Retry cap for generating and publishing an epoch's secret.
pub const GENERATE_EPHEMERAL_SECRET_MAX_RETRIES: u32 = 5;

/// Number of recent secrets fetched on enclave (re)start, and the bound on
/// the pending queue.
pub const EPHEMERAL_SECRET_CACHE_SIZE: usize = 20;

/// Generates the ephemeral secret for the given epoch, verifies it against
/// the committee and publishes it as a consensus transaction.
///
/// Returns `Ok` without touching the enclave when the secret has already
/// been published by another committee member.
#[allow(clippy::too_many_arguments)]
pub async fn generate_ephemeral_secret(
    runtime_id: Namespace,
    epoch: EpochTime,
    km_status: &Status,
    runtime_status: &RuntimeStatus,
    km_backend: &dyn KeyManagerBackend,
    registry: &dyn Registry,
    consensus: &dyn Consensus,
    identity: &Identity,
    runtime: &dyn HostedRuntime,
    cancel: &CancellationToken,
) -> Result<()> {
    info!(epoch, "generating ephemeral secret");

    // Check if the secret has been published. Despite this check, committee
    // nodes can still publish ephemeral secrets at the same time.
    match km_backend.get_ephemeral_secret(&runtime_id, epoch).await {
        Ok(_) => {
            info!("skipping secret generation, ephemeral secret already published");
            return Ok(());
        }
        Err(WorkerError::NoSuchEphemeralSecret) => {}
        Err(err) => {
            error!(error = %err, "failed to fetch ephemeral secret");
            return Err(err);
        }
    }

    // Skip generation if the node is not in the key manager committee.
    let node_id = identity.node_id();
    if !km_status.nodes.contains(&node_id) {
        info!("skipping ephemeral secret generation, node not in the key manager committee");
        return Err(WorkerError::Backend(
            "node not in the key manager committee".to_string(),
        ));
    }

    let response: GenerateEphemeralSecretResponse = local_call(
        runtime,
        cancel,
        RPC_METHOD_GENERATE_EPHEMERAL_SECRET,
        &GenerateEphemeralSecretRequest { epoch },
    )
    .await
    .map_err(|err| {
        error!(error = %err, "failed to generate ephemeral secret");
        err
    })?;

    // Fetch key manager runtime details to learn which TEE hardware the
    // committee runs under.
    let km_runtime = registry.get_runtime(&runtime_id).await?;

    let rak = match km_runtime.tee_hardware {
        TeeHardware::Invalid => insecure_rak(),
        TeeHardware::IntelSgx => {
            runtime_status
                .capability_tee
                .as_ref()
                .ok_or_else(|| {
                    WorkerError::Backend("node does not have TEE capability".to_string())
                })?
                .rak
        }
        TeeHardware::Other(kind) => return Err(WorkerError::UnknownTee(kind)),
    };

    // Gather the REKs of the key manager committee.
    let mut reks = BTreeSet::new();
    for id in &km_status.nodes {
        let node = match registry.get_node(id).await {
            Ok(node) => node,
            Err(WorkerError::NoSuchNode) => continue,
            Err(err) => return Err(err),
        };
        let Some(node_runtime) = node.runtime(&runtime_id) else {
            continue;
        };
        let Some(rek) = attestation::rek_for(km_runtime.tee_hardware, node_runtime) else {
            continue;
        };
        reks.insert(rek);
    }

    attestation::verify_ephemeral_secret(&response.signed_secret, epoch, &reks, &rak).map_err(
        |err| {
            error!(error = %err, "failed to validate generate ephemeral secret response signature");
            err
        },
    )?;

    let tx = new_publish_ephemeral_secret_tx(0, None, &response.signed_secret)?;
    consensus.sign_and_submit_tx(identity, tx).await?;

    Ok(())
}

/// Replicates one observed secret into the enclave.
pub async fn load_ephemeral_secret(
    runtime: &dyn HostedRuntime,
    cancel: &CancellationToken,
    secret: &SignedEncryptedEphemeralSecret,
) -> Result<()> {
    info!(epoch = secret.secret.epoch, "loading ephemeral secret");

    local_call(
        runtime,
        cancel,
        RPC_METHOD_LOAD_EPHEMERAL_SECRET,
        &LoadEphemeralSecretRequest {
            signed_secret: secret.clone(),
        },
    )
    .await
}

/// Fetches up to [`EPHEMERAL_SECRET_CACHE_SIZE`] most recent on-chain
/// secrets, newest first, so a (re)started enclave can be brought current.
pub async fn fetch_last_ephemeral_secrets(
    km_backend: &dyn KeyManagerBackend,
    beacon: &dyn Beacon,
    runtime_id: Namespace,
) -> Result<Vec<SignedEncryptedEphemeralSecret>> {
    info!("fetching last ephemeral secrets");

    let mut epoch = beacon.get_epoch().await.map_err(|err| {
        error!(error = %err, "failed to fetch epoch");
        err
    })?;

    let mut secrets = Vec::with_capacity(EPHEMERAL_SECRET_CACHE_SIZE);
    for _ in 0..EPHEMERAL_SECRET_CACHE_SIZE {
        match km_backend.get_ephemeral_secret(&runtime_id, epoch).await {
            Ok(secret) => secrets.push(secret),
            Err(WorkerError::NoSuchEphemeralSecret) => {}
            Err(err) => {
                error!(error = %err, "failed to fetch ephemeral secret");
                return Err(err);
            }
        }
        if epoch == 0 {
            break;
        }
        epoch -= 1;
    }

    Ok(secrets)
}

/// Returns the height of a random block in the k-th percentile of the given
/// epoch, so generation is spread across the committee and leaves time for
/// publication and replication before the epoch ends.
pub async fn random_block_height(
    beacon: &dyn Beacon,
    epoch: EpochTime,
    percentile: u64,
) -> Result<u64> {
    let params = beacon.consensus_parameters().await?;
    let first = beacon.get_epoch_block(epoch).await?;

    let mut interval = params.interval;
    if percentile < 100 {
        interval = interval * percentile / 100;
    }
    if interval == 0 {
        interval = 1;
    }
    let offset = rand::thread_rng().gen_range(0..interval);

    Ok(first + offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{insecure_rek, test_signers, sign_encrypted_ephemeral_secret};
    use crate::api::{EncryptedEphemeralSecret, EncryptedSecret, X25519PublicKey};
    use crate::local::LocalChain;
    use std::collections::BTreeMap;

    fn publish_test_secret(chain: &LocalChain, runtime_id: Namespace, epoch: EpochTime) {
        let secret = sign_encrypted_ephemeral_secret(
            &test_signers()[0],
            EncryptedEphemeralSecret {
                runtime_id,
                epoch,
                secret: EncryptedSecret {
                    pub_key: X25519PublicKey([2; 32]),
                    ciphertexts: BTreeMap::from([(
                        insecure_rek(),
                        serde_bytes::ByteBuf::from(vec![1; 16]),
                    )]),
                },
            },
        )
        .unwrap();
        assert!(chain.publish_secret(secret));
    }

    #[tokio::test]
    async fn test_fetch_last_secrets_bounded() {
        let chain = LocalChain::new();
        let runtime_id = Namespace([1; 32]);
        for _ in 0..40 {
            chain.advance_epoch();
        }
        for epoch in 1..=40 {
            publish_test_secret(&chain, runtime_id, epoch);
        }

        let secrets = fetch_last_ephemeral_secrets(chain.as_ref(), chain.as_ref(), runtime_id)
            .await
            .unwrap();
        assert_eq!(secrets.len(), EPHEMERAL_SECRET_CACHE_SIZE);
        // Newest first, starting at the current epoch.
        assert_eq!(secrets[0].secret.epoch, 40);
        assert_eq!(secrets.last().unwrap().secret.epoch, 21);
    }

    #[tokio::test]
    async fn test_fetch_last_secrets_skips_gaps() {
        let chain = LocalChain::new();
        let runtime_id = Namespace([1; 32]);
        for _ in 0..10 {
            chain.advance_epoch();
        }
        publish_test_secret(&chain, runtime_id, 10);
        publish_test_secret(&chain, runtime_id, 7);

        let secrets = fetch_last_ephemeral_secrets(chain.as_ref(), chain.as_ref(), runtime_id)
            .await
            .unwrap();
        let epochs: Vec<_> = secrets.iter().map(|s| s.secret.epoch).collect();
        assert_eq!(epochs, vec![10, 7]);
    }

    #[tokio::test]
    async fn test_random_block_height_stays_in_percentile() {
        let chain = LocalChain::new();
        chain.set_interval(100);
        for _ in 0..5 {
            chain.advance_block();
        }
        let epoch = chain.advance_epoch();
        let first = chain.get_epoch_block(epoch).await.unwrap();

        for _ in 0..50 {
            let height = random_block_height(chain.as_ref(), epoch, 90).await.unwrap();
            assert!(height >= first);
            assert!(height < first + 90);
        }
    }

    #[tokio::test]
    async fn test_random_block_height_degenerate_interval() {
        let chain = LocalChain::new();
        chain.set_interval(1);
        let epoch = chain.advance_epoch();
        let first = chain.get_epoch_block(epoch).await.unwrap();

        // 90% of a one-block interval rounds to zero; generation happens on
        // the first block.
        let height = random_block_height(chain.as_ref(), epoch, 90).await.unwrap();
        assert_eq!(height, first);
    }
}
