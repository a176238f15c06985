//! Key manager node (development mode)
//!
//! Runs the key manager worker against in-process insecure backends: an
//! in-memory consensus layer driven by a simulated block clock, and an
//! emulated enclave that signs with the well-known insecure RAK. Useful for
//! poking at the worker without a consensus node or TEE hardware.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use tracing::info;
use tracing_subscriber::EnvFilter;

use keymanager_worker::api::Namespace;
use keymanager_worker::backend::{
    Identity, Node, NodeRuntime, P2pInfo, RuntimeDescriptor, RuntimeKind, TeeHardware, Version,
};
use keymanager_worker::config::Config;
use keymanager_worker::local::{
    insecure_status, LocalChain, LocalEnclave, LocalRoleProvider, LocalRuntimeHost,
};
use keymanager_worker::worker::{Backends, Worker};

/// Blocks per simulated epoch.
const EPOCH_INTERVAL: u64 = 20;

/// Simulated block time.
const BLOCK_TIME: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("starting key manager node (development mode)");

    let config = Config::from_env().unwrap_or_else(|_| Config::new(Namespace([42; 32])));
    let runtime_id = config.runtime_id;
    let version = Version::new(1, 0, 0);

    let chain = LocalChain::new();
    let enclave = LocalEnclave::new(runtime_id, version);
    let host = LocalRuntimeHost::new(enclave);
    let role_provider = LocalRoleProvider::new();
    let identity = Arc::new(Identity::new(SigningKey::generate(&mut OsRng)));

    chain.set_interval(EPOCH_INTERVAL);
    chain.register_runtime(RuntimeDescriptor {
        id: runtime_id,
        kind: RuntimeKind::KeyManager,
        key_manager: None,
        tee_hardware: TeeHardware::Invalid,
    });
    let node_id = identity.node_id();
    chain.register_node(Node {
        id: node_id,
        p2p: P2pInfo {
            public_key: node_id,
        },
        runtimes: vec![NodeRuntime {
            id: runtime_id,
            version,
            capability_tee: None,
            extra_info: None,
        }],
    });
    chain.set_status(insecure_status(runtime_id, vec![node_id]));

    let backends = Backends {
        km: chain.clone(),
        consensus: chain.clone(),
        registry: chain.clone(),
        scheduler: chain.clone(),
        beacon: chain.clone(),
        host,
        role_provider,
    };
    let (worker, handle) = Worker::new(config, identity, backends);
    let worker_task = tokio::spawn(worker.run());

    // Simulated block clock: one block per second, an epoch every
    // EPOCH_INTERVAL blocks.
    let block_clock = chain.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(BLOCK_TIME);
        loop {
            ticker.tick().await;
            let height = block_clock.advance_block();
            if height % EPOCH_INTERVAL == 0 {
                let epoch = block_clock.advance_epoch();
                info!(epoch, height, "epoch transition");
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    handle.stop();
    worker_task.await??;
    Ok(())
}
