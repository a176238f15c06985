//! Key manager worker
//!
//! The worker hosts the key manager enclave and keeps it in step with the
//! consensus layer. It behaves differently from other workers as the key
//! manager has its own runtime: it needs to track executor committees of the
//! runtimes it serves in order to update the access control lists, and it
//! coordinates per-epoch ephemeral secret generation with the rest of the
//! committee.
//!
//! All mutable state is owned by a single event loop. Other components
//! receive read-only snapshots behind a shared guard or push messages into
//! the loop through channels; the loop is the sole writer.

use std::collections::{HashMap, HashSet, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::Sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::access::{is_publicly_callable, AccessList, PeerId};
use crate::api::{
    EpochTime, InitRequest, Namespace, SignedEncryptedEphemeralSecret, SignedInitResponse,
    SignedPolicySgx, Status, RPC_METHOD_INIT,
};
use crate::attestation;
use crate::backend::{
    AvailabilityClaim, Beacon, CapabilityTee, Consensus, Identity, KeyManagerBackend, Node,
    Registry, RoleProvider, RuntimeDescriptor, RuntimeKind, Scheduler, Version,
};
use crate::cbor;
use crate::config::Config;
use crate::enclave_rpc::{self, local_call, Frame, Kind, RPC_CALL_TIMEOUT};
use crate::error::{Result, WorkerError};
use crate::host::{HostEvent, HostedRuntime, RuntimeHostProvisioner};
use crate::secrets::{
    fetch_last_ephemeral_secrets, generate_ephemeral_secret, load_ephemeral_secret,
    random_block_height, EPHEMERAL_SECRET_CACHE_SIZE, GENERATE_EPHEMERAL_SECRET_MAX_RETRIES,
    LOAD_EPHEMERAL_SECRET_MAX_RETRIES,
};
use crate::watcher::{AccessListUpdate, ClientRuntimeWatcher, WatcherHandle};

const INIT_RETRY_BASE: Duration = Duration::from_secs(1);
const INIT_RETRY_MAX: Duration = Duration::from_secs(60);

/// Percentile of the epoch interval within which the generation height is
/// chosen, leaving the tail for publication and replication.
const GENERATION_HEIGHT_PERCENTILE: u64 = 90;

/// Local state of the hosted enclave, populated from runtime host events.
#[derive(Clone, Debug)]
pub struct RuntimeStatus {
    pub version: Version,
    pub capability_tee: Option<CapabilityTee>,
}

/// Monotonic counters exposed for introspection.
#[derive(Clone, Debug, Default)]
pub struct WorkerCounters {
    pub policy_updates: u64,
    pub compute_runtimes: u64,
    pub generated_secrets: u64,
    pub loaded_secrets: u64,
    pub last_generated_epoch: Option<EpochTime>,
    pub last_loaded_epoch: Option<EpochTime>,
}

/// Fields readable by the RPC adapter and introspection, guarded by a single
/// reader-writer lock. Writes come only from the worker loop.
#[derive(Default)]
struct SharedState {
    access_list: AccessList,
    enclave_status: Option<SignedInitResponse>,
    policy: Option<SignedPolicySgx>,
    policy_checksum: Option<Vec<u8>>,
    global_status: Option<Status>,
    hosted: Option<Arc<dyn HostedRuntime>>,
    counters: WorkerCounters,
}

/// Read-only snapshot of the worker state.
#[derive(Clone, Debug)]
pub struct WorkerStatus {
    pub initialized: bool,
    pub enclave_status: Option<SignedInitResponse>,
    pub policy: Option<SignedPolicySgx>,
    pub policy_checksum: Option<Vec<u8>>,
    pub counters: WorkerCounters,
}

/// Consensus-side collaborators injected at construction.
pub struct Backends {
    pub km: Arc<dyn KeyManagerBackend>,
    pub consensus: Arc<dyn Consensus>,
    pub registry: Arc<dyn Registry>,
    pub scheduler: Arc<dyn Scheduler>,
    pub beacon: Arc<dyn Beacon>,
    pub host: Arc<dyn RuntimeHostProvisioner>,
    pub role_provider: Arc<dyn RoleProvider>,
}

/// Exponential init retry with jitter.
struct InitRetry {
    attempt: u32,
}

impl InitRetry {
    fn new() -> Self {
        Self { attempt: 0 }
    }

    fn next_delay(&mut self) -> Duration {
        let exp = INIT_RETRY_BASE.as_millis() as u64 * (1u64 << self.attempt.min(6));
        let capped = exp.min(INIT_RETRY_MAX.as_millis() as u64);
        self.attempt = self.attempt.saturating_add(1);
        let jitter = rand::thread_rng().gen_range(0.9..1.1);
        Duration::from_millis((capped as f64 * jitter) as u64)
    }
}

fn arm_init_retry(retry: &mut Option<InitRetry>, sleep: &mut Option<Pin<Box<Sleep>>>) {
    let retry = retry.get_or_insert_with(InitRetry::new);
    *sleep = Some(Box::pin(tokio::time::sleep(retry.next_delay())));
}

/// Mutable loop state. Owned exclusively by [`Worker::run`].
struct LoopState {
    hosted: Option<Arc<dyn HostedRuntime>>,
    current_status: Option<Status>,
    current_runtime_status: Option<RuntimeStatus>,
    epoch: EpochTime,

    pending_secrets: VecDeque<SignedEncryptedEphemeralSecret>,
    load_retry: u32,

    gen_height: u64,
    gen_in_progress: bool,
    gen_retry: u32,

    watchers: HashMap<Namespace, WatcherHandle>,
    init_retry: Option<InitRetry>,
}

/// The key manager worker.
pub struct Worker {
    config: Config,
    identity: Arc<Identity>,
    backends: Backends,
    shared: Arc<RwLock<SharedState>>,
    init_tx: watch::Sender<bool>,
    cancel: CancellationToken,
}

/// Cloneable handle for external callers: the enclave RPC entry point and
/// introspection.
#[derive(Clone)]
pub struct WorkerHandle {
    shared: Arc<RwLock<SharedState>>,
    initialized: watch::Receiver<bool>,
    cancel: CancellationToken,
    private_peers: HashSet<PeerId>,
}

impl Worker {
    pub fn new(
        config: Config,
        identity: Arc<Identity>,
        backends: Backends,
    ) -> (Self, WorkerHandle) {
        let shared = Arc::new(RwLock::new(SharedState::default()));
        let (init_tx, initialized) = watch::channel(false);
        let cancel = CancellationToken::new();
        let handle = WorkerHandle {
            shared: shared.clone(),
            initialized,
            cancel: cancel.clone(),
            private_peers: config.private_peers.clone(),
        };
        let worker = Self {
            config,
            identity,
            backends,
            shared,
            init_tx,
            cancel,
        };
        (worker, handle)
    }

    /// Runs the worker until it is stopped or a consensus stream closes.
    pub async fn run(self) -> Result<()> {
        if !self.config.enabled {
            info!("not starting key manager worker as it is disabled");
            self.init_tx.send_replace(true);
            return Ok(());
        }

        info!("starting key manager worker");
        info!("delaying worker start until after initial synchronization");
        tokio::select! {
            _ = self.cancel.cancelled() => return Ok(()),
            _ = self.backends.consensus.wait_synced() => {}
        }

        let runtime_id = self.config.runtime_id;

        let mut status_rx = self.backends.km.watch_statuses();
        let mut secret_rx = self.backends.km.watch_ephemeral_secrets();
        let mut epoch_rx = self.backends.beacon.watch_latest_epoch();
        let mut block_rx = self.backends.consensus.watch_blocks();
        let mut runtime_rx = self.backends.registry.watch_runtimes();

        // Watcher tasks push access list replacements through this channel;
        // the loop below is the only writer that applies them.
        let (access_tx, mut access_rx) = mpsc::channel::<AccessListUpdate>(16);

        // Capacity-one signal channels; redundant signals coalesce.
        let (load_tx, mut load_rx) = mpsc::channel::<()>(1);
        let (gen_tx, mut gen_rx) = mpsc::channel::<()>(1);
        let (gen_done_tx, mut gen_done_rx) = mpsc::channel::<bool>(1);

        let mut host_events: Option<mpsc::Receiver<HostEvent>> = None;
        let mut init_retry_sleep: Option<Pin<Box<Sleep>>> = None;

        let mut state = LoopState {
            hosted: None,
            current_status: None,
            current_runtime_status: None,
            epoch: 0,
            pending_secrets: VecDeque::new(),
            load_retry: 0,
            gen_height: u64::MAX,
            gen_in_progress: false,
            gen_retry: 0,
            watchers: HashMap::new(),
            init_retry: None,
        };

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("termination requested");
                    // Wait until background generation finishes; it honors
                    // the cancellation token itself.
                    if state.gen_in_progress {
                        let _ = gen_done_rx.recv().await;
                    }
                    return Ok(());
                }

                maybe_event = async { host_events.as_mut().unwrap().recv().await }, if host_events.is_some() => {
                    let Some(event) = maybe_event else {
                        error!("runtime host event stream closed unexpectedly");
                        return Err(WorkerError::Host("event stream closed".to_string()));
                    };
                    match event {
                        HostEvent::Started { version, capability_tee }
                        | HostEvent::Updated { version, capability_tee } => {
                            state.current_runtime_status = Some(RuntimeStatus { version, capability_tee });

                            // Bring the restarted enclave current with the
                            // recently published secrets.
                            match fetch_last_ephemeral_secrets(
                                self.backends.km.as_ref(),
                                self.backends.beacon.as_ref(),
                                runtime_id,
                            )
                            .await
                            {
                                Ok(secrets) => {
                                    state.pending_secrets =
                                        secrets.into_iter().take(EPHEMERAL_SECRET_CACHE_SIZE).collect();
                                    state.load_retry = 0;
                                    let _ = load_tx.try_send(());
                                }
                                Err(err) => {
                                    error!(error = %err, "failed to fetch last ephemeral secrets");
                                }
                            }

                            if state.current_status.is_none() {
                                continue;
                            }

                            // Pre-register so other nodes know to update
                            // their access control before the first verified
                            // init response lands.
                            if self.shared.read().await.enclave_status.is_none() {
                                let rt_status = state.current_runtime_status.clone().unwrap();
                                let claim = AvailabilityClaim {
                                    runtime_id,
                                    version: rt_status.version,
                                    extra_info: None,
                                    capability_tee: rt_status.capability_tee,
                                };
                                if let Err(err) = self.backends.role_provider.set_available(claim).await {
                                    warn!(error = %err, "failed to pre-register node");
                                }
                            }

                            self.try_update_status(&mut state, &mut init_retry_sleep, &access_tx).await;
                        }
                        HostEvent::FailedToStart { error: cause } => {
                            error!(error = %cause, "key manager runtime failed to start");
                            state.current_runtime_status = None;
                            self.backends.role_provider.set_unavailable().await;
                        }
                        HostEvent::Stopped => {
                            state.current_runtime_status = None;
                            self.backends.role_provider.set_unavailable().await;
                        }
                    }
                }

                maybe_status = status_rx.recv() => {
                    let Some(status) = maybe_status else {
                        error!("status stream closed unexpectedly");
                        return Err(WorkerError::Backend("status stream closed".to_string()));
                    };
                    if status.id != runtime_id {
                        continue;
                    }

                    self.shared.write().await.global_status = Some(status.clone());

                    // First status delivery provisions the hosted runtime.
                    if state.hosted.is_none() {
                        if let Err(err) = self.provision_runtime(&mut state, &mut host_events).await {
                            error!(error = %err, "failed to provision key manager runtime");
                            return Err(err);
                        }
                    }

                    // Committee members replicate from each other, so they
                    // belong on the access list for our own runtime.
                    self.update_km_node_access(&status).await;

                    state.current_status = Some(status);
                    if state.current_runtime_status.is_none() {
                        continue;
                    }
                    self.try_update_status(&mut state, &mut init_retry_sleep, &access_tx).await;
                }

                maybe_secret = secret_rx.recv() => {
                    let Some(secret) = maybe_secret else {
                        error!("ephemeral secret stream closed unexpectedly");
                        return Err(WorkerError::Backend("secret stream closed".to_string()));
                    };
                    if secret.secret.runtime_id != runtime_id {
                        continue;
                    }

                    if secret.secret.epoch == state.epoch + 1 {
                        // Someone published this epoch's secret; disarm
                        // local generation.
                        state.gen_height = u64::MAX;
                    }

                    if state.pending_secrets.len() == EPHEMERAL_SECRET_CACHE_SIZE {
                        state.pending_secrets.pop_front();
                    }
                    state.pending_secrets.push_back(secret.clone());
                    state.load_retry = 0;
                    let _ = load_tx.try_send(());

                    debug!(epoch = secret.secret.epoch, "ephemeral secret published");
                }

                maybe_epoch = epoch_rx.recv() => {
                    let Some(epoch) = maybe_epoch else {
                        error!("epoch stream closed unexpectedly");
                        return Err(WorkerError::Backend("epoch stream closed".to_string()));
                    };
                    state.epoch = epoch;

                    // Update per-runtime access lists.
                    for handle in state.watchers.values() {
                        handle.epoch_transition();
                    }
                    if let Some(status) = state.current_status.clone() {
                        self.update_km_node_access(&status).await;
                    }

                    // Choose a random height for ephemeral secret
                    // generation. If randomization fails the height is zero
                    // and the secret is generated without a delay.
                    state.gen_height = match random_block_height(
                        self.backends.beacon.as_ref(),
                        epoch,
                        GENERATION_HEIGHT_PERCENTILE,
                    )
                    .await
                    {
                        Ok(height) => height,
                        Err(err) => {
                            error!(error = %err, "failed to select ephemeral secret block height");
                            0
                        }
                    };
                    state.gen_retry = 0;

                    debug!(
                        height = state.gen_height,
                        epoch,
                        "block height for ephemeral secret generation selected"
                    );
                }

                maybe_block = block_rx.recv() => {
                    let Some(block) = maybe_block else {
                        error!("watch blocks channel closed unexpectedly");
                        return Err(WorkerError::Backend("block stream closed".to_string()));
                    };

                    // (Re)generate the ephemeral secret once the chosen
                    // height is reached.
                    if block.height >= state.gen_height {
                        let _ = gen_tx.try_send(());
                    }

                    // (Re)load pending secrets. The first load after an
                    // observation may fail while the verifier lags a block.
                    if !state.pending_secrets.is_empty() {
                        let _ = load_tx.try_send(());
                    }
                }

                maybe_runtime = runtime_rx.recv() => {
                    let Some(runtime) = maybe_runtime else {
                        error!("runtime stream closed unexpectedly");
                        return Err(WorkerError::Backend("runtime stream closed".to_string()));
                    };
                    let status = state.current_status.clone();
                    if let Err(err) = self
                        .start_client_runtime_watcher(&runtime, status.as_ref(), &mut state, &access_tx)
                        .await
                    {
                        error!(error = %err, "failed to start runtime watcher");
                    }
                }

                Some(update) = access_rx.recv() => {
                    self.set_access_list(update.runtime_id, &update.nodes).await;
                }

                Some(()) = gen_rx.recv() => {
                    if state.current_status.is_none() || state.current_runtime_status.is_none() {
                        continue;
                    }
                    if state.gen_in_progress || state.gen_height == u64::MAX {
                        continue;
                    }
                    let Some(hosted) = state.hosted.clone() else {
                        continue;
                    };

                    state.gen_retry += 1;
                    if state.gen_retry > GENERATE_EPHEMERAL_SECRET_MAX_RETRIES {
                        // Last attempt for this epoch.
                        state.gen_height = u64::MAX;
                    }
                    state.gen_in_progress = true;

                    // Submitting the transaction can take a while, so run
                    // generation on a detached task and only observe the
                    // outcome.
                    let target_epoch = state.epoch + 1;
                    let km_status = state.current_status.clone().unwrap();
                    let rt_status = state.current_runtime_status.clone().unwrap();
                    let km = self.backends.km.clone();
                    let registry = self.backends.registry.clone();
                    let consensus = self.backends.consensus.clone();
                    let identity = self.identity.clone();
                    let shared = self.shared.clone();
                    let cancel = self.cancel.clone();
                    let done_tx = gen_done_tx.clone();
                    let retry = state.gen_retry - 1;
                    tokio::spawn(async move {
                        let result = generate_ephemeral_secret(
                            runtime_id,
                            target_epoch,
                            &km_status,
                            &rt_status,
                            km.as_ref(),
                            registry.as_ref(),
                            consensus.as_ref(),
                            identity.as_ref(),
                            hosted.as_ref(),
                            &cancel,
                        )
                        .await;
                        match result {
                            Ok(()) => {
                                {
                                    let mut shared = shared.write().await;
                                    shared.counters.generated_secrets += 1;
                                    shared.counters.last_generated_epoch = Some(target_epoch);
                                }
                                let _ = done_tx.send(true).await;
                            }
                            Err(err) => {
                                error!(error = %err, retry, "failed to generate ephemeral secret");
                                let _ = done_tx.send(false).await;
                            }
                        }
                    });
                }

                Some(ok) = gen_done_rx.recv() => {
                    // Disarm generation unless a new height was chosen in
                    // the meantime; a fresh epoch resets the retry counter.
                    if ok && state.gen_retry > 0 {
                        state.gen_height = u64::MAX;
                    }
                    state.gen_in_progress = false;
                }

                Some(()) = load_rx.recv() => {
                    let Some(hosted) = state.hosted.clone() else {
                        continue;
                    };
                    let mut failed = VecDeque::new();
                    while let Some(secret) = state.pending_secrets.pop_front() {
                        match load_ephemeral_secret(hosted.as_ref(), &self.cancel, &secret).await {
                            Ok(()) => {
                                let epoch = secret.secret.epoch;
                                let mut shared = self.shared.write().await;
                                shared.counters.loaded_secrets += 1;
                                shared.counters.last_loaded_epoch = Some(
                                    shared
                                        .counters
                                        .last_loaded_epoch
                                        .map_or(epoch, |last| last.max(epoch)),
                                );
                            }
                            Err(err) => {
                                error!(
                                    error = %err,
                                    retry = state.load_retry,
                                    "failed to load ephemeral secret"
                                );
                                failed.push_back(secret);
                            }
                        }
                    }
                    state.pending_secrets = failed;

                    // The retry cap applies to the whole queue, not per
                    // secret.
                    state.load_retry += 1;
                    if state.load_retry > LOAD_EPHEMERAL_SECRET_MAX_RETRIES {
                        state.pending_secrets.clear();
                    }
                }

                _ = async { init_retry_sleep.as_mut().unwrap().as_mut().await }, if init_retry_sleep.is_some() => {
                    init_retry_sleep = None;
                    if state.current_status.is_some() && state.current_runtime_status.is_some() {
                        self.try_update_status(&mut state, &mut init_retry_sleep, &access_tx).await;
                    } else {
                        arm_init_retry(&mut state.init_retry, &mut init_retry_sleep);
                    }
                }
            }
        }
    }

    /// Provisions the hosted key manager runtime, starts it and activates
    /// the single bundle version. Key managers always use the version given
    /// to them in the bundle so replication stays possible during upgrades.
    async fn provision_runtime(
        &self,
        state: &mut LoopState,
        host_events: &mut Option<mpsc::Receiver<HostEvent>>,
    ) -> Result<()> {
        info!("provisioning key manager runtime");
        let provisioned = self.backends.host.provision().await?;
        let runtime = provisioned.runtime;
        *host_events = Some(provisioned.events);

        runtime.start().await?;
        runtime.set_version(provisioned.version).await?;

        state.hosted = Some(runtime.clone());
        self.shared.write().await.hosted = Some(runtime);
        Ok(())
    }

    /// Reconciles the enclave with the latest status: initializes it,
    /// verifies the attested response, registers the node and rechecks
    /// client runtimes. Arms the retry backoff on failure.
    async fn try_update_status(
        &self,
        state: &mut LoopState,
        init_retry_sleep: &mut Option<Pin<Box<Sleep>>>,
        access_tx: &mpsc::Sender<AccessListUpdate>,
    ) {
        let (Some(status), Some(rt_status), Some(hosted)) = (
            state.current_status.clone(),
            state.current_runtime_status.clone(),
            state.hosted.clone(),
        ) else {
            return;
        };

        match self.update_status(&status, &rt_status, &hosted).await {
            Ok(()) => {
                state.init_retry = None;
                *init_retry_sleep = None;

                // New runtimes can be allowed with the policy update.
                if let Err(err) = self.recheck_all_runtimes(&status, state, access_tx).await {
                    error!(error = %err, "failed rechecking runtimes");
                }
            }
            Err(err) => {
                error!(error = %err, "failed to handle status update");
                arm_init_retry(&mut state.init_retry, init_retry_sleep);
            }
        }
    }

    /// One reconciliation pass: `init` the enclave, verify the signed
    /// response, register availability and cache the results.
    async fn update_status(
        &self,
        status: &Status,
        runtime_status: &RuntimeStatus,
        hosted: &Arc<dyn HostedRuntime>,
    ) -> Result<()> {
        let policy = match &status.policy {
            Some(policy) => cbor::to_vec(policy)?,
            None => vec![],
        };
        let args = InitRequest {
            checksum: status.checksum.clone(),
            policy,
            may_generate: self.config.may_generate,
        };

        let signed: SignedInitResponse =
            local_call(hosted.as_ref(), &self.cancel, RPC_METHOD_INIT, &args)
                .await
                .map_err(|err| {
                    error!(error = %err, "failed to initialize enclave");
                    err
                })?;

        attestation::verify_init_response(&signed, runtime_status.capability_tee.as_ref())?;

        if !signed.init_response.is_secure {
            warn!("key manager enclave build is INSECURE");
        }
        info!(
            checksum = %hex::encode(&signed.init_response.checksum),
            "key manager initialized"
        );

        // Register as we are now ready to handle requests.
        let claim = AvailabilityClaim {
            runtime_id: self.config.runtime_id,
            version: runtime_status.version,
            extra_info: Some(cbor::to_vec(&signed)?),
            capability_tee: runtime_status.capability_tee.clone(),
        };
        self.backends.role_provider.set_available(claim).await?;
        info!("key manager registered");

        // Signal that we are initialized. The flag never regresses.
        if !*self.init_tx.borrow() {
            self.init_tx.send_replace(true);
        }

        let mut shared = self.shared.write().await;
        shared.policy = status.policy.clone();
        shared.policy_checksum = Some(signed.init_response.policy_checksum.clone());
        shared.enclave_status = Some(signed);
        shared.counters.policy_updates += 1;

        Ok(())
    }

    /// Starts watchers for any registered runtime newly authorized by the
    /// policy.
    async fn recheck_all_runtimes(
        &self,
        status: &Status,
        state: &mut LoopState,
        access_tx: &mpsc::Sender<AccessListUpdate>,
    ) -> Result<()> {
        let runtimes = self.backends.registry.get_runtimes().await.map_err(|err| {
            error!(error = %err, "failed querying runtimes");
            err
        })?;
        for runtime in &runtimes {
            if let Err(err) = self
                .start_client_runtime_watcher(runtime, Some(status), state, access_tx)
                .await
            {
                error!(error = %err, "failed to start runtime watcher");
            }
        }
        Ok(())
    }

    /// Starts a committee watcher for a runtime that uses this key manager,
    /// if the policy allows it and none is running yet.
    async fn start_client_runtime_watcher(
        &self,
        runtime: &RuntimeDescriptor,
        status: Option<&Status>,
        state: &mut LoopState,
        access_tx: &mpsc::Sender<AccessListUpdate>,
    ) -> Result<()> {
        let Some(status) = status else {
            return Ok(());
        };
        if !status.is_initialized {
            return Ok(());
        }
        if runtime.kind != RuntimeKind::Compute
            || runtime.key_manager != Some(self.config.runtime_id)
        {
            return Ok(());
        }
        if state.watchers.contains_key(&runtime.id) {
            return Ok(());
        }

        info!(runtime_id = %runtime.id, "seen new runtime using us as a key manager");

        // Insecure test key managers can run without a policy; every runtime
        // is allowed then.
        let allowed = match &status.policy {
            None => !status.is_secure,
            Some(policy) => policy.may_query(&runtime.id),
        };
        if !allowed {
            warn!(
                runtime_id = %runtime.id,
                "runtime not found in keymanager policy, skipping"
            );
            return Ok(());
        }

        let handle = ClientRuntimeWatcher::spawn(
            runtime.id,
            self.backends.registry.clone(),
            self.backends.scheduler.clone(),
            access_tx.clone(),
            self.cancel.child_token(),
        );
        state.watchers.insert(runtime.id, handle);
        self.shared.write().await.counters.compute_runtimes += 1;
        Ok(())
    }

    /// Installs the key manager committee itself on the access list under
    /// our own runtime ID, so committee members can replicate from us.
    async fn update_km_node_access(&self, status: &Status) {
        let mut nodes = Vec::with_capacity(status.nodes.len());
        for id in &status.nodes {
            match self.backends.registry.get_node(id).await {
                Ok(node) => nodes.push(node),
                Err(WorkerError::NoSuchNode) => continue,
                Err(err) => {
                    warn!(node_id = %id, error = %err, "failed to fetch key manager node");
                }
            }
        }
        self.set_access_list(self.config.runtime_id, &nodes).await;
    }

    async fn set_access_list(&self, runtime_id: Namespace, nodes: &[Node]) {
        self.shared
            .write()
            .await
            .access_list
            .update_runtime(runtime_id, nodes);
    }
}

impl WorkerHandle {
    /// Routes an enclave RPC received from the p2p layer. `LocalQuery` is
    /// always refused; Noise-session calls pass the access-list gate first.
    pub async fn call_enclave(
        &self,
        peer_id: Option<PeerId>,
        data: Vec<u8>,
        kind: Kind,
    ) -> Result<Vec<u8>> {
        match kind {
            Kind::NoiseSession => {
                let peer = peer_id.ok_or(WorkerError::NotAuthorized)?;

                // Peek into the frame to extract the method. The enclave
                // checks the plaintext again inside the session, so a lying
                // peer only gets its request rejected there.
                let frame: Frame = cbor::from_slice(&data)
                    .map_err(|_| WorkerError::InvalidArgument("malformed request".to_string()))?;

                if !is_publicly_callable(&frame.untrusted_plaintext)
                    && !self.private_peers.contains(&peer)
                {
                    let allowed = self.shared.read().await.access_list.is_allowed(&peer);
                    if !allowed {
                        return Err(WorkerError::NotAuthorized);
                    }
                }
            }
            Kind::InsecureQuery => {
                // Insecure queries are always allowed.
            }
            Kind::LocalQuery => return Err(WorkerError::UnsupportedKind),
        }

        // Wait for initialization to complete.
        let mut initialized = self.initialized.clone();
        tokio::select! {
            _ = self.cancel.cancelled() => return Err(WorkerError::Cancelled),
            result = tokio::time::timeout(RPC_CALL_TIMEOUT, initialized.wait_for(|ready| *ready)) => {
                result
                    .map_err(|_| WorkerError::Cancelled)?
                    .map_err(|_| WorkerError::Cancelled)?;
            }
        }

        let hosted = self
            .shared
            .read()
            .await
            .hosted
            .clone()
            .ok_or_else(|| WorkerError::Host("hosted runtime not available".to_string()))?;
        enclave_rpc::remote_call(hosted.as_ref(), &self.cancel, data, kind).await
    }

    /// Receiver that flips to `true` once the worker is initialized,
    /// registered and ready to serve requests.
    pub fn initialized(&self) -> watch::Receiver<bool> {
        self.initialized.clone()
    }

    pub async fn wait_initialized(&self) {
        let mut initialized = self.initialized.clone();
        let _ = initialized.wait_for(|ready| *ready).await;
    }

    /// Requests worker shutdown.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Read-only snapshot of the worker state.
    pub async fn status(&self) -> WorkerStatus {
        let shared = self.shared.read().await;
        WorkerStatus {
            initialized: *self.initialized.borrow(),
            enclave_status: shared.enclave_status.clone(),
            policy: shared.policy.clone(),
            policy_checksum: shared.policy_checksum.clone(),
            counters: shared.counters.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde::Serialize;

    use super::*;
    use crate::api::{
        insecure_rak, insecure_rek, public_key_of, sign_encrypted_ephemeral_secret, test_signers,
        EncryptedEphemeralSecret, EncryptedSecret, EnclaveIdentity, EnclavePolicySgx, PolicySgx,
        PublicKey, X25519PublicKey, CHECKSUM_SIZE, METHOD_PUBLISH_EPHEMERAL_SECRET,
        RPC_METHOD_GENERATE_EPHEMERAL_SECRET, RPC_METHOD_INIT, RPC_METHOD_LOAD_EPHEMERAL_SECRET,
    };
    use crate::backend::{
        Committee, CommitteeKind, CommitteeMember, NodeRuntime, P2pInfo, TeeHardware,
    };
    use crate::local::{
        insecure_status, LocalChain, LocalEnclave, LocalRoleProvider, LocalRuntimeHost,
    };

    const KM_RUNTIME: Namespace = Namespace([42; 32]);

    struct Harness {
        chain: Arc<LocalChain>,
        enclave: Arc<LocalEnclave>,
        #[allow(dead_code)]
        host: Arc<LocalRuntimeHost>,
        role_provider: Arc<LocalRoleProvider>,
        identity: Arc<Identity>,
        handle: WorkerHandle,
        task: tokio::task::JoinHandle<Result<()>>,
    }

    impl Harness {
        /// Sets up the chain with the key manager runtime and this node
        /// registered, then starts the worker. `setup` runs before the
        /// worker subscribes to any stream.
        fn start(configure: impl FnOnce(&mut Config), setup: impl FnOnce(&LocalChain)) -> Self {
            let chain = LocalChain::new();
            let enclave = LocalEnclave::new(KM_RUNTIME, Version::new(1, 0, 0));
            let host = LocalRuntimeHost::new(enclave.clone());
            let role_provider = LocalRoleProvider::new();
            let identity = Arc::new(Identity::new(ed25519_dalek::SigningKey::from_bytes(
                &[7u8; 32],
            )));

            chain.register_runtime(RuntimeDescriptor {
                id: KM_RUNTIME,
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
                    id: KM_RUNTIME,
                    version: Version::new(1, 0, 0),
                    capability_tee: None,
                    extra_info: None,
                }],
            });
            setup(&chain);

            let mut config = Config::new(KM_RUNTIME);
            configure(&mut config);

            let backends = Backends {
                km: chain.clone(),
                consensus: chain.clone(),
                registry: chain.clone(),
                scheduler: chain.clone(),
                beacon: chain.clone(),
                host: host.clone(),
                role_provider: role_provider.clone(),
            };
            let (worker, handle) = Worker::new(config, identity.clone(), backends);
            let task = tokio::spawn(worker.run());

            Self {
                chain,
                enclave,
                host,
                role_provider,
                identity,
                handle,
                task,
            }
        }

        fn node_id(&self) -> PublicKey {
            self.identity.node_id()
        }

        async fn wait_initialized(&self) {
            tokio::time::timeout(Duration::from_secs(10), self.handle.wait_initialized())
                .await
                .expect("worker did not initialize");
        }

        async fn stop(self) {
            self.handle.stop();
            let _ = tokio::time::timeout(Duration::from_secs(10), self.task)
                .await
                .expect("worker did not stop");
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    /// Polls an `.await`-ing condition until it holds.
    macro_rules! wait_until_async {
        ($cond:expr) => {{
            let mut ok = false;
            for _ in 0..1000 {
                if $cond {
                    ok = true;
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            assert!(ok, "condition not reached");
        }};
    }

    fn count_calls(enclave: &LocalEnclave, method: &str) -> usize {
        enclave.calls().iter().filter(|m| *m == method).count()
    }

    fn test_secret(runtime_id: Namespace, epoch: EpochTime) -> SignedEncryptedEphemeralSecret {
        sign_encrypted_ephemeral_secret(
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
        .unwrap()
    }

    fn policy_for(runtime_ids: &[Namespace]) -> SignedPolicySgx {
        SignedPolicySgx {
            policy: PolicySgx {
                serial: 1,
                id: KM_RUNTIME,
                enclaves: vec![EnclavePolicySgx {
                    id: EnclaveIdentity::default(),
                    may_query: runtime_ids.iter().map(|id| (*id, vec![])).collect(),
                    may_replicate: vec![],
                }],
            },
            signatures: vec![],
        }
    }

    fn initialized_status(nodes: Vec<PublicKey>, policy: Option<SignedPolicySgx>) -> Status {
        Status {
            id: KM_RUNTIME,
            is_initialized: true,
            is_secure: false,
            checksum: vec![3; CHECKSUM_SIZE],
            nodes,
            policy,
            rsk: None,
        }
    }

    #[derive(Serialize)]
    struct WireFrame<'a> {
        untrusted_plaintext: &'a str,
        #[serde(with = "serde_bytes")]
        payload: &'a [u8],
    }

    fn frame(method: &str, payload: &[u8]) -> Vec<u8> {
        cbor::to_vec(&WireFrame {
            untrusted_plaintext: method,
            payload,
        })
        .unwrap()
    }

    /// S1: cold start of an insecure key manager.
    #[tokio::test]
    async fn test_cold_start_insecure() {
        let harness = Harness::start(|_| {}, |_| {});
        harness
            .chain
            .set_status(insecure_status(KM_RUNTIME, vec![harness.node_id()]));

        harness.wait_initialized().await;

        // Exactly one init call with an empty checksum, empty policy and
        // may_generate set.
        assert_eq!(count_calls(&harness.enclave, RPC_METHOD_INIT), 1);
        let init = harness.enclave.last_init_request().unwrap();
        assert!(init.checksum.is_empty());
        assert!(init.policy.is_empty());
        assert!(init.may_generate);

        // The response was verified against the insecure RAK and cached.
        let status = harness.handle.status().await;
        let enclave_status = status.enclave_status.unwrap();
        enclave_status.verify(&insecure_rak()).unwrap();
        assert!(!enclave_status.init_response.is_secure);

        // Registration carried the CBOR-encoded response as extra info.
        let claims = harness.role_provider.claims();
        let last = claims.last().unwrap();
        assert_eq!(last.runtime_id, KM_RUNTIME);
        let extra: SignedInitResponse = cbor::from_slice(last.extra_info.as_ref().unwrap()).unwrap();
        assert_eq!(extra, enclave_status);

        // Initialization is monotonic across further status updates.
        harness
            .chain
            .set_status(insecure_status(KM_RUNTIME, vec![harness.node_id()]));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(*harness.handle.initialized().borrow());

        harness.stop().await;
    }

    /// S2: epoch tick when the next epoch's secret is already published.
    #[tokio::test]
    async fn test_epoch_tick_already_published() {
        let harness = Harness::start(
            |_| {},
            |chain| {
                // Published before the worker subscribes, so only the
                // consensus query can discover it.
                chain.publish_secret(test_secret(KM_RUNTIME, 2));
            },
        );
        harness
            .chain
            .set_status(insecure_status(KM_RUNTIME, vec![harness.node_id()]));
        harness.wait_initialized().await;

        let epoch = harness.chain.advance_epoch();
        assert_eq!(epoch, 1);
        harness.chain.advance_block();

        // The generation task observes the published secret and disarms
        // without calling the enclave.
        tokio::time::sleep(Duration::from_millis(200)).await;
        for _ in 0..3 {
            harness.chain.advance_block();
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(
            count_calls(&harness.enclave, RPC_METHOD_GENERATE_EPHEMERAL_SECRET),
            0
        );

        harness.stop().await;
    }

    /// S3: epoch tick with no published secret; this node generates and
    /// publishes it.
    #[tokio::test]
    async fn test_epoch_tick_generates_and_publishes() {
        let harness = Harness::start(|_| {}, |_| {});
        harness
            .chain
            .set_status(insecure_status(KM_RUNTIME, vec![harness.node_id()]));
        harness.wait_initialized().await;

        let epoch = harness.chain.advance_epoch();

        // Blocks arrive until the generated secret lands on chain.
        for _ in 0..200 {
            if harness.chain.has_secret(&KM_RUNTIME, epoch + 1) {
                break;
            }
            harness.chain.advance_block();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(harness.chain.has_secret(&KM_RUNTIME, epoch + 1));

        assert_eq!(
            count_calls(&harness.enclave, RPC_METHOD_GENERATE_EPHEMERAL_SECRET),
            1
        );
        let txs = harness.chain.transactions();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].method, METHOD_PUBLISH_EPHEMERAL_SECRET);

        // The published secret verifies against the committee REK set and
        // the insecure RAK.
        let secret: SignedEncryptedEphemeralSecret = cbor::from_slice(&txs[0].body).unwrap();
        let reks = std::collections::BTreeSet::from([insecure_rek()]);
        secret.verify(epoch + 1, &reks, &insecure_rak()).unwrap();

        // Further blocks do not regenerate; the height is disarmed.
        for _ in 0..3 {
            harness.chain.advance_block();
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(
            count_calls(&harness.enclave, RPC_METHOD_GENERATE_EPHEMERAL_SECRET),
            1
        );

        harness.stop().await;
    }

    /// S4: the policy decides which runtimes get a committee watcher.
    #[tokio::test]
    async fn test_policy_rejects_runtime() {
        let allowed_id = Namespace([0xaa; 32]);
        let rejected_id = Namespace([0xbb; 32]);

        let harness = Harness::start(|_| {}, |_| {});
        harness.chain.set_status(initialized_status(
            vec![harness.node_id()],
            Some(policy_for(&[allowed_id])),
        ));
        harness.wait_initialized().await;

        harness.chain.register_runtime(RuntimeDescriptor {
            id: rejected_id,
            kind: RuntimeKind::Compute,
            key_manager: Some(KM_RUNTIME),
            tee_hardware: TeeHardware::Invalid,
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(harness.handle.status().await.counters.compute_runtimes, 0);

        harness.chain.register_runtime(RuntimeDescriptor {
            id: allowed_id,
            kind: RuntimeKind::Compute,
            key_manager: Some(KM_RUNTIME),
            tee_hardware: TeeHardware::Invalid,
        });
        wait_until_async!(harness.handle.status().await.counters.compute_runtimes == 1);

        harness.stop().await;
    }

    /// S5: peer authorization on the Noise-session path.
    #[tokio::test]
    async fn test_peer_authorization() {
        let client_runtime = Namespace([0xaa; 32]);

        // Committee member P1 for the client runtime.
        let member_signer = ed25519_dalek::SigningKey::from_bytes(&[9u8; 32]);
        let member_key = public_key_of(&member_signer);
        let member_peer = PeerId::from_p2p_public_key(&member_key).unwrap();

        let stranger_signer = ed25519_dalek::SigningKey::from_bytes(&[10u8; 32]);
        let stranger_peer =
            PeerId::from_p2p_public_key(&public_key_of(&stranger_signer)).unwrap();

        let private_signer = ed25519_dalek::SigningKey::from_bytes(&[11u8; 32]);
        let private_peer =
            PeerId::from_p2p_public_key(&public_key_of(&private_signer)).unwrap();

        let harness = Harness::start(
            |config| {
                config.private_peers.insert(private_peer);
            },
            |chain| {
                chain.register_node(Node {
                    id: member_key,
                    p2p: P2pInfo {
                        public_key: member_key,
                    },
                    runtimes: vec![],
                });
                chain.register_runtime(RuntimeDescriptor {
                    id: client_runtime,
                    kind: RuntimeKind::Compute,
                    key_manager: Some(KM_RUNTIME),
                    tee_hardware: TeeHardware::Invalid,
                });
                chain.set_committees(
                    client_runtime,
                    vec![Committee {
                        kind: CommitteeKind::ComputeExecutor,
                        runtime_id: client_runtime,
                        members: vec![CommitteeMember {
                            public_key: member_key,
                        }],
                    }],
                );
            },
        );
        harness.chain.set_status(initialized_status(
            vec![harness.node_id()],
            Some(policy_for(&[client_runtime])),
        ));
        harness.wait_initialized().await;

        // Wait until the committee watcher has installed P1.
        wait_until_async!(harness
            .handle
            .call_enclave(
                Some(member_peer),
                frame("secret_method", b"payload"),
                Kind::NoiseSession,
            )
            .await
            .is_ok());

        // A peer outside the access list is rejected for private methods,
        // irrespective of frame payload.
        let err = harness
            .handle
            .call_enclave(
                Some(stranger_peer),
                frame("secret_method", b"zzz"),
                Kind::NoiseSession,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::NotAuthorized));

        // Public methods and session establishment are open to anyone.
        for method in ["", "get_public_key", "get_public_ephemeral_key"] {
            harness
                .handle
                .call_enclave(Some(stranger_peer), frame(method, b"x"), Kind::NoiseSession)
                .await
                .unwrap();
        }

        // Private peers bypass the policy entirely.
        harness
            .handle
            .call_enclave(
                Some(private_peer),
                frame("secret_method", b"x"),
                Kind::NoiseSession,
            )
            .await
            .unwrap();

        // Insecure queries are always allowed, local queries never.
        harness
            .handle
            .call_enclave(None, frame("", b"x"), Kind::InsecureQuery)
            .await
            .unwrap();
        let err = harness
            .handle
            .call_enclave(None, frame("", b"x"), Kind::LocalQuery)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::UnsupportedKind));

        harness.stop().await;
    }

    /// S6: enclave warm-up replays the last twenty published secrets.
    #[tokio::test]
    async fn test_warm_up_loads_recent_secrets() {
        let harness = Harness::start(
            |_| {},
            |chain| {
                for _ in 0..25 {
                    chain.advance_epoch();
                }
                // Secrets for epochs 6..=25 are on chain.
                for epoch in 6..=25 {
                    chain.publish_secret(test_secret(KM_RUNTIME, epoch));
                }
            },
        );
        harness
            .chain
            .set_status(insecure_status(KM_RUNTIME, vec![harness.node_id()]));
        harness.wait_initialized().await;

        let enclave = harness.enclave.clone();
        wait_until(move || enclave.loaded_epochs().len() == 20).await;

        assert_eq!(
            count_calls(&harness.enclave, RPC_METHOD_LOAD_EPHEMERAL_SECRET),
            20
        );
        let loaded = harness.enclave.loaded_epochs();
        assert_eq!(loaded, (6..=25).collect::<Vec<_>>());

        let counters = harness.handle.status().await.counters;
        assert_eq!(counters.loaded_secrets, 20);
        assert_eq!(counters.last_loaded_epoch, Some(25));

        harness.stop().await;
    }

    /// Observed secrets are loaded into the enclave as they are published.
    #[tokio::test]
    async fn test_observed_secret_is_loaded() {
        let harness = Harness::start(|_| {}, |_| {});
        harness
            .chain
            .set_status(insecure_status(KM_RUNTIME, vec![harness.node_id()]));
        harness.wait_initialized().await;

        harness.chain.publish_secret(test_secret(KM_RUNTIME, 9));

        let enclave = harness.enclave.clone();
        wait_until(move || enclave.loaded_epochs() == vec![9]).await;

        harness.stop().await;
    }

    /// The pending queue is bounded and cleared after five failed load
    /// iterations.
    #[tokio::test]
    async fn test_load_queue_bounded_and_cleared() {
        let harness = Harness::start(|_| {}, |_| {});
        harness
            .chain
            .set_status(insecure_status(KM_RUNTIME, vec![harness.node_id()]));
        harness.wait_initialized().await;

        harness.enclave.set_fail_loads(true);
        for epoch in 1..=25 {
            harness.chain.publish_secret(test_secret(KM_RUNTIME, epoch));
        }

        // Each block retriggers a load iteration; after the cap the queue
        // is dropped.
        for _ in 0..(LOAD_EPHEMERAL_SECRET_MAX_RETRIES + 2) {
            harness.chain.advance_block();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let failed_loads = count_calls(&harness.enclave, RPC_METHOD_LOAD_EPHEMERAL_SECRET);
        assert!(failed_loads > 0);

        // Nothing is retried once the queue was cleared, even after the
        // enclave recovers.
        harness.enclave.set_fail_loads(false);
        harness.chain.advance_block();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(
            count_calls(&harness.enclave, RPC_METHOD_LOAD_EPHEMERAL_SECRET),
            failed_loads
        );
        assert!(harness.enclave.loaded_epochs().is_empty());

        harness.stop().await;
    }

    /// A disabled worker signals initialization immediately and exits.
    #[tokio::test]
    async fn test_disabled_worker() {
        let harness = Harness::start(|config| config.enabled = false, |_| {});
        harness.wait_initialized().await;
        let result = tokio::time::timeout(Duration::from_secs(5), harness.task)
            .await
            .expect("disabled worker did not exit")
            .unwrap();
        assert!(result.is_ok());
        assert!(harness.enclave.calls().is_empty());
    }
}
