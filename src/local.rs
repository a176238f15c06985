//! In-process backends for development mode and tests
//!
//! [`LocalChain`] implements every consensus-side capability against
//! in-memory state, and [`LocalEnclave`] emulates the key manager enclave,
//! signing its responses with the insecure RAK. Together they let the worker
//! run end-to-end on a single machine with no consensus node and no TEE,
//! mirroring the insecure test key manager setup.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::debug;

use crate::api::{
    default_gas_costs, insecure_rek, sign_encrypted_ephemeral_secret, sign_init_response,
    test_signers, ConsensusParameters, EncryptedEphemeralSecret, EncryptedSecret, EpochTime,
    Genesis, InitRequest, InitResponse, Namespace, PublicKey, SignedEncryptedEphemeralSecret,
    SignedPublicKey, Signature, Status, Transaction, X25519PublicKey,
    GenerateEphemeralSecretRequest, GenerateEphemeralSecretResponse, LoadEphemeralSecretRequest,
    METHOD_PUBLISH_EPHEMERAL_SECRET, RPC_METHOD_GENERATE_EPHEMERAL_SECRET,
    RPC_METHOD_GET_PUBLIC_EPHEMERAL_KEY, RPC_METHOD_GET_PUBLIC_KEY, RPC_METHOD_INIT,
    RPC_METHOD_LOAD_EPHEMERAL_SECRET,
};
use crate::backend::{
    AvailabilityClaim, Beacon, BeaconParameters, Block, CapabilityTee, Committee, Consensus,
    Identity, KeyManagerBackend, Node, Registry, RoleProvider, RuntimeDescriptor, Scheduler,
    Version,
};
use crate::cbor;
use crate::enclave_rpc::{self, DecodedRequest, Frame};
use crate::error::{Result, WorkerError};
use crate::host::{
    HostEvent, HostedRuntime, ProvisionedRuntime, RuntimeHostProvisioner, RuntimeRequest,
    RuntimeResponse,
};

const CHANNEL_CAPACITY: usize = 64;

/// Builds the status an insecure, not-yet-initialized key manager starts
/// from.
pub fn insecure_status(runtime_id: Namespace, nodes: Vec<PublicKey>) -> Status {
    Status {
        id: runtime_id,
        is_initialized: false,
        is_secure: false,
        checksum: vec![],
        nodes,
        policy: None,
        rsk: None,
    }
}

struct ChainState {
    statuses: HashMap<Namespace, Status>,
    secrets: HashMap<(Namespace, EpochTime), SignedEncryptedEphemeralSecret>,
    runtimes: HashMap<Namespace, RuntimeDescriptor>,
    nodes: HashMap<PublicKey, Node>,
    committees: HashMap<Namespace, Vec<Committee>>,
    epoch: EpochTime,
    epoch_first_blocks: HashMap<EpochTime, u64>,
    interval: u64,
    height: u64,
    transactions: Vec<Transaction>,
}

/// An in-memory consensus layer: key manager backend, block/transaction
/// surface, registry, scheduler and beacon in one.
pub struct LocalChain {
    state: Mutex<ChainState>,
    status_tx: broadcast::Sender<Status>,
    secret_tx: broadcast::Sender<SignedEncryptedEphemeralSecret>,
    epoch_tx: broadcast::Sender<EpochTime>,
    block_tx: broadcast::Sender<Block>,
    runtime_tx: broadcast::Sender<RuntimeDescriptor>,
    node_tx: broadcast::Sender<Node>,
}

impl LocalChain {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ChainState {
                statuses: HashMap::new(),
                secrets: HashMap::new(),
                runtimes: HashMap::new(),
                nodes: HashMap::new(),
                committees: HashMap::new(),
                epoch: 0,
                epoch_first_blocks: HashMap::from([(0, 1)]),
                interval: 1,
                height: 0,
                transactions: Vec::new(),
            }),
            status_tx: broadcast::channel(CHANNEL_CAPACITY).0,
            secret_tx: broadcast::channel(CHANNEL_CAPACITY).0,
            epoch_tx: broadcast::channel(CHANNEL_CAPACITY).0,
            block_tx: broadcast::channel(CHANNEL_CAPACITY).0,
            runtime_tx: broadcast::channel(CHANNEL_CAPACITY).0,
            node_tx: broadcast::channel(CHANNEL_CAPACITY).0,
        })
    }

    /// Records a key manager status and notifies watchers. The send happens
    /// under the state lock so subscription snapshots never race with it.
    pub fn set_status(&self, status: Status) {
        let mut state = self.state.lock().unwrap();
        state.statuses.insert(status.id, status.clone());
        let _ = self.status_tx.send(status);
    }

    /// Publishes an ephemeral secret, deduplicating per `(runtime, epoch)`
    /// the way consensus does. Returns whether the secret was accepted.
    pub fn publish_secret(&self, secret: SignedEncryptedEphemeralSecret) -> bool {
        let key = (secret.secret.runtime_id, secret.secret.epoch);
        {
            let mut state = self.state.lock().unwrap();
            if state.secrets.contains_key(&key) {
                return false;
            }
            state.secrets.insert(key, secret.clone());
        }
        let _ = self.secret_tx.send(secret);
        true
    }

    pub fn register_runtime(&self, runtime: RuntimeDescriptor) {
        let mut state = self.state.lock().unwrap();
        state.runtimes.insert(runtime.id, runtime.clone());
        let _ = self.runtime_tx.send(runtime);
    }

    pub fn register_node(&self, node: Node) {
        self.state.lock().unwrap().nodes.insert(node.id, node.clone());
        let _ = self.node_tx.send(node);
    }

    pub fn set_committees(&self, runtime_id: Namespace, committees: Vec<Committee>) {
        self.state
            .lock()
            .unwrap()
            .committees
            .insert(runtime_id, committees);
    }

    pub fn set_interval(&self, interval: u64) {
        self.state.lock().unwrap().interval = interval;
    }

    /// Starts the next epoch; its first block is the next block produced.
    pub fn advance_epoch(&self) -> EpochTime {
        let epoch = {
            let mut state = self.state.lock().unwrap();
            state.epoch += 1;
            let first = state.height + 1;
            let epoch = state.epoch;
            state.epoch_first_blocks.insert(epoch, first);
            epoch
        };
        let _ = self.epoch_tx.send(epoch);
        epoch
    }

    /// Produces the next block and notifies watchers.
    pub fn advance_block(&self) -> u64 {
        let height = {
            let mut state = self.state.lock().unwrap();
            state.height += 1;
            state.height
        };
        let _ = self.block_tx.send(Block { height });
        height
    }

    pub fn has_secret(&self, runtime_id: &Namespace, epoch: EpochTime) -> bool {
        self.state
            .lock()
            .unwrap()
            .secrets
            .contains_key(&(*runtime_id, epoch))
    }

    /// Transactions submitted so far, in order.
    pub fn transactions(&self) -> Vec<Transaction> {
        self.state.lock().unwrap().transactions.clone()
    }
}

fn forward<T: Clone + Send + 'static>(
    mut source: broadcast::Receiver<T>,
    initial: Vec<T>,
) -> mpsc::Receiver<T> {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    tokio::spawn(async move {
        for item in initial {
            if tx.send(item).await.is_err() {
                return;
            }
        }
        loop {
            match source.recv().await {
                Ok(item) => {
                    if tx.send(item).await.is_err() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    });
    rx
}

#[async_trait]
impl KeyManagerBackend for LocalChain {
    async fn get_status(&self, runtime_id: &Namespace) -> Result<Status> {
        self.state
            .lock()
            .unwrap()
            .statuses
            .get(runtime_id)
            .cloned()
            .ok_or(WorkerError::NoSuchStatus)
    }

    async fn get_statuses(&self, _height: u64) -> Result<Vec<Status>> {
        Ok(self.state.lock().unwrap().statuses.values().cloned().collect())
    }

    fn watch_statuses(&self) -> mpsc::Receiver<Status> {
        let state = self.state.lock().unwrap();
        let source = self.status_tx.subscribe();
        let current = state.statuses.values().cloned().collect();
        drop(state);
        forward(source, current)
    }

    async fn get_ephemeral_secret(
        &self,
        runtime_id: &Namespace,
        epoch: EpochTime,
    ) -> Result<SignedEncryptedEphemeralSecret> {
        self.state
            .lock()
            .unwrap()
            .secrets
            .get(&(*runtime_id, epoch))
            .cloned()
            .ok_or(WorkerError::NoSuchEphemeralSecret)
    }

    fn watch_ephemeral_secrets(&self) -> mpsc::Receiver<SignedEncryptedEphemeralSecret> {
        forward(self.secret_tx.subscribe(), vec![])
    }

    async fn state_to_genesis(&self, _height: u64) -> Result<Genesis> {
        Ok(Genesis {
            params: ConsensusParameters {
                gas_costs: default_gas_costs(),
            },
            statuses: self.state.lock().unwrap().statuses.values().cloned().collect(),
        })
    }
}

#[async_trait]
impl Consensus for LocalChain {
    async fn wait_synced(&self) {}

    fn watch_blocks(&self) -> mpsc::Receiver<Block> {
        forward(self.block_tx.subscribe(), vec![])
    }

    async fn sign_and_submit_tx(&self, _identity: &Identity, tx: Transaction) -> Result<()> {
        if tx.method == METHOD_PUBLISH_EPHEMERAL_SECRET {
            let secret: SignedEncryptedEphemeralSecret = cbor::from_slice(&tx.body)?;
            if !self.publish_secret(secret) {
                debug!("duplicate ephemeral secret publication dropped");
            }
        }
        self.state.lock().unwrap().transactions.push(tx);
        Ok(())
    }
}

#[async_trait]
impl Registry for LocalChain {
    async fn get_runtimes(&self) -> Result<Vec<RuntimeDescriptor>> {
        Ok(self.state.lock().unwrap().runtimes.values().cloned().collect())
    }

    async fn get_runtime(&self, id: &Namespace) -> Result<RuntimeDescriptor> {
        self.state
            .lock()
            .unwrap()
            .runtimes
            .get(id)
            .cloned()
            .ok_or_else(|| WorkerError::Backend(format!("no such runtime: {id}")))
    }

    async fn get_node(&self, id: &PublicKey) -> Result<Node> {
        self.state
            .lock()
            .unwrap()
            .nodes
            .get(id)
            .cloned()
            .ok_or(WorkerError::NoSuchNode)
    }

    fn watch_runtimes(&self) -> mpsc::Receiver<RuntimeDescriptor> {
        let state = self.state.lock().unwrap();
        let source = self.runtime_tx.subscribe();
        let current = state.runtimes.values().cloned().collect();
        drop(state);
        forward(source, current)
    }

    fn watch_node_updates(&self) -> mpsc::Receiver<Node> {
        forward(self.node_tx.subscribe(), vec![])
    }
}

#[async_trait]
impl Scheduler for LocalChain {
    async fn get_committees(&self, runtime_id: &Namespace) -> Result<Vec<Committee>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .committees
            .get(runtime_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl Beacon for LocalChain {
    async fn get_epoch(&self) -> Result<EpochTime> {
        Ok(self.state.lock().unwrap().epoch)
    }

    async fn get_epoch_block(&self, epoch: EpochTime) -> Result<u64> {
        self.state
            .lock()
            .unwrap()
            .epoch_first_blocks
            .get(&epoch)
            .copied()
            .ok_or_else(|| WorkerError::Backend(format!("unknown epoch: {epoch}")))
    }

    fn watch_latest_epoch(&self) -> mpsc::Receiver<EpochTime> {
        forward(self.epoch_tx.subscribe(), vec![])
    }

    async fn consensus_parameters(&self) -> Result<BeaconParameters> {
        Ok(BeaconParameters {
            interval: self.state.lock().unwrap().interval,
        })
    }
}

/// Registration sink that records availability claims.
#[derive(Default)]
pub struct LocalRoleProvider {
    claims: Mutex<Vec<AvailabilityClaim>>,
    available: AtomicBool,
}

impl LocalRoleProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn claims(&self) -> Vec<AvailabilityClaim> {
        self.claims.lock().unwrap().clone()
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RoleProvider for LocalRoleProvider {
    async fn set_available(&self, claim: AvailabilityClaim) -> Result<()> {
        self.claims.lock().unwrap().push(claim);
        self.available.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn set_unavailable(&self) {
        self.available.store(false, Ordering::SeqCst);
    }
}

struct EnclaveState {
    init: Option<crate::api::SignedInitResponse>,
    last_init_request: Option<InitRequest>,
    loaded: BTreeMap<EpochTime, SignedEncryptedEphemeralSecret>,
}

/// Emulated key manager enclave. Responses are signed with the insecure RAK,
/// matching what a real enclave does in a non-TEE build.
pub struct LocalEnclave {
    runtime_id: Namespace,
    rak: ed25519_dalek::SigningKey,
    committee_reks: Mutex<BTreeSet<X25519PublicKey>>,
    state: Mutex<EnclaveState>,
    calls: Mutex<Vec<String>>,
    fail_loads: AtomicBool,
    events_tx: Mutex<Option<mpsc::Sender<HostEvent>>>,
    capability_tee: Mutex<Option<CapabilityTee>>,
    version: Version,
}

impl LocalEnclave {
    pub fn new(runtime_id: Namespace, version: Version) -> Arc<Self> {
        Arc::new(Self {
            runtime_id,
            rak: test_signers()[0].clone(),
            committee_reks: Mutex::new(BTreeSet::from([insecure_rek()])),
            state: Mutex::new(EnclaveState {
                init: None,
                last_init_request: None,
                loaded: BTreeMap::new(),
            }),
            calls: Mutex::new(Vec::new()),
            fail_loads: AtomicBool::new(false),
            events_tx: Mutex::new(None),
            capability_tee: Mutex::new(None),
            version,
        })
    }

    /// Method names of all local calls dispatched so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn last_init_request(&self) -> Option<InitRequest> {
        self.state.lock().unwrap().last_init_request.clone()
    }

    /// Epochs of the secrets currently loaded into the enclave.
    pub fn loaded_epochs(&self) -> Vec<EpochTime> {
        self.state.lock().unwrap().loaded.keys().copied().collect()
    }

    /// REKs the enclave encrypts generated secrets to.
    pub fn set_committee_reks(&self, reks: impl IntoIterator<Item = X25519PublicKey>) {
        *self.committee_reks.lock().unwrap() = reks.into_iter().collect();
    }

    /// Makes subsequent `load_ephemeral_secret` calls fail.
    pub fn set_fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    pub fn set_capability_tee(&self, tee: Option<CapabilityTee>) {
        *self.capability_tee.lock().unwrap() = tee;
    }

    fn attach_events(&self, tx: mpsc::Sender<HostEvent>) {
        *self.events_tx.lock().unwrap() = Some(tx);
    }

    fn handle_local(&self, request: &[u8]) -> Result<Vec<u8>> {
        let decoded: DecodedRequest = cbor::from_slice(request)?;
        self.calls.lock().unwrap().push(decoded.method.clone());

        match decoded.method.as_str() {
            RPC_METHOD_INIT => {
                let args: InitRequest = decoded
                    .args
                    .deserialized()
                    .map_err(|e| WorkerError::InvalidArgument(e.to_string()))?;
                let policy_checksum: [u8; 32] = Sha256::digest(&args.policy).into();
                let response = InitResponse {
                    is_secure: false,
                    checksum: args.checksum.clone(),
                    policy_checksum: policy_checksum.to_vec(),
                    rsk: None,
                };
                let signed = sign_init_response(&self.rak, response)?;
                let mut state = self.state.lock().unwrap();
                state.last_init_request = Some(args);
                state.init = Some(signed.clone());
                enclave_rpc::encode_success(&signed)
            }
            RPC_METHOD_GENERATE_EPHEMERAL_SECRET => {
                let args: GenerateEphemeralSecretRequest = decoded
                    .args
                    .deserialized()
                    .map_err(|e| WorkerError::InvalidArgument(e.to_string()))?;
                let mut rng = rand::thread_rng();
                let ciphertexts = self
                    .committee_reks
                    .lock()
                    .unwrap()
                    .iter()
                    .map(|rek| {
                        let mut ciphertext = vec![0u8; 48];
                        rng.fill_bytes(&mut ciphertext);
                        (*rek, serde_bytes::ByteBuf::from(ciphertext))
                    })
                    .collect();
                let secret = EncryptedEphemeralSecret {
                    runtime_id: self.runtime_id,
                    epoch: args.epoch,
                    secret: EncryptedSecret {
                        pub_key: X25519PublicKey([13; 32]),
                        ciphertexts,
                    },
                };
                let signed = sign_encrypted_ephemeral_secret(&self.rak, secret)?;
                enclave_rpc::encode_success(&GenerateEphemeralSecretResponse {
                    signed_secret: signed,
                })
            }
            RPC_METHOD_LOAD_EPHEMERAL_SECRET => {
                if self.fail_loads.load(Ordering::SeqCst) {
                    return enclave_rpc::encode_error("replication failed");
                }
                let args: LoadEphemeralSecretRequest = decoded
                    .args
                    .deserialized()
                    .map_err(|e| WorkerError::InvalidArgument(e.to_string()))?;
                let epoch = args.signed_secret.secret.epoch;
                self.state
                    .lock()
                    .unwrap()
                    .loaded
                    .insert(epoch, args.signed_secret);
                enclave_rpc::encode_success(&())
            }
            RPC_METHOD_GET_PUBLIC_KEY | RPC_METHOD_GET_PUBLIC_EPHEMERAL_KEY => {
                enclave_rpc::encode_success(&SignedPublicKey {
                    key: insecure_rek(),
                    checksum: vec![],
                    signature: Signature::default(),
                    expiration: None,
                })
            }
            other => enclave_rpc::encode_error(&format!("method not supported: {other}")),
        }
    }
}

#[async_trait]
impl HostedRuntime for LocalEnclave {
    async fn start(&self) -> Result<()> {
        let event = HostEvent::Started {
            version: self.version,
            capability_tee: self.capability_tee.lock().unwrap().clone(),
        };
        let tx = self.events_tx.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx.send(event).await;
        }
        Ok(())
    }

    async fn stop(&self) {
        let tx = self.events_tx.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx.send(HostEvent::Stopped).await;
        }
    }

    async fn set_version(&self, version: Version) -> Result<()> {
        if version != self.version {
            return Err(WorkerError::Host(format!(
                "version {version} not in bundle"
            )));
        }
        Ok(())
    }

    async fn call(&self, request: RuntimeRequest) -> Result<RuntimeResponse> {
        match request {
            RuntimeRequest::LocalRpcCall { request } => Ok(RuntimeResponse::LocalRpcResponse {
                response: self.handle_local(&request)?,
            }),
            RuntimeRequest::RpcCall { request, kind: _ } => {
                // Echo the frame payload; session handling happens inside a
                // real enclave.
                let frame: Frame = cbor::from_slice(&request)?;
                Ok(RuntimeResponse::RpcResponse {
                    response: frame.payload.into_vec(),
                })
            }
        }
    }
}

/// Provisions the emulated enclave as the hosted runtime.
pub struct LocalRuntimeHost {
    enclave: Arc<LocalEnclave>,
    provisioned_tx: watch::Sender<bool>,
}

impl LocalRuntimeHost {
    pub fn new(enclave: Arc<LocalEnclave>) -> Arc<Self> {
        Arc::new(Self {
            enclave,
            provisioned_tx: watch::channel(false).0,
        })
    }

    /// Waits until the worker has provisioned the runtime.
    pub async fn wait_provisioned(&self) {
        let mut rx = self.provisioned_tx.subscribe();
        let _ = rx.wait_for(|provisioned| *provisioned).await;
    }

    /// Injects a host lifecycle event, e.g. a restart notification.
    pub async fn emit(&self, event: HostEvent) {
        self.wait_provisioned().await;
        let tx = self.enclave.events_tx.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx.send(event).await;
        }
    }
}

#[async_trait]
impl RuntimeHostProvisioner for LocalRuntimeHost {
    async fn provision(&self) -> Result<ProvisionedRuntime> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.enclave.attach_events(tx);
        self.provisioned_tx.send_replace(true);
        Ok(ProvisionedRuntime {
            runtime: self.enclave.clone(),
            events: rx,
            version: self.enclave.version,
        })
    }
}
