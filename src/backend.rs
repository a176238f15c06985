//! Capability interfaces for the consensus-layer collaborators
//!
//! The worker never talks to a concrete consensus implementation. Each
//! collaborator (key manager backend, consensus submission, registry,
//! scheduler, beacon, registration) is a narrow trait injected at
//! construction, so the worker can be driven by the real node services or by
//! the in-process backends from [`crate::local`].

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::api::{
    EpochTime, Genesis, Namespace, PublicKey, SignedEncryptedEphemeralSecret, SignedInitResponse,
    Status, Transaction, X25519PublicKey,
};
use crate::cbor;
use crate::error::{Result, WorkerError};

/// Runtime bundle version.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl Version {
    pub fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// TEE hardware kind advertised for a runtime.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TeeHardware {
    #[default]
    Invalid,
    IntelSgx,
    Other(u8),
}

impl TeeHardware {
    pub fn as_u8(self) -> u8 {
        match self {
            TeeHardware::Invalid => 0,
            TeeHardware::IntelSgx => 1,
            TeeHardware::Other(v) => v,
        }
    }
}

impl From<u8> for TeeHardware {
    fn from(v: u8) -> Self {
        match v {
            0 => TeeHardware::Invalid,
            1 => TeeHardware::IntelSgx,
            other => TeeHardware::Other(other),
        }
    }
}

impl Serialize for TeeHardware {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_u8())
    }
}

impl<'de> Deserialize<'de> for TeeHardware {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        Ok(TeeHardware::from(u8::deserialize(deserializer)?))
    }
}

/// Attested TEE capability of a runtime instance.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityTee {
    pub hardware: TeeHardware,
    pub rak: PublicKey,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rek: Option<X25519PublicKey>,
}

/// Per-runtime entry in a node descriptor.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NodeRuntime {
    pub id: Namespace,
    pub version: Version,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capability_tee: Option<CapabilityTee>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_info: Option<serde_bytes::ByteBuf>,
}

/// P2P transport info advertised by a node.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct P2pInfo {
    pub public_key: PublicKey,
}

/// Registry node descriptor, trimmed to the fields the worker reads.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Node {
    pub id: PublicKey,
    pub p2p: P2pInfo,
    pub runtimes: Vec<NodeRuntime>,
}

impl Node {
    /// Returns this node's entry for the given runtime, skipping version
    /// checks the way key managers do (they run exactly one version).
    pub fn runtime(&self, id: &Namespace) -> Option<&NodeRuntime> {
        self.runtimes.iter().find(|rt| &rt.id == id)
    }
}

/// Registered runtime kind.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeKind {
    #[default]
    Invalid,
    Compute,
    KeyManager,
}

/// Registry runtime descriptor, trimmed to the fields the worker reads.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RuntimeDescriptor {
    pub id: Namespace,
    pub kind: RuntimeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_manager: Option<Namespace>,
    pub tee_hardware: TeeHardware,
}

/// Scheduler committee kind.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommitteeKind {
    #[default]
    Invalid,
    ComputeExecutor,
}

/// A single elected committee member.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CommitteeMember {
    pub public_key: PublicKey,
}

/// An elected committee for a runtime.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Committee {
    pub kind: CommitteeKind,
    pub runtime_id: Namespace,
    pub members: Vec<CommitteeMember>,
}

/// A consensus block, trimmed to the height.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct Block {
    pub height: u64,
}

/// Beacon consensus parameters.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct BeaconParameters {
    /// Epoch interval in blocks.
    pub interval: u64,
}

/// Node identity: the long-term node signing key.
pub struct Identity {
    pub node_signer: ed25519_dalek::SigningKey,
}

impl Identity {
    pub fn new(node_signer: ed25519_dalek::SigningKey) -> Self {
        Self { node_signer }
    }

    /// Public node identifier.
    pub fn node_id(&self) -> PublicKey {
        crate::api::public_key_of(&self.node_signer)
    }
}

/// Key manager management backend (consensus consumer interface).
#[async_trait]
pub trait KeyManagerBackend: Send + Sync {
    /// Returns the key manager status for the given runtime.
    async fn get_status(&self, runtime_id: &Namespace) -> Result<Status>;

    /// Returns all tracked key manager statuses at the given height.
    async fn get_statuses(&self, height: u64) -> Result<Vec<Status>>;

    /// Subscribes to key manager status updates. The current status is
    /// delivered immediately upon subscription.
    fn watch_statuses(&self) -> mpsc::Receiver<Status>;

    /// Returns the ephemeral secret published for the given runtime and
    /// epoch, or `NoSuchEphemeralSecret`.
    async fn get_ephemeral_secret(
        &self,
        runtime_id: &Namespace,
        epoch: EpochTime,
    ) -> Result<SignedEncryptedEphemeralSecret>;

    /// Subscribes to ephemeral secret publications.
    fn watch_ephemeral_secrets(&self) -> mpsc::Receiver<SignedEncryptedEphemeralSecret>;

    /// Returns the genesis state at the given height.
    async fn state_to_genesis(&self, height: u64) -> Result<Genesis>;
}

/// Consensus block and transaction surface.
#[async_trait]
pub trait Consensus: Send + Sync {
    /// Completes once initial consensus synchronization is done.
    async fn wait_synced(&self);

    /// Subscribes to consensus blocks.
    fn watch_blocks(&self) -> mpsc::Receiver<Block>;

    /// Signs the transaction with the node signer and submits it.
    async fn sign_and_submit_tx(&self, identity: &Identity, tx: Transaction) -> Result<()>;
}

/// Registry consumer interface.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Returns all registered, non-suspended runtimes.
    async fn get_runtimes(&self) -> Result<Vec<RuntimeDescriptor>>;

    /// Returns the descriptor of a single runtime.
    async fn get_runtime(&self, id: &Namespace) -> Result<RuntimeDescriptor>;

    /// Returns the descriptor of a single node, or `NoSuchNode`.
    async fn get_node(&self, id: &PublicKey) -> Result<Node>;

    /// Subscribes to runtime registrations.
    fn watch_runtimes(&self) -> mpsc::Receiver<RuntimeDescriptor>;

    /// Subscribes to node descriptor updates.
    fn watch_node_updates(&self) -> mpsc::Receiver<Node>;
}

/// Scheduler consumer interface.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Returns the currently elected committees for the given runtime.
    async fn get_committees(&self, runtime_id: &Namespace) -> Result<Vec<Committee>>;
}

/// Beacon consumer interface.
#[async_trait]
pub trait Beacon: Send + Sync {
    /// Returns the current epoch.
    async fn get_epoch(&self) -> Result<EpochTime>;

    /// Returns the height of the first block of the given epoch.
    async fn get_epoch_block(&self, epoch: EpochTime) -> Result<u64>;

    /// Subscribes to epoch transitions.
    fn watch_latest_epoch(&self) -> mpsc::Receiver<EpochTime>;

    /// Returns the beacon consensus parameters.
    async fn consensus_parameters(&self) -> Result<BeaconParameters>;
}

/// Availability claim included in node (re-)registrations.
#[derive(Clone, Debug)]
pub struct AvailabilityClaim {
    pub runtime_id: Namespace,
    pub version: Version,
    /// CBOR-encoded `SignedInitResponse`, absent for pre-registrations sent
    /// before the enclave has produced a verified init response.
    pub extra_info: Option<Vec<u8>>,
    pub capability_tee: Option<CapabilityTee>,
}

/// Node registration surface.
#[async_trait]
pub trait RoleProvider: Send + Sync {
    /// Marks the node as available for the hosted runtime.
    async fn set_available(&self, claim: AvailabilityClaim) -> Result<()>;

    /// Marks the node as unavailable.
    async fn set_unavailable(&self);
}

/// Verifies and parses the per-node `extra_info` blob carried in a node
/// descriptor for a key manager runtime.
pub fn verify_extra_info(
    runtime: &RuntimeDescriptor,
    node_runtime: &NodeRuntime,
) -> Result<crate::api::InitResponse> {
    let (hardware, rak) = match &node_runtime.capability_tee {
        None => (TeeHardware::Invalid, crate::api::insecure_rak()),
        Some(tee) if tee.hardware == TeeHardware::Invalid => {
            (TeeHardware::Invalid, crate::api::insecure_rak())
        }
        Some(tee) => (tee.hardware, tee.rak),
    };
    if hardware != runtime.tee_hardware {
        return Err(WorkerError::InvalidArgument(
            "keymanager: TEE hardware mismatch".to_string(),
        ));
    }
    let extra_info = node_runtime
        .extra_info
        .as_ref()
        .ok_or_else(|| WorkerError::InvalidArgument("keymanager: missing extra_info".to_string()))?;

    let signed: SignedInitResponse = cbor::from_slice(extra_info)?;
    signed.verify(&rak)?;
    Ok(signed.init_response)
}
