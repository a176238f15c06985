//! Peer access control table
//!
//! Maps libp2p-style peer identifiers to the runtimes they may query the
//! enclave on behalf of, together with the inverse map used to replace a
//! runtime's peer set wholesale on committee changes. This table is only a
//! cheap outer gate; the enclave re-checks the policy independently.

use std::collections::{HashMap, HashSet};
use std::fmt;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::api::{Namespace, PublicKey, RPC_METHOD_GET_PUBLIC_EPHEMERAL_KEY, RPC_METHOD_GET_PUBLIC_KEY};
use crate::backend::Node;
use crate::error::{Result, WorkerError};

/// A libp2p-style peer identifier: the multihash digest of the node's
/// validated Ed25519 p2p public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; 32]);

impl PeerId {
    /// Derives the peer ID from a node's p2p public key. Fails when the key
    /// bytes are not a valid Ed25519 point.
    pub fn from_p2p_public_key(public_key: &PublicKey) -> Result<Self> {
        ed25519_dalek::VerifyingKey::from_bytes(public_key.as_bytes())
            .map_err(|e| WorkerError::InvalidArgument(format!("invalid p2p public key: {e}")))?;
        Ok(Self(Sha256::digest(public_key.as_bytes()).into()))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Whether a Noise-session method may be called by anyone. Empty plaintext
/// means session establishment.
pub fn is_publicly_callable(method: &str) -> bool {
    matches!(
        method,
        "" | RPC_METHOD_GET_PUBLIC_KEY | RPC_METHOD_GET_PUBLIC_EPHEMERAL_KEY
    )
}

/// Two mirrored access maps, mutated only by the worker loop.
#[derive(Default)]
pub struct AccessList {
    access_list: HashMap<PeerId, HashSet<Namespace>>,
    access_list_by_runtime: HashMap<Namespace, Vec<PeerId>>,
}

impl AccessList {
    /// Whether the peer may reach the enclave for any runtime.
    pub fn is_allowed(&self, peer: &PeerId) -> bool {
        self.access_list.contains_key(peer)
    }

    /// Runtimes the peer is currently authorized for.
    pub fn runtimes_for(&self, peer: &PeerId) -> Option<&HashSet<Namespace>> {
        self.access_list.get(peer)
    }

    /// Peers currently authorized for the runtime, in insertion order.
    pub fn peers_for_runtime(&self, runtime_id: &Namespace) -> &[PeerId] {
        self.access_list_by_runtime
            .get(runtime_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Replaces the peer set for the given runtime with the peers derived
    /// from the given nodes. Nodes whose p2p key does not translate to a
    /// peer ID are skipped with a warning.
    pub fn update_runtime(&mut self, runtime_id: Namespace, nodes: &[Node]) {
        // Clear any old nodes from the access list.
        if let Some(old) = self.access_list_by_runtime.remove(&runtime_id) {
            for peer in old {
                if let Some(entry) = self.access_list.get_mut(&peer) {
                    entry.remove(&runtime_id);
                    if entry.is_empty() {
                        self.access_list.remove(&peer);
                    }
                }
            }
        }

        let mut peers = Vec::with_capacity(nodes.len());
        for node in nodes {
            let peer = match PeerId::from_p2p_public_key(&node.p2p.public_key) {
                Ok(peer) => peer,
                Err(err) => {
                    warn!(node_id = %node.id, error = %err, "invalid node P2P ID");
                    continue;
                }
            };
            self.access_list.entry(peer).or_default().insert(runtime_id);
            peers.push(peer);
        }
        self.access_list_by_runtime.insert(runtime_id, peers.clone());

        debug!(
            runtime_id = %runtime_id,
            peers = ?peers,
            "new client runtime access policy in effect"
        );
    }
}
