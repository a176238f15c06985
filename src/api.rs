//! Key manager consensus API types
//!
//! This module carries the data model shared between the worker, the hosted
//! enclave and the consensus layer: key manager statuses, access policies,
//! initialization requests and responses, ephemeral secrets and the
//! transactions that publish them.
//!
//! Everything that crosses a trust boundary is CBOR encoded and, where
//! applicable, signed under a domain-separation context.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::OnceLock;

use ed25519_dalek::{Signer, Verifier};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512_256};

use crate::cbor;
use crate::error::{Result, WorkerError};

/// Unique module name for the key manager consensus module.
pub const MODULE_NAME: &str = "keymanager";

/// Length of a master secret verification checksum in bytes.
pub const CHECKSUM_SIZE: usize = 32;

/// Size of a key pair ID in bytes.
pub const KEY_PAIR_ID_SIZE: usize = 32;

/// Epoch time, expressed in consensus epochs.
pub type EpochTime = u64;

/// Context used to sign key manager init responses.
pub const INIT_RESPONSE_SIGNATURE_CONTEXT: &[u8] = b"oasis-core/keymanager: init response";

/// Context used to sign encrypted ephemeral secrets.
pub const EPHEMERAL_SECRET_SIGNATURE_CONTEXT: &[u8] = b"oasis-core/keymanager: ephemeral secret";

/// Name of the `init` enclave RPC method.
pub const RPC_METHOD_INIT: &str = "init";
/// Name of the `get_public_key` enclave RPC method.
pub const RPC_METHOD_GET_PUBLIC_KEY: &str = "get_public_key";
/// Name of the `get_public_ephemeral_key` enclave RPC method.
pub const RPC_METHOD_GET_PUBLIC_EPHEMERAL_KEY: &str = "get_public_ephemeral_key";
/// Name of the `generate_ephemeral_secret` enclave RPC method.
pub const RPC_METHOD_GENERATE_EPHEMERAL_SECRET: &str = "generate_ephemeral_secret";
/// Name of the `load_ephemeral_secret` enclave RPC method.
pub const RPC_METHOD_LOAD_EPHEMERAL_SECRET: &str = "load_ephemeral_secret";

/// Method name for policy update transactions.
pub const METHOD_UPDATE_POLICY: &str = "keymanager.UpdatePolicy";
/// Method name for ephemeral secret publication transactions.
pub const METHOD_PUBLISH_EPHEMERAL_SECRET: &str = "keymanager.PublishEphemeralSecret";

/// Gas operation identifier for policy updates.
pub const GAS_OP_UPDATE_POLICY: &str = "update_policy";
/// Gas operation identifier for ephemeral secret publication.
pub const GAS_OP_PUBLISH_EPHEMERAL_SECRET: &str = "publish_ephemeral_secret";

/// List of all transaction methods supported by the key manager module.
pub const METHODS: &[&str] = &[METHOD_UPDATE_POLICY, METHOD_PUBLISH_EPHEMERAL_SECRET];

/// Default gas costs for key manager operations.
pub fn default_gas_costs() -> BTreeMap<String, u64> {
    BTreeMap::from([
        (GAS_OP_UPDATE_POLICY.to_string(), 1000),
        (GAS_OP_PUBLISH_EPHEMERAL_SECRET.to_string(), 1000),
    ])
}

macro_rules! impl_bytes {
    ($name:ident, $size:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub [u8; $size]);

        impl $name {
            /// Interprets a byte slice as this type, validating the length.
            pub fn from_slice(data: &[u8]) -> Result<Self> {
                let bytes: [u8; $size] = data.try_into().map_err(|_| {
                    WorkerError::InvalidArgument(format!(
                        "{}: expected {} bytes, got {}",
                        stringify!($name),
                        $size,
                        data.len()
                    ))
                })?;
                Ok(Self(bytes))
            }

            pub fn as_bytes(&self) -> &[u8; $size] {
                &self.0
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", hex::encode(self.0))
            }
        }

        impl Serialize for $name {
            fn serialize<S: serde::Serializer>(
                &self,
                serializer: S,
            ) -> std::result::Result<S::Ok, S::Error> {
                serde_bytes::Bytes::new(&self.0).serialize(serializer)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(
                deserializer: D,
            ) -> std::result::Result<Self, D::Error> {
                let buf = serde_bytes::ByteBuf::deserialize(deserializer)?;
                Self::from_slice(&buf).map_err(serde::de::Error::custom)
            }
        }
    };
}

impl_bytes!(Namespace, 32, "Runtime identifier (256-bit namespace).");
impl_bytes!(PublicKey, 32, "Ed25519 public key (node identity, RAK, RSK).");
impl_bytes!(X25519PublicKey, 32, "X25519 public key (REK).");
impl_bytes!(KeyPairId, KEY_PAIR_ID_SIZE, "Key pair identifier.");

/// Raw Ed25519 signature bytes.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "serde_bytes")] pub Vec<u8>);

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

/// Digest of a context-separated message, the actual value covered by
/// signatures. The context keeps signatures over different payload kinds
/// from being replayable against each other.
fn context_digest(context: &[u8], message: &[u8]) -> [u8; 32] {
    let mut h = Sha512_256::new();
    h.update(context);
    h.update(message);
    h.finalize().into()
}

/// Signs a message under a domain-separation context.
pub fn sign_with_context(
    key: &ed25519_dalek::SigningKey,
    context: &[u8],
    message: &[u8],
) -> Signature {
    let digest = context_digest(context, message);
    Signature(key.sign(&digest).to_bytes().to_vec())
}

impl PublicKey {
    /// Verifies a context-separated signature made by this key.
    pub fn verify_context(
        &self,
        context: &[u8],
        message: &[u8],
        signature: &Signature,
    ) -> Result<()> {
        let key = ed25519_dalek::VerifyingKey::from_bytes(&self.0)
            .map_err(|e| WorkerError::InvalidSignature(format!("bad public key: {e}")))?;
        let sig = ed25519_dalek::Signature::from_slice(&signature.0)
            .map_err(|e| WorkerError::InvalidSignature(format!("bad signature encoding: {e}")))?;
        let digest = context_digest(context, message);
        key.verify(&digest, &sig)
            .map_err(|e| WorkerError::InvalidSignature(e.to_string()))
    }
}

/// Returns the public half of an Ed25519 signing key.
pub fn public_key_of(key: &ed25519_dalek::SigningKey) -> PublicKey {
    PublicKey(key.verifying_key().to_bytes())
}

const TEST_SIGNER_SEEDS: &[&str] = &[
    "ekiden test key manager RAK seed", // DO NOT REORDER.
    "ekiden key manager test multisig key 0",
    "ekiden key manager test multisig key 1",
    "ekiden key manager test multisig key 2",
];

const INSECURE_REK_SEED: &str = "ekiden test key manager REK seed";

fn seed_signing_key(seed: &str) -> ed25519_dalek::SigningKey {
    let digest: [u8; 32] = Sha512_256::digest(seed.as_bytes()).into();
    ed25519_dalek::SigningKey::from_bytes(&digest)
}

/// Well-known signers used in insecure builds when a TEE is unavailable.
/// The first signer holds the insecure RAK.
pub fn test_signers() -> &'static [ed25519_dalek::SigningKey] {
    static SIGNERS: OnceLock<Vec<ed25519_dalek::SigningKey>> = OnceLock::new();
    SIGNERS.get_or_init(|| TEST_SIGNER_SEEDS.iter().map(|s| seed_signing_key(s)).collect())
}

/// The insecure hardcoded key manager RAK, used in insecure builds when a
/// real RAK is unavailable.
pub fn insecure_rak() -> PublicKey {
    public_key_of(&test_signers()[0])
}

/// The insecure hardcoded key manager REK, used in insecure builds when a
/// real REK is unavailable.
pub fn insecure_rek() -> X25519PublicKey {
    static REK: OnceLock<X25519PublicKey> = OnceLock::new();
    *REK.get_or_init(|| {
        let seed: [u8; 32] = Sha512_256::digest(INSECURE_REK_SEED.as_bytes()).into();
        let secret = x25519_dalek::StaticSecret::from(seed);
        X25519PublicKey(x25519_dalek::PublicKey::from(&secret).to_bytes())
    })
}

/// Current key manager status, as recorded by consensus.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    /// Runtime ID of the key manager.
    pub id: Namespace,

    /// True iff the key manager is done initializing.
    pub is_initialized: bool,

    /// True iff the key manager is secure.
    pub is_secure: bool,

    /// Master secret verification checksum.
    #[serde(with = "serde_bytes")]
    pub checksum: Vec<u8>,

    /// Currently active key manager node IDs.
    pub nodes: Vec<PublicKey>,

    /// Key manager access policy.
    pub policy: Option<SignedPolicySgx>,

    /// Runtime signing key of the key manager.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rsk: Option<PublicKey>,
}

/// SGX enclave identity (MRENCLAVE + MRSIGNER).
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EnclaveIdentity {
    pub mr_enclave: Namespace,
    pub mr_signer: Namespace,
}

/// Per-enclave key manager access policy.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnclavePolicySgx {
    /// Identity of the key manager enclave this policy is for.
    pub id: EnclaveIdentity,

    /// Runtimes allowed to query this enclave, with the enclave identities
    /// permitted per runtime.
    pub may_query: BTreeMap<Namespace, Vec<EnclaveIdentity>>,

    /// Enclave identities allowed to replicate the master secret.
    pub may_replicate: Vec<EnclaveIdentity>,
}

/// Key manager access policy document.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySgx {
    pub serial: u32,
    pub id: Namespace,
    pub enclaves: Vec<EnclavePolicySgx>,
}

/// Multisignature over a policy document.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySignature {
    pub public_key: PublicKey,
    pub signature: Signature,
}

/// Policy document together with the multisignatures endorsing it. The
/// worker treats the contents as opaque except for `may_query`, which gates
/// client runtime watchers; the enclave performs the authoritative checks.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPolicySgx {
    pub policy: PolicySgx,
    pub signatures: Vec<PolicySignature>,
}

impl SignedPolicySgx {
    /// Whether any of the policy's enclaves permit queries from the given
    /// runtime.
    pub fn may_query(&self, runtime_id: &Namespace) -> bool {
        self.policy
            .enclaves
            .iter()
            .any(|enc| enc.may_query.contains_key(runtime_id))
    }
}

/// Initialization request, sent to the key manager enclave.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct InitRequest {
    #[serde(with = "serde_bytes")]
    pub checksum: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub policy: Vec<u8>,
    pub may_generate: bool,
}

/// Initialization response, returned as part of a `SignedInitResponse` from
/// the key manager enclave.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitResponse {
    pub is_secure: bool,
    #[serde(with = "serde_bytes")]
    pub checksum: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub policy_checksum: Vec<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rsk: Option<PublicKey>,
}

/// Signed initialization response, returned from the key manager enclave.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedInitResponse {
    pub init_response: InitResponse,
    pub signature: Signature,
}

impl SignedInitResponse {
    /// Verifies the response signature with the given key.
    pub fn verify(&self, pk: &PublicKey) -> Result<()> {
        let raw = cbor::to_vec(&self.init_response)?;
        pk.verify_context(INIT_RESPONSE_SIGNATURE_CONTEXT, &raw, &self.signature)
            .map_err(|_| {
                WorkerError::InvalidSignature(
                    "invalid initialization response signature".to_string(),
                )
            })
    }
}

/// Signs an init response the way the enclave does.
pub fn sign_init_response(
    signer: &ed25519_dalek::SigningKey,
    response: InitResponse,
) -> Result<SignedInitResponse> {
    let raw = cbor::to_vec(&response)?;
    let signature = sign_with_context(signer, INIT_RESPONSE_SIGNATURE_CONTEXT, &raw);
    Ok(SignedInitResponse {
        init_response: response,
        signature,
    })
}

/// Ephemeral key RPC request, sent to the key manager enclave.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EphemeralKeyRequest {
    pub height: Option<u64>,
    pub runtime_id: Namespace,
    pub key_pair_id: KeyPairId,
    pub epoch: EpochTime,
}

/// Signed public key, returned from the key manager enclave for ephemeral
/// key queries.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignedPublicKey {
    pub key: X25519PublicKey,
    #[serde(with = "serde_bytes")]
    pub checksum: Vec<u8>,
    pub signature: Signature,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration: Option<EpochTime>,
}

/// An ephemeral secret encrypted to the REKs of the committee members.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedSecret {
    /// Ephemeral public key the ciphertexts were encrypted under.
    pub pub_key: X25519PublicKey,

    /// Per-REK ciphertexts of the secret.
    pub ciphertexts: BTreeMap<X25519PublicKey, serde_bytes::ByteBuf>,
}

/// A per-epoch ephemeral secret for one key manager runtime.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedEphemeralSecret {
    /// Runtime ID of the key manager.
    pub runtime_id: Namespace,

    /// Epoch to which the secret belongs.
    pub epoch: EpochTime,

    /// The encrypted secret.
    pub secret: EncryptedSecret,
}

/// An encrypted ephemeral secret signed under the RAK of the generating
/// enclave.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedEncryptedEphemeralSecret {
    pub secret: EncryptedEphemeralSecret,
    pub signature: Signature,
}

impl SignedEncryptedEphemeralSecret {
    /// Verifies that the secret was generated for the given epoch, is
    /// encrypted to exactly the given committee REKs, and is signed under
    /// the given RAK.
    pub fn verify(
        &self,
        epoch: EpochTime,
        reks: &BTreeSet<X25519PublicKey>,
        rak: &PublicKey,
    ) -> Result<()> {
        if self.secret.epoch != epoch {
            return Err(WorkerError::InvalidArgument(format!(
                "ephemeral secret epoch mismatch: expected {epoch}, got {}",
                self.secret.epoch
            )));
        }
        let ciphertexts = &self.secret.secret.ciphertexts;
        if ciphertexts.is_empty() {
            return Err(WorkerError::InvalidArgument(
                "ephemeral secret has no ciphertexts".to_string(),
            ));
        }
        if ciphertexts.len() != reks.len()
            || !ciphertexts.keys().all(|rek| reks.contains(rek))
        {
            return Err(WorkerError::InvalidArgument(
                "ephemeral secret not encrypted to the committee".to_string(),
            ));
        }
        let raw = cbor::to_vec(&self.secret)?;
        rak.verify_context(EPHEMERAL_SECRET_SIGNATURE_CONTEXT, &raw, &self.signature)
            .map_err(|_| {
                WorkerError::InvalidSignature("invalid ephemeral secret signature".to_string())
            })
    }
}

/// Signs an encrypted ephemeral secret the way the enclave does.
pub fn sign_encrypted_ephemeral_secret(
    signer: &ed25519_dalek::SigningKey,
    secret: EncryptedEphemeralSecret,
) -> Result<SignedEncryptedEphemeralSecret> {
    let raw = cbor::to_vec(&secret)?;
    let signature = sign_with_context(signer, EPHEMERAL_SECRET_SIGNATURE_CONTEXT, &raw);
    Ok(SignedEncryptedEphemeralSecret { secret, signature })
}

/// Generate ephemeral secret RPC request, sent to the key manager enclave.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenerateEphemeralSecretRequest {
    pub epoch: EpochTime,
}

/// Generate ephemeral secret RPC response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenerateEphemeralSecretResponse {
    pub signed_secret: SignedEncryptedEphemeralSecret,
}

/// Load ephemeral secret RPC request, sent to the key manager enclave.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoadEphemeralSecretRequest {
    pub signed_secret: SignedEncryptedEphemeralSecret,
}

/// Transaction fee.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fee {
    pub amount: u64,
    pub gas: u64,
}

/// An unsigned consensus transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub nonce: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fee: Option<Fee>,
    pub method: String,
    #[serde(with = "serde_bytes")]
    pub body: Vec<u8>,
}

/// Creates a new policy update transaction.
pub fn new_update_policy_tx(
    nonce: u64,
    fee: Option<Fee>,
    policy: &SignedPolicySgx,
) -> Result<Transaction> {
    Ok(Transaction {
        nonce,
        fee,
        method: METHOD_UPDATE_POLICY.to_string(),
        body: cbor::to_vec(policy)?,
    })
}

/// Creates a new publish ephemeral secret transaction.
pub fn new_publish_ephemeral_secret_tx(
    nonce: u64,
    fee: Option<Fee>,
    secret: &SignedEncryptedEphemeralSecret,
) -> Result<Transaction> {
    Ok(Transaction {
        nonce,
        fee,
        method: METHOD_PUBLISH_EPHEMERAL_SECRET.to_string(),
        body: cbor::to_vec(secret)?,
    })
}

/// Key manager consensus parameters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusParameters {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub gas_costs: BTreeMap<String, u64>,
}

/// Allowed key manager consensus parameter changes.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConsensusParameterChanges {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas_costs: Option<BTreeMap<String, u64>>,
}

impl ConsensusParameterChanges {
    /// Applies the changes to the given parameters.
    pub fn apply(&self, params: &mut ConsensusParameters) {
        if let Some(gas_costs) = &self.gas_costs {
            params.gas_costs = gas_costs.clone();
        }
    }
}

/// Key manager genesis state.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Genesis {
    pub params: ConsensusParameters,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub statuses: Vec<Status>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_secret(
        signer: &ed25519_dalek::SigningKey,
        epoch: EpochTime,
        reks: &[X25519PublicKey],
    ) -> SignedEncryptedEphemeralSecret {
        let secret = EncryptedEphemeralSecret {
            runtime_id: Namespace([1; 32]),
            epoch,
            secret: EncryptedSecret {
                pub_key: X25519PublicKey([7; 32]),
                ciphertexts: reks
                    .iter()
                    .map(|rek| (*rek, serde_bytes::ByteBuf::from(vec![0xaa; 48])))
                    .collect(),
            },
        };
        sign_encrypted_ephemeral_secret(signer, secret).unwrap()
    }

    #[test]
    fn test_insecure_keys_are_deterministic() {
        assert_eq!(insecure_rak(), insecure_rak());
        assert_eq!(insecure_rek(), insecure_rek());
        assert_eq!(insecure_rak(), public_key_of(&test_signers()[0]));
        assert_eq!(test_signers().len(), 4);
    }

    #[test]
    fn test_init_response_sign_verify() {
        let signer = &test_signers()[0];
        let response = InitResponse {
            is_secure: false,
            checksum: vec![2; CHECKSUM_SIZE],
            policy_checksum: vec![3; CHECKSUM_SIZE],
            rsk: None,
        };
        let signed = sign_init_response(signer, response).unwrap();
        signed.verify(&insecure_rak()).unwrap();

        // A different key must not verify.
        let other = public_key_of(&test_signers()[1]);
        assert!(signed.verify(&other).is_err());

        // Tampering with the payload must break the signature.
        let mut tampered = signed;
        tampered.init_response.is_secure = true;
        assert!(tampered.verify(&insecure_rak()).is_err());
    }

    #[test]
    fn test_ephemeral_secret_verify() {
        let signer = &test_signers()[0];
        let rak = insecure_rak();
        let reks = vec![X25519PublicKey([4; 32]), X25519PublicKey([5; 32])];
        let rek_set: BTreeSet<_> = reks.iter().copied().collect();

        let signed = test_secret(signer, 11, &reks);
        signed.verify(11, &rek_set, &rak).unwrap();

        // Wrong epoch.
        assert!(signed.verify(12, &rek_set, &rak).is_err());

        // Committee mismatch.
        let partial: BTreeSet<_> = reks[..1].iter().copied().collect();
        assert!(signed.verify(11, &partial, &rak).is_err());
        let mut extended = rek_set.clone();
        extended.insert(X25519PublicKey([6; 32]));
        assert!(signed.verify(11, &extended, &rak).is_err());

        // Wrong signer.
        let forged = test_secret(&test_signers()[1], 11, &reks);
        assert!(forged.verify(11, &rek_set, &rak).is_err());
    }

    #[test]
    fn test_status_cbor_roundtrip() {
        let status = Status {
            id: Namespace([9; 32]),
            is_initialized: true,
            is_secure: false,
            checksum: vec![1; CHECKSUM_SIZE],
            nodes: vec![insecure_rak()],
            policy: None,
            rsk: Some(public_key_of(&test_signers()[2])),
        };
        let encoded = cbor::to_vec(&status).unwrap();
        let decoded: Status = cbor::from_slice(&encoded).unwrap();
        assert_eq!(decoded, status);
    }

    #[test]
    fn test_policy_may_query() {
        let runtime_a = Namespace([0xaa; 32]);
        let runtime_b = Namespace([0xbb; 32]);
        let policy = SignedPolicySgx {
            policy: PolicySgx {
                serial: 1,
                id: Namespace([1; 32]),
                enclaves: vec![EnclavePolicySgx {
                    id: EnclaveIdentity::default(),
                    may_query: BTreeMap::from([(runtime_a, vec![])]),
                    may_replicate: vec![],
                }],
            },
            signatures: vec![],
        };
        assert!(policy.may_query(&runtime_a));
        assert!(!policy.may_query(&runtime_b));
    }

    #[test]
    fn test_namespace_rejects_bad_length() {
        assert!(Namespace::from_slice(&[0; 31]).is_err());
        assert!(Namespace::from_slice(&[0; 32]).is_ok());
    }

    #[test]
    fn test_transaction_methods_and_gas() {
        let secret = test_secret(&test_signers()[0], 1, &[X25519PublicKey([1; 32])]);
        let tx = new_publish_ephemeral_secret_tx(0, None, &secret).unwrap();
        assert_eq!(tx.method, "keymanager.PublishEphemeralSecret");

        let costs = default_gas_costs();
        assert_eq!(costs.get(GAS_OP_UPDATE_POLICY), Some(&1000));
        assert_eq!(costs.get(GAS_OP_PUBLISH_EPHEMERAL_SECRET), Some(&1000));
        assert_eq!(METHODS.len(), 2);
    }
}
