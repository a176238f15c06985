//! Runtime host capability
//!
//! The key manager enclave runs inside a sandboxed runtime host process. The
//! worker provisions it once, feeds it requests through [`HostedRuntime::call`]
//! and observes its lifecycle through [`HostEvent`]s.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::backend::{CapabilityTee, Version};
use crate::enclave_rpc::Kind;
use crate::error::Result;

/// A request dispatched into the hosted runtime.
#[derive(Clone, Debug)]
pub enum RuntimeRequest {
    /// An enclave RPC frame received from a remote peer (Noise session or
    /// insecure query).
    RpcCall { request: Vec<u8>, kind: Kind },
    /// A host-local enclave RPC call.
    LocalRpcCall { request: Vec<u8> },
}

/// A response produced by the hosted runtime.
#[derive(Clone, Debug)]
pub enum RuntimeResponse {
    RpcResponse { response: Vec<u8> },
    LocalRpcResponse { response: Vec<u8> },
}

/// Runtime lifecycle notification.
#[derive(Clone, Debug)]
pub enum HostEvent {
    Started {
        version: Version,
        capability_tee: Option<CapabilityTee>,
    },
    Updated {
        version: Version,
        capability_tee: Option<CapabilityTee>,
    },
    FailedToStart {
        error: String,
    },
    Stopped,
}

/// A provisioned, controllable runtime instance.
#[async_trait]
pub trait HostedRuntime: Send + Sync {
    async fn start(&self) -> Result<()>;

    async fn stop(&self);

    /// Activates the given bundle version.
    async fn set_version(&self, version: Version) -> Result<()>;

    /// Dispatches a request to the runtime and waits for its response.
    async fn call(&self, request: RuntimeRequest) -> Result<RuntimeResponse>;
}

/// Result of provisioning the hosted key manager runtime.
pub struct ProvisionedRuntime {
    pub runtime: Arc<dyn HostedRuntime>,
    pub events: mpsc::Receiver<HostEvent>,
    /// The single bundle version key managers run.
    pub version: Version,
}

/// Provisions the hosted key manager runtime.
#[async_trait]
pub trait RuntimeHostProvisioner: Send + Sync {
    async fn provision(&self) -> Result<ProvisionedRuntime>;
}
