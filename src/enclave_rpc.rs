//! Enclave RPC adapter
//!
//! Marshals CBOR-framed requests to the hosted key manager enclave and
//! unwraps its response envelopes. Three call kinds exist: host-local calls
//! (`init`, secret generation and loading), Noise-session calls relayed for
//! remote peers, and insecure queries that bypass access control.

use std::time::Duration;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::cbor;
use crate::error::{Result, WorkerError};
use crate::host::{HostedRuntime, RuntimeRequest, RuntimeResponse};

/// Hard timeout applied to every enclave RPC.
pub const RPC_CALL_TIMEOUT: Duration = Duration::from_secs(2);

/// Enclave RPC call kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    /// End-to-end secured call over an established Noise session.
    NoiseSession,
    /// Unencrypted query; the enclave treats it as untrusted.
    InsecureQuery,
    /// Host-local call; never accepted from remote peers.
    LocalQuery,
}

/// A host-local enclave RPC request.
#[derive(Serialize)]
struct Request<'a, A: Serialize> {
    method: &'a str,
    args: &'a A,
}

/// Decoded form of a host-local request, used by the enclave side.
#[derive(Debug, Deserialize)]
pub struct DecodedRequest {
    pub method: String,
    pub args: ciborium::Value,
}

/// Response envelope returned by the enclave for local calls.
#[derive(Deserialize)]
struct Message {
    #[serde(default)]
    response: Option<ResponseEnvelope>,
}

#[derive(Deserialize)]
struct ResponseEnvelope {
    body: ResponseBody,
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
enum ResponseBody {
    /// Raw CBOR of the method response payload.
    Success(serde_bytes::ByteBuf),
    Error(String),
}

/// Outer frame of a remote enclave RPC request. Only the untrusted plaintext
/// method name is inspected here; the enclave re-checks it inside the
/// session, so a peer lying about the method gains nothing.
#[derive(Debug, Default, Deserialize)]
pub struct Frame {
    #[serde(default)]
    pub session: serde_bytes::ByteBuf,
    #[serde(default)]
    pub untrusted_plaintext: String,
    #[serde(default)]
    pub payload: serde_bytes::ByteBuf,
}

async fn dispatch(
    runtime: &dyn HostedRuntime,
    cancel: &CancellationToken,
    request: RuntimeRequest,
) -> Result<RuntimeResponse> {
    tokio::select! {
        _ = cancel.cancelled() => Err(WorkerError::Cancelled),
        response = tokio::time::timeout(RPC_CALL_TIMEOUT, runtime.call(request)) => {
            response.map_err(|_| WorkerError::Cancelled)?
        }
    }
}

/// Performs a host-local enclave RPC call and decodes the typed response.
pub async fn local_call<A, R>(
    runtime: &dyn HostedRuntime,
    cancel: &CancellationToken,
    method: &str,
    args: &A,
) -> Result<R>
where
    A: Serialize,
    R: DeserializeOwned,
{
    let request = cbor::to_vec(&Request { method, args })?;
    let response = dispatch(runtime, cancel, RuntimeRequest::LocalRpcCall { request }).await?;

    let payload = match response {
        RuntimeResponse::LocalRpcResponse { response } => response,
        _ => {
            tracing::error!("malformed response from runtime");
            return Err(WorkerError::MalformedResponse);
        }
    };

    let message: Message =
        cbor::from_slice(&payload).map_err(|_| WorkerError::MalformedResponse)?;
    let envelope = message.response.ok_or(WorkerError::MalformedResponse)?;
    match envelope.body {
        ResponseBody::Success(data) => {
            cbor::from_slice(&data).map_err(|_| WorkerError::MalformedResponse)
        }
        ResponseBody::Error(err) => Err(WorkerError::Enclave(err)),
    }
}

/// Relays a remote enclave RPC frame to the runtime. Access control has
/// already been applied by the caller.
pub async fn remote_call(
    runtime: &dyn HostedRuntime,
    cancel: &CancellationToken,
    request: Vec<u8>,
    kind: Kind,
) -> Result<Vec<u8>> {
    let response = dispatch(runtime, cancel, RuntimeRequest::RpcCall { request, kind }).await?;
    match response {
        RuntimeResponse::RpcResponse { response } => Ok(response),
        _ => {
            tracing::error!("malformed response from runtime");
            Err(WorkerError::MalformedResponse)
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "snake_case")]
enum ResponseBodyOwned {
    Success(serde_bytes::ByteBuf),
    Error(String),
}

#[derive(Serialize)]
struct MessageOwned {
    response: ResponseEnvelopeOwned,
}

#[derive(Serialize)]
struct ResponseEnvelopeOwned {
    body: ResponseBodyOwned,
}

fn encode_envelope(body: ResponseBodyOwned) -> Result<Vec<u8>> {
    cbor::to_vec(&MessageOwned {
        response: ResponseEnvelopeOwned { body },
    })
}

/// Builds the response envelope the way the enclave does. Used by the
/// in-process enclave emulation and by tests.
pub fn encode_success<R: Serialize>(payload: &R) -> Result<Vec<u8>> {
    let body = cbor::to_vec(payload)?;
    encode_envelope(ResponseBodyOwned::Success(serde_bytes::ByteBuf::from(body)))
}

/// Builds an error response envelope.
pub fn encode_error(message: &str) -> Result<Vec<u8>> {
    encode_envelope(ResponseBodyOwned::Error(message.to_string()))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::error::WorkerError;

    /// Runtime stub that replies with a canned response.
    struct StubRuntime {
        reply: Mutex<Option<RuntimeResponse>>,
    }

    impl StubRuntime {
        fn replying(reply: RuntimeResponse) -> Self {
            Self {
                reply: Mutex::new(Some(reply)),
            }
        }
    }

    #[async_trait]
    impl HostedRuntime for StubRuntime {
        async fn start(&self) -> Result<()> {
            Ok(())
        }

        async fn stop(&self) {}

        async fn set_version(&self, _version: crate::backend::Version) -> Result<()> {
            Ok(())
        }

        async fn call(&self, _request: RuntimeRequest) -> Result<RuntimeResponse> {
            Ok(self.reply.lock().unwrap().take().expect("single call"))
        }
    }

    #[tokio::test]
    async fn test_local_call_success() {
        let runtime = StubRuntime::replying(RuntimeResponse::LocalRpcResponse {
            response: encode_success(&42u64).unwrap(),
        });
        let cancel = CancellationToken::new();
        let result: u64 = local_call(&runtime, &cancel, "test", &()).await.unwrap();
        assert_eq!(result, 42);
    }

    #[tokio::test]
    async fn test_local_call_enclave_error() {
        let runtime = StubRuntime::replying(RuntimeResponse::LocalRpcResponse {
            response: encode_error("boom").unwrap(),
        });
        let cancel = CancellationToken::new();
        let err = local_call::<_, u64>(&runtime, &cancel, "test", &())
            .await
            .unwrap_err();
        match err {
            WorkerError::Enclave(msg) => assert_eq!(msg, "boom"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_local_call_malformed_envelope() {
        // Not a Message envelope at all.
        let runtime = StubRuntime::replying(RuntimeResponse::LocalRpcResponse {
            response: vec![0x01, 0x02],
        });
        let cancel = CancellationToken::new();
        let err = local_call::<_, u64>(&runtime, &cancel, "test", &())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::MalformedResponse));
    }

    #[tokio::test]
    async fn test_local_call_wrong_response_kind() {
        let runtime = StubRuntime::replying(RuntimeResponse::RpcResponse {
            response: vec![],
        });
        let cancel = CancellationToken::new();
        let err = local_call::<_, u64>(&runtime, &cancel, "test", &())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::MalformedResponse));
    }

    #[tokio::test]
    async fn test_cancelled_call() {
        let runtime = StubRuntime::replying(RuntimeResponse::RpcResponse { response: vec![] });
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = remote_call(&runtime, &cancel, vec![], Kind::InsecureQuery)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Cancelled));
    }

    #[test]
    fn test_frame_peek() {
        #[derive(Serialize)]
        struct WireFrame<'a> {
            untrusted_plaintext: &'a str,
            #[serde(with = "serde_bytes")]
            payload: &'a [u8],
        }
        let data = cbor::to_vec(&WireFrame {
            untrusted_plaintext: "get_public_key",
            payload: &[1, 2, 3],
        })
        .unwrap();
        let frame: Frame = cbor::from_slice(&data).unwrap();
        assert_eq!(frame.untrusted_plaintext, "get_public_key");
        assert_eq!(frame.payload.as_ref(), &[1, 2, 3]);
    }
}
