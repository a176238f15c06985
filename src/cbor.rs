//! Canonical CBOR encoding helpers
//!
//! All enclave payloads and consensus transaction bodies are CBOR. Both the
//! worker and the enclave encode with the same serializer, so signatures over
//! encoded payloads stay stable.

use serde::{de::DeserializeOwned, Serialize};

use crate::error::{Result, WorkerError};

/// Encodes a value as CBOR.
pub fn to_vec<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf)
        .map_err(|e| WorkerError::Serialization(e.to_string()))?;
    Ok(buf)
}

/// Decodes a CBOR value, mapping failures to `InvalidArgument`.
pub fn from_slice<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    ciborium::de::from_reader(data).map_err(|e| WorkerError::InvalidArgument(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Payload {
            method: String,
            #[serde(with = "serde_bytes")]
            data: Vec<u8>,
        }

        let payload = Payload {
            method: "init".to_string(),
            data: vec![1, 2, 3],
        };
        let encoded = to_vec(&payload).unwrap();
        let decoded: Payload = from_slice(&encoded).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_garbage_is_invalid_argument() {
        let err = from_slice::<String>(&[0xff, 0x00, 0x13]).unwrap_err();
        assert!(matches!(err, WorkerError::InvalidArgument(_)));
    }
}
