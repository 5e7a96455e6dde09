//! Wire protocol for the secure channel.
//!
//! A versioned envelope around four message bodies: the key-negotiation
//! pair (`KeyRequest` / `KeyResponse`) and the application traffic pair
//! (`Request` / `Response`). Messages are CBOR-encoded; field semantics
//! follow the channel design:
//!
//! - `KeyResponse.id` binds the server's DH share, signature share, and
//!   service identifier under an Ed25519 signature over
//!   `service_identifier || client_nonce`.
//! - `Request.iv` carries the client's *dynamic* IV; the seal actually
//!   used `static_iv XOR dynamic_iv`. The reply path seals with the static
//!   IV alone and transmits it in the clear. AEAD security needs IV
//!   non-repetition under a key, not IV secrecy.

use serde::{Deserialize, Serialize};

use crate::attestation::Evidence;
use crate::cbor;
use crate::error::{ChannelError, Result};

/// The only protocol version this implementation speaks.
pub const PROTOCOL_VERSION: u8 = 1;

/// Compressed-point encoding tag for EC public shares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PointFormat {
    Compressed,
}

/// An elliptic-curve public share on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EcPoint {
    pub format: PointFormat,
    #[serde(with = "serde_bytes")]
    pub xy: Vec<u8>,
}

impl EcPoint {
    pub fn compressed(xy: Vec<u8>) -> Self {
        Self {
            format: PointFormat::Compressed,
            xy,
        }
    }
}

/// Opens a conversation; carries only the client's handshake nonce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyRequest {
    #[serde(with = "serde_bytes")]
    pub nonce: Vec<u8>,
}

/// The server's signed identity: handshake nonce, service identifier, both
/// public shares, and the signature binding them to the client's nonce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedServiceIdentity {
    #[serde(with = "serde_bytes")]
    pub nonce: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub service_identifier: Vec<u8>,
    pub server_share: EcPoint,
    pub server_signature_share: EcPoint,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyResponse {
    pub id: SignedServiceIdentity,
    /// Reserved; always emitted as zero.
    pub lifetime_hint: u32,
    pub key_version: u32,
    pub authenticator: Vec<Evidence>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub key_version: u32,
    #[serde(with = "serde_bytes")]
    pub iv: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub tag: Vec<u8>,
    pub client_share: EcPoint,
    #[serde(with = "serde_bytes")]
    pub additional_data: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub key_outdated: bool,
    #[serde(with = "serde_bytes")]
    pub iv: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub tag: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub additional_data: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Body {
    KeyRequest(KeyRequest),
    KeyResponse(KeyResponse),
    Request(Request),
    Response(Response),
}

/// Versioned message envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub version: u8,
    pub body: Body,
}

impl Message {
    pub fn new(body: Body) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            body,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        cbor::to_vec(self).map_err(|e| ChannelError::Serialization(e.to_string()))
    }

    /// Encode into a caller-supplied buffer, returning the number of bytes
    /// written. A buffer that cannot hold the message is a serialization
    /// error, not a truncation.
    pub fn encode_into(&self, out: &mut [u8]) -> Result<usize> {
        let bytes = self.encode()?;
        if bytes.len() > out.len() {
            return Err(ChannelError::Serialization(format!(
                "output buffer too small: need {}, have {}",
                bytes.len(),
                out.len()
            )));
        }
        out[..bytes.len()].copy_from_slice(&bytes);
        Ok(bytes.len())
    }

    /// Decode and validate the envelope. Unknown protocol versions and
    /// undecodable bodies are parse errors.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let msg: Message = cbor::from_slice(bytes)
            .map_err(|e| ChannelError::PayloadParse(format!("invalid message: {}", e)))?;
        if msg.version != PROTOCOL_VERSION {
            return Err(ChannelError::PayloadParse(format!(
                "unsupported protocol version: {}",
                msg.version
            )));
        }
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::EvidenceKind;

    fn sample_key_response() -> Message {
        Message::new(Body::KeyResponse(KeyResponse {
            id: SignedServiceIdentity {
                nonce: vec![0xAA; 16],
                service_identifier: vec![1, 2, 3],
                server_share: EcPoint::compressed(vec![4; 32]),
                server_signature_share: EcPoint::compressed(vec![5; 32]),
                signature: vec![6; 64],
            },
            lifetime_hint: 0,
            key_version: 3,
            authenticator: vec![Evidence {
                kind: EvidenceKind::Quote,
                contents: vec![9, 9, 9],
            }],
        }))
    }

    #[test]
    fn key_request_roundtrip() {
        let msg = Message::new(Body::KeyRequest(KeyRequest {
            nonce: vec![0xBB; 16],
        }));
        let bytes = msg.encode().unwrap();
        assert_eq!(Message::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn key_response_roundtrip() {
        let msg = sample_key_response();
        let bytes = msg.encode().unwrap();
        assert_eq!(Message::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn request_roundtrip() {
        let msg = Message::new(Body::Request(Request {
            key_version: 2,
            iv: vec![1; 12],
            tag: vec![2; 16],
            client_share: EcPoint::compressed(vec![3; 32]),
            additional_data: vec![4; 16],
            ciphertext: vec![5; 100],
        }));
        let bytes = msg.encode().unwrap();
        assert_eq!(Message::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn response_roundtrip() {
        let msg = Message::new(Body::Response(Response {
            key_outdated: true,
            iv: vec![1; 12],
            tag: vec![2; 16],
            additional_data: vec![],
            ciphertext: vec![7; 64],
        }));
        let bytes = msg.encode().unwrap();
        assert_eq!(Message::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn rejects_unknown_version() {
        let mut msg = sample_key_response();
        msg.version = 2;
        let bytes = crate::cbor::to_vec(&msg).unwrap();
        let err = Message::decode(&bytes).unwrap_err();
        assert!(matches!(err, ChannelError::PayloadParse(_)));
    }

    #[test]
    fn rejects_garbage() {
        let err = Message::decode(b"definitely not cbor").unwrap_err();
        assert!(matches!(err, ChannelError::PayloadParse(_)));
    }

    #[test]
    fn encode_into_reports_short_buffer() {
        let msg = sample_key_response();
        let mut small = [0u8; 8];
        let err = msg.encode_into(&mut small).unwrap_err();
        assert!(matches!(err, ChannelError::Serialization(_)));

        let mut big = [0u8; 4096];
        let written = msg.encode_into(&mut big).unwrap();
        assert_eq!(Message::decode(&big[..written]).unwrap(), msg);
    }
}
