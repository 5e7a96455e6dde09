//! Attestation data types shared between the evidence producer (enclave
//! side) and the verifier (client side).
//!
//! The channel binds the server's DH public key and service identifier
//! into the quote's report data: `report_data = SHA-256(public_key ||
//! service_identifier)`. How a quote is produced or checked against its
//! collateral is platform glue behind the producer/verifier seams; this
//! module defines what travels on the wire and what a verified quote
//! yields.

use serde::{Deserialize, Serialize};

use crate::cbor;
use crate::crypto;
use crate::error::{ChannelError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvidenceKind {
    Quote,
    Collateral,
}

/// One attestation artifact carried in a `KeyResponse`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub kind: EvidenceKind,
    #[serde(with = "serde_bytes")]
    pub contents: Vec<u8>,
}

/// Identity fields a platform verifier extracts from a valid quote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnclaveIdentity {
    /// Report format version; only 0 is accepted.
    pub id_version: u32,
    /// Monotonic security patch level of the enclave.
    pub security_version: u32,
    pub product_id: [u8; 16],
    /// Hash of the enclave's loaded memory layout (MRENCLAVE).
    pub unique_id: [u8; 32],
    /// Hash of the signer's public key modulus (MRSIGNER).
    pub signer_id: [u8; 32],
}

/// Result of platform-level quote verification: the attested identity and
/// the report data embedded in the quote.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedQuote {
    pub identity: EnclaveIdentity,
    pub report_data: Vec<u8>,
}

/// The report data the channel binds into every quote.
pub fn report_data(public_key: &[u8], service_identifier: &[u8]) -> [u8; crypto::SHA256_SIZE] {
    crypto::sha256_concat(&[public_key, service_identifier])
}

/// Quote shape used by the synthetic (non-hardware) producer/verifier
/// pair, for local runs and tests. Real deployments replace both ends
/// with platform glue; the wire format doesn't change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticQuote {
    pub identity: EnclaveIdentity,
    #[serde(with = "serde_bytes")]
    pub report_data: Vec<u8>,
}

impl SyntheticQuote {
    pub fn to_cbor(&self) -> Result<Vec<u8>> {
        cbor::to_vec(self).map_err(|e| ChannelError::Serialization(e.to_string()))
    }

    pub fn from_cbor(bytes: &[u8]) -> Result<Self> {
        cbor::from_slice(bytes)
            .map_err(|e| ChannelError::Attestation(format!("quote invalid: {}", e)))
    }
}

impl EnclaveIdentity {
    /// An identity that passes the baseline policy checks, with all
    /// measurement fields zeroed.
    pub fn baseline() -> Self {
        let mut product_id = [0u8; 16];
        product_id[0] = 1;
        Self {
            id_version: 0,
            security_version: 1,
            product_id,
            unique_id: [0u8; 32],
            signer_id: [0u8; 32],
        }
    }
}
