//! Attestation verification policy.
//!
//! Platform-level quote validation (signature chains, collateral checks)
//! sits behind the [`QuoteVerifier`] seam; this module applies the
//! channel's policy on top of it: report format, expected enclave
//! measurement, expected signer, product and security floors, and the
//! binding of the server's public key and service identifier into the
//! quote's report data.

use sealed_ml_common::attestation::report_data;
use sealed_ml_common::crypto;
use sealed_ml_common::{ChannelError, Result, VerifiedQuote};

/// Platform glue that checks a quote's authenticity against its
/// collateral and extracts the attested identity.
pub trait QuoteVerifier: Send + Sync {
    fn verify(&self, quote: &[u8], collateral: &[u8]) -> Result<VerifiedQuote>;
}

/// Identity expectations applied to a verified quote. Empty fields skip
/// their check.
pub struct AttestationPolicy {
    pub expected_signer_pem: String,
    pub expected_enclave_hash: Vec<u8>,
    pub verbose: bool,
}

impl AttestationPolicy {
    /// Whether the policy carries expectations that can only be checked
    /// against a quote.
    pub fn requires_quote(&self) -> bool {
        !self.expected_signer_pem.is_empty() || !self.expected_enclave_hash.is_empty()
    }

    /// Verify a quote and enforce the policy. `server_public_key` and
    /// `service_identifier` are the values the quote's report data must
    /// commit to.
    pub fn verify(
        &self,
        verifier: &dyn QuoteVerifier,
        quote: &[u8],
        collateral: &[u8],
        server_public_key: &[u8],
        service_identifier: &[u8],
    ) -> Result<()> {
        if quote.is_empty() {
            return Err(ChannelError::Attestation("no quote to verify".to_string()));
        }

        let verified = verifier.verify(quote, collateral)?;
        let identity = &verified.identity;
        if self.verbose {
            tracing::info!("enclave quote verified: authentic platform");
        }

        if identity.id_version != 0 {
            return Err(ChannelError::Attestation(
                "unsupported report format version".to_string(),
            ));
        }

        if !self.expected_enclave_hash.is_empty() {
            if self.expected_enclave_hash.as_slice() != identity.unique_id.as_slice() {
                return Err(ChannelError::Attestation(format!(
                    "enclave hash mismatch: expected={} actual={}",
                    hex::encode(&self.expected_enclave_hash),
                    hex::encode(identity.unique_id)
                )));
            }
            if self.verbose {
                tracing::info!(
                    "enclave hash verified: {}",
                    hex::encode(&self.expected_enclave_hash)
                );
            }
        }

        if !self.expected_signer_pem.is_empty() {
            let expected_mrsigner = crypto::pem_to_mrsigner(&self.expected_signer_pem)?;
            if expected_mrsigner != identity.signer_id {
                return Err(ChannelError::Attestation(format!(
                    "enclave signer mismatch: expected={} actual={}",
                    hex::encode(expected_mrsigner),
                    hex::encode(identity.signer_id)
                )));
            }
            if self.verbose {
                tracing::info!("enclave signer verified: {}", hex::encode(expected_mrsigner));
            }
        }

        if identity.product_id[0] != 1 {
            return Err(ChannelError::Attestation(
                "product id check failed".to_string(),
            ));
        }
        if identity.security_version < 1 {
            return Err(ChannelError::Attestation(
                "security version check failed".to_string(),
            ));
        }

        // Only the first 32 bytes carry the digest; platforms pad the
        // report data field beyond that.
        let expected = report_data(server_public_key, service_identifier);
        if verified.report_data.len() < expected.len()
            || verified.report_data[..expected.len()] != expected
        {
            return Err(ChannelError::Attestation(format!(
                "quote report data mismatch: expected={}",
                hex::encode(expected)
            )));
        }
        if self.verbose {
            tracing::info!("quote report data verified: {}", hex::encode(expected));
        }

        Ok(())
    }
}
