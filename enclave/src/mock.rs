//! Synthetic attestation providers for local runs and tests.
//!
//! These produce structurally valid quotes without TEE hardware. The wire
//! format matches what the client's synthetic verifier expects; real
//! deployments swap both ends for platform glue.

use sealed_ml_common::crypto;
use sealed_ml_common::{EnclaveIdentity, Result, SyntheticQuote};

use crate::attestation::{QuoteProducer, SecureReleaseAttestor};

/// Quote producer emitting CBOR-encoded synthetic quotes.
pub struct MockQuoteProducer {
    identity: EnclaveIdentity,
    with_collateral: bool,
}

impl MockQuoteProducer {
    pub fn new(identity: EnclaveIdentity) -> Self {
        Self {
            identity,
            with_collateral: false,
        }
    }

    /// A producer whose identity passes the baseline policy checks.
    pub fn baseline() -> Self {
        Self::new(EnclaveIdentity::baseline())
    }

    pub fn with_collateral(mut self) -> Self {
        self.with_collateral = true;
        self
    }
}

impl QuoteProducer for MockQuoteProducer {
    fn quote(&self, report_data: &[u8; 32]) -> Result<(Vec<u8>, Option<Vec<u8>>)> {
        let quote = SyntheticQuote {
            identity: self.identity.clone(),
            report_data: report_data.to_vec(),
        }
        .to_cbor()?;
        let collateral = self
            .with_collateral
            .then(|| b"synthetic-collateral".to_vec());
        Ok((quote, collateral))
    }
}

/// Secure-release attestor with a fixed signer identity.
pub struct MockReleaseAttestor {
    pub signer: [u8; 32],
}

impl SecureReleaseAttestor for MockReleaseAttestor {
    fn release_quote(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        let enclave_held_data = b"sealed-ml-release".to_vec();
        let mut identity = EnclaveIdentity::baseline();
        identity.signer_id = self.signer;
        let quote = SyntheticQuote {
            identity,
            report_data: crypto::sha256(&enclave_held_data).to_vec(),
        }
        .to_cbor()?;
        Ok((quote, enclave_held_data))
    }

    fn signer_id(&self) -> Result<[u8; 32]> {
        Ok(self.signer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_quote_embeds_report_data() {
        let producer = MockQuoteProducer::baseline();
        let report_data = [0xAB; 32];
        let (quote, collateral) = producer.quote(&report_data).unwrap();
        assert!(collateral.is_none());

        let parsed = SyntheticQuote::from_cbor(&quote).unwrap();
        assert_eq!(parsed.report_data, report_data);
        assert_eq!(parsed.identity.id_version, 0);
    }

    #[test]
    fn release_quote_commits_to_held_data() {
        let attestor = MockReleaseAttestor { signer: [3u8; 32] };
        let (quote, ehd) = attestor.release_quote().unwrap();
        let parsed = SyntheticQuote::from_cbor(&quote).unwrap();
        assert_eq!(parsed.report_data, crypto::sha256(&ehd).to_vec());
        assert_eq!(parsed.identity.signer_id, [3u8; 32]);
    }
}
