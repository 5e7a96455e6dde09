//! Synthetic quote verifier for local runs and tests.

use sealed_ml_common::{Result, SyntheticQuote, VerifiedQuote};

use crate::attestation_verifier::QuoteVerifier;

/// Verifier for the CBOR synthetic quotes emitted by the mock producer.
/// Accepts any structurally valid quote; the policy checks on top are the
/// real ones.
pub struct SyntheticQuoteVerifier;

impl QuoteVerifier for SyntheticQuoteVerifier {
    fn verify(&self, quote: &[u8], _collateral: &[u8]) -> Result<VerifiedQuote> {
        let parsed = SyntheticQuote::from_cbor(quote)?;
        Ok(VerifiedQuote {
            identity: parsed.identity,
            report_data: parsed.report_data,
        })
    }
}
