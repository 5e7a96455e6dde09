//! Attestation evidence production seams.
//!
//! Quote generation is platform glue (TEE SDK, configfs, vendor library);
//! the server core only needs two capabilities from it. `QuoteProducer`
//! yields the remote-attestation quote that binds the channel's report
//! data; `SecureReleaseAttestor` yields the quote-plus-enclave-held-data
//! pair and the signer identity that the HSM secure-key-release flow
//! needs. Synthetic implementations live in [`crate::mock`].

use sealed_ml_common::Result;

/// Produces a remote-attestation quote over 32 bytes of report data.
///
/// Returns the quote and, when the platform supplies it, the endorsement
/// collateral a verifier can check the quote against offline.
pub trait QuoteProducer: Send + Sync {
    fn quote(&self, report_data: &[u8; 32]) -> Result<(Vec<u8>, Option<Vec<u8>>)>;
}

/// Attestation capability for secure key release.
pub trait SecureReleaseAttestor: Send + Sync {
    /// A quote whose report data commits to the returned enclave-held
    /// data. Returns `(quote, enclave_held_data)`.
    fn release_quote(&self) -> Result<(Vec<u8>, Vec<u8>)>;

    /// The enclave's signer identity (MRSIGNER), used to key the HSM
    /// release policy.
    fn signer_id(&self) -> Result<[u8; 32]>;
}
