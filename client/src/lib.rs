pub mod attestation_verifier;
pub mod mock;
pub mod secure_client;

pub use attestation_verifier::{AttestationPolicy, QuoteVerifier};
pub use secure_client::{ClientEvent, SecureChannelClient};
