pub mod attestation;
pub mod cbor;
pub mod crypto;
pub mod error;
pub mod keys;
pub mod protocol;

// Re-export commonly used types and errors
pub use error::{ChannelError, Result};

pub use attestation::{EnclaveIdentity, Evidence, EvidenceKind, SyntheticQuote, VerifiedQuote};
pub use keys::{KeyFetch, KeyProvider, KeySource, KeyType, RemoteKey, RemoteKeyStore};
pub use protocol::{
    Body, EcPoint, KeyRequest, KeyResponse, Message, Request, Response, SignedServiceIdentity,
    PROTOCOL_VERSION,
};

/// Version information for the common crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get current Unix timestamp
pub fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
