use thiserror::Error;

/// Error taxonomy for the sealed-ml secure channel.
///
/// Every failure in the core surfaces as exactly one of these kinds; the
/// core propagates and never recovers internally (the background refresher's
/// retry loop is the single exception, and it lives outside this crate).
#[derive(Error, Debug, Clone)]
pub enum ChannelError {
    // Cryptographic failures: size mismatches, AEAD authentication
    // failures, DH failures, unknown key versions.
    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("payload parse error: {0}")]
    PayloadParse(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("attestation verification failed: {0}")]
    Attestation(String),

    #[error("key refresh failed: {0}")]
    KeyRefresh(String),

    #[error("model already initialized")]
    ModelAlreadyInitialized,

    #[error("unknown request type: {0}")]
    UnknownRequestType(String),

    #[error("request execution failed: {0}")]
    Execution(String),

    // Secret-store transport kinds. A non-2xx response keeps its status
    // code so callers can map 401/403/404 to challenge/denied/not-found.
    #[error("HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),
}

impl ChannelError {
    /// Returns a stable numeric error code for this error variant,
    /// suitable for crossing a host boundary as a plain status value.
    pub fn code(&self) -> u16 {
        match self {
            ChannelError::Crypto(_) => 1100,
            ChannelError::PayloadParse(_) => 1101,
            ChannelError::Serialization(_) => 1102,
            ChannelError::Attestation(_) => 1103,
            ChannelError::KeyRefresh(_) => 1104,
            ChannelError::ModelAlreadyInitialized => 1200,
            ChannelError::UnknownRequestType(_) => 1201,
            ChannelError::Execution(_) => 1202,
            ChannelError::HttpStatus { .. } => 1300,
            ChannelError::Transport(_) => 1301,
        }
    }

    /// Fold the secret-store transport kinds into `KeyRefresh`, preserving
    /// the message. The store-backed key providers use this at their
    /// boundary: a vault that cannot be reached is a refresh failure, to be
    /// retried later, not a fatal channel error.
    pub fn into_key_refresh(self) -> ChannelError {
        match self {
            ChannelError::HttpStatus { status, body } => {
                ChannelError::KeyRefresh(format!("vault returned HTTP {}: {}", status, body))
            }
            ChannelError::Transport(msg) => ChannelError::KeyRefresh(msg),
            other => other,
        }
    }
}

/// Common result type for the sealed-ml crates.
pub type Result<T> = std::result::Result<T, ChannelError>;
