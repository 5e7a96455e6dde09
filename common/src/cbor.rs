//! CBOR serialization helpers wrapping ciborium.
//!
//! Thin `to_vec`/`from_slice` functions so callers don't deal with
//! ciborium's reader/writer API or its two-sided error types.

use serde::{de::DeserializeOwned, Serialize};

/// Unified CBOR error type covering both serialization and deserialization.
#[derive(Debug)]
pub struct CborError(pub String);

impl std::fmt::Display for CborError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for CborError {}

impl<T: std::fmt::Debug> From<ciborium::ser::Error<T>> for CborError {
    fn from(e: ciborium::ser::Error<T>) -> Self {
        Self(format!("{:?}", e))
    }
}

impl<T: std::fmt::Debug> From<ciborium::de::Error<T>> for CborError {
    fn from(e: ciborium::de::Error<T>) -> Self {
        Self(format!("{:?}", e))
    }
}

/// Serialize a value to CBOR bytes.
pub fn to_vec<T: Serialize>(val: &T) -> Result<Vec<u8>, CborError> {
    let mut buf = Vec::new();
    ciborium::into_writer(val, &mut buf)?;
    Ok(buf)
}

/// Deserialize a value from CBOR bytes.
pub fn from_slice<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CborError> {
    ciborium::from_reader(bytes).map_err(CborError::from)
}
