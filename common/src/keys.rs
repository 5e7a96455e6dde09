//! Versioned key management for the secure channel.
//!
//! A `KeyProvider` owns the server's (or client's) 32-byte secret together
//! with a two-slot version history: the current key and the immediately
//! previous one, kept alive so in-flight requests sealed under the old
//! version still open during a rollover.
//!
//! Variant behavior (static, locally random, vault-backed) enters through
//! `KeySource`; all lifecycle accounting — slot rotation, version counters,
//! the refresh timestamp, the initialization guard — is shared here. The
//! vault-backed variants speak through the async [`RemoteKeyStore`] seam
//! and share one rollover algorithm.

use std::fmt;
use std::time::SystemTime;

use async_trait::async_trait;
use zeroize::{Zeroize, Zeroizing};

use crate::crypto;
use crate::error::{ChannelError, Result};

/// How key bytes may be used. `Curve25519` keys are clamped per
/// RFC 8032 §5.1.5 and are valid as both an X25519 scalar and an Ed25519
/// seed; `Generic` keys carry no structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Generic,
    Curve25519,
}

/// A key fetched from a remote store, with its store-assigned version.
pub struct RemoteKey {
    pub key: Zeroizing<Vec<u8>>,
    pub version: u32,
}

impl fmt::Debug for RemoteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteKey")
            .field("version", &self.version)
            .field("key", &"[redacted]")
            .finish()
    }
}

/// Outcome of a remote fetch. `Denied` means the store refused release
/// (e.g. the attestation no longer satisfies the key's release policy).
pub enum KeyFetch {
    Found(RemoteKey),
    NotFound,
    Denied,
}

impl fmt::Debug for KeyFetch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyFetch::Found(remote) => f
                .debug_tuple("Found")
                .field(&format_args!("RemoteKey {{ version: {}, key: [redacted] }}", remote.version))
                .finish(),
            KeyFetch::NotFound => write!(f, "NotFound"),
            KeyFetch::Denied => write!(f, "Denied"),
        }
    }
}

/// Seam to a remote, versioned secret store.
///
/// `fetch_key(None)` retrieves the most recent version; `fetch_key(Some(v))`
/// retrieves an exact store version identifier. `update_key` creates and
/// stores new material tagged with `new_version` and returns it.
#[async_trait]
pub trait RemoteKeyStore: Send + Sync {
    async fn fetch_key(&mut self, version: Option<&str>) -> Result<KeyFetch>;
    async fn update_key(&mut self, new_version: u32) -> Result<RemoteKey>;
    async fn delete_key(&mut self) -> Result<()>;
}

/// Two-slot key history plus lifecycle bookkeeping.
struct KeyBundle {
    current_key: Zeroizing<Vec<u8>>,
    previous_key: Zeroizing<Vec<u8>>,
    current_version: u32,
    previous_version: u32,
    key_size: usize,
    key_type: KeyType,
    last_refreshed: SystemTime,
    initialized: bool,
}

impl KeyBundle {
    fn new(key_size: usize, key_type: KeyType) -> Self {
        Self {
            current_key: Zeroizing::new(vec![0u8; key_size]),
            previous_key: Zeroizing::new(vec![0u8; key_size]),
            current_version: 0,
            previous_version: 0,
            key_size,
            key_type,
            last_refreshed: SystemTime::UNIX_EPOCH,
            initialized: false,
        }
    }

    /// Move the current slot to the previous slot and adopt a new key.
    fn rotate(&mut self, new_key: Zeroizing<Vec<u8>>, new_version: u32) {
        self.previous_key = std::mem::replace(&mut self.current_key, new_key);
        self.previous_version = self.current_version;
        self.current_version = new_version;
    }

    /// Adopt a new key without touching the previous slot. Used when the
    /// store had no usable key to preserve (initial upload, policy-denied
    /// recovery).
    fn adopt(&mut self, new_key: Zeroizing<Vec<u8>>, new_version: u32) {
        self.current_key = new_key;
        self.current_version = new_version;
    }

    fn key(&self, version: u32) -> Result<&[u8]> {
        if version == self.current_version {
            Ok(&self.current_key)
        } else if version == self.previous_version {
            Ok(&self.previous_key)
        } else {
            Err(ChannelError::Crypto(
                "key with specified version not found".to_string(),
            ))
        }
    }

    fn is_outdated(&self, version: u32) -> Result<bool> {
        if version == self.current_version {
            Ok(false)
        } else if version == self.previous_version {
            Ok(true)
        } else {
            Err(ChannelError::Crypto(
                "key with specified version not found".to_string(),
            ))
        }
    }

    fn wipe(&mut self) {
        self.current_key.zeroize();
        self.previous_key.zeroize();
        self.current_version = 0;
        self.previous_version = 0;
        self.initialized = false;
    }
}

/// Variant-specific refresh behavior.
pub enum KeySource {
    /// Caller-supplied key; refresh is a no-op.
    Static,
    /// Locally generated from the OS CSPRNG on every non-sync refresh.
    Random,
    /// Backed by a remote versioned store.
    Remote(Box<dyn RemoteKeyStore>),
}

/// A versioned secret with two-slot rollover history.
pub struct KeyProvider {
    bundle: KeyBundle,
    source: KeySource,
}

impl fmt::Debug for KeyProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyProvider")
            .field("current_version", &self.bundle.current_version)
            .field("previous_version", &self.bundle.previous_version)
            .field("key_type", &self.bundle.key_type)
            .field("initialized", &self.bundle.initialized)
            .field("current_key", &"[redacted]")
            .field("previous_key", &"[redacted]")
            .finish()
    }
}

impl KeyProvider {
    /// Provider over a fixed, caller-supplied key. Never rotates.
    pub fn static_key(key: &[u8], key_type: KeyType) -> Self {
        let mut bundle = KeyBundle::new(key.len(), key_type);
        bundle.current_key = Zeroizing::new(key.to_vec());
        bundle.initialized = true;
        Self {
            bundle,
            source: KeySource::Static,
        }
    }

    /// Locally random generic key of the given size.
    pub fn random(key_size: usize) -> Self {
        Self::random_with_type(key_size, KeyType::Generic)
    }

    /// Locally random 32-byte key clamped for Curve25519/Ed25519 dual use.
    pub fn random_ed25519() -> Self {
        Self::random_with_type(crypto::KEY_SIZE, KeyType::Curve25519)
    }

    fn random_with_type(key_size: usize, key_type: KeyType) -> Self {
        let mut bundle = KeyBundle::new(key_size, key_type);
        Self::refresh_random(&mut bundle, false);
        bundle.last_refreshed = SystemTime::now();
        bundle.initialized = true;
        Self {
            bundle,
            source: KeySource::Random,
        }
    }

    /// Provider backed by a remote versioned store. Performs the initial
    /// synchronizing refresh before returning.
    pub async fn remote(store: Box<dyn RemoteKeyStore>, key_type: KeyType) -> Result<Self> {
        let mut provider = Self {
            bundle: KeyBundle::new(crypto::KEY_SIZE, key_type),
            source: KeySource::Remote(store),
        };
        provider.refresh(false).await?;
        provider.bundle.initialized = true;
        Ok(provider)
    }

    /// Refresh the key material. With `sync_only` the provider only adopts
    /// a newer key that already exists elsewhere and never performs a
    /// rollover of its own. Returns whether the active key changed.
    pub async fn refresh(&mut self, sync_only: bool) -> Result<bool> {
        let refreshed = match &mut self.source {
            KeySource::Static => false,
            KeySource::Random => Self::refresh_random(&mut self.bundle, sync_only),
            KeySource::Remote(store) => {
                Self::refresh_remote(&mut self.bundle, store.as_mut(), sync_only).await?
            }
        };
        if refreshed {
            self.bundle.last_refreshed = SystemTime::now();
        }
        Ok(refreshed)
    }

    fn refresh_random(bundle: &mut KeyBundle, sync_only: bool) -> bool {
        if sync_only {
            return false;
        }
        let mut new_key = Zeroizing::new(vec![0u8; bundle.key_size]);
        crypto::randomize(&mut new_key);
        if bundle.key_type == KeyType::Curve25519 {
            // RFC 8032 §5.1.5
            new_key[0] &= 248;
            new_key[31] &= 127;
            new_key[31] |= 64;
        }
        let next_version = bundle.current_version + 1;
        bundle.rotate(new_key, next_version);
        true
    }

    async fn refresh_remote(
        bundle: &mut KeyBundle,
        store: &mut dyn RemoteKeyStore,
        sync_only: bool,
    ) -> Result<bool> {
        let fetched = store
            .fetch_key(None)
            .await
            .map_err(ChannelError::into_key_refresh)?;

        match fetched {
            // No key in the store yet: upload the initial version.
            KeyFetch::NotFound => {
                let new_key = store
                    .update_key(1)
                    .await
                    .map_err(ChannelError::into_key_refresh)?;
                bundle.adopt(new_key.key, new_key.version);
                Ok(true)
            }

            // Release denied, typically after a release-policy change. A
            // synchronizing refresh must not discard a key that may still
            // be valid elsewhere; a full refresh recovers by overwriting.
            KeyFetch::Denied => {
                if sync_only {
                    return Err(ChannelError::KeyRefresh(
                        "vault key export denied during sync-only refresh".to_string(),
                    ));
                }
                let new_key = store
                    .update_key(1)
                    .await
                    .map_err(ChannelError::into_key_refresh)?;
                bundle.adopt(new_key.key, new_key.version);
                Ok(true)
            }

            KeyFetch::Found(remote) => {
                // Adopt the store's key if we're initializing or it is
                // newer than what we hold.
                if !bundle.initialized || remote.version > bundle.current_version {
                    bundle.rotate(remote.key, remote.version);
                    return Ok(true);
                }
                if sync_only {
                    return Ok(false);
                }
                // Store is not ahead of us: roll over.
                let new_key = store
                    .update_key(bundle.current_version + 1)
                    .await
                    .map_err(ChannelError::into_key_refresh)?;
                bundle.rotate(new_key.key, new_key.version);
                Ok(true)
            }
        }
    }

    pub fn current_key(&self) -> &[u8] {
        &self.bundle.current_key
    }

    pub fn current_version(&self) -> u32 {
        self.bundle.current_version
    }

    /// Key bytes for a version, which must match the current or previous
    /// slot.
    pub fn key(&self, version: u32) -> Result<&[u8]> {
        self.bundle.key(version)
    }

    /// True iff `version` matches the previous slot; error if it matches
    /// neither slot.
    pub fn is_outdated(&self, version: u32) -> Result<bool> {
        self.bundle.is_outdated(version)
    }

    pub fn key_type(&self) -> KeyType {
        self.bundle.key_type
    }

    pub fn last_refreshed(&self) -> SystemTime {
        self.bundle.last_refreshed
    }

    /// Wipe both slots and mark the provider uninitialized. Store-backed
    /// providers also delete the remote key.
    pub async fn delete_key(&mut self) -> Result<()> {
        self.bundle.wipe();
        if let KeySource::Remote(store) = &mut self.source {
            store.delete_key().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_provider_versions() {
        let kp = KeyProvider::random(crypto::KEY_SIZE);
        assert_eq!(kp.current_version(), 1);
        assert_eq!(kp.current_key().len(), crypto::KEY_SIZE);
        assert_ne!(kp.current_key(), vec![0u8; crypto::KEY_SIZE].as_slice());
    }

    #[tokio::test]
    async fn random_provider_rollover_history() {
        let mut kp = KeyProvider::random(crypto::KEY_SIZE);
        let v1_key = kp.current_key().to_vec();

        assert!(kp.refresh(false).await.unwrap());
        assert_eq!(kp.current_version(), 2);
        assert_eq!(kp.key(1).unwrap(), v1_key.as_slice());
        assert!(kp.is_outdated(1).unwrap());
        assert!(!kp.is_outdated(2).unwrap());
        assert!(kp.key(0).is_err());
        assert!(kp.is_outdated(7).is_err());
    }

    #[tokio::test]
    async fn random_provider_sync_only_is_noop() {
        let mut kp = KeyProvider::random(crypto::KEY_SIZE);
        let key_before = kp.current_key().to_vec();
        assert!(!kp.refresh(true).await.unwrap());
        assert_eq!(kp.current_version(), 1);
        assert_eq!(kp.current_key(), key_before.as_slice());
    }

    #[tokio::test]
    async fn repeated_refresh_walks_versions() {
        let mut kp = KeyProvider::random_ed25519();
        for _ in 0..4 {
            kp.refresh(false).await.unwrap();
        }
        assert_eq!(kp.current_version(), 5);
        assert!(kp.is_outdated(4).unwrap());
        assert!(kp.key(3).is_err());
    }

    #[test]
    fn ed25519_provider_is_clamped() {
        let kp = KeyProvider::random_ed25519();
        let key = kp.current_key();
        assert_eq!(kp.key_type(), KeyType::Curve25519);
        assert_eq!(key[0] & 7, 0);
        assert_eq!(key[31] & 0x80, 0);
        assert_eq!(key[31] & 0x40, 0x40);
    }

    #[tokio::test]
    async fn static_provider_never_rotates() {
        let key = [0x42u8; 32];
        let mut kp = KeyProvider::static_key(&key, KeyType::Curve25519);
        assert!(!kp.refresh(false).await.unwrap());
        assert_eq!(kp.current_version(), 0);
        assert_eq!(kp.current_key(), key.as_slice());
    }

    #[tokio::test]
    async fn delete_wipes_slots() {
        let mut kp = KeyProvider::random_ed25519();
        kp.refresh(false).await.unwrap();
        kp.delete_key().await.unwrap();
        assert_eq!(kp.current_version(), 0);
        assert!(kp.current_key().is_empty());
    }

    /// In-memory store used to exercise the shared rollover algorithm.
    struct FakeStore {
        stored: Option<(Vec<u8>, u32)>,
        deny: bool,
    }

    #[async_trait]
    impl RemoteKeyStore for FakeStore {
        async fn fetch_key(&mut self, _version: Option<&str>) -> Result<KeyFetch> {
            if self.deny {
                return Ok(KeyFetch::Denied);
            }
            match &self.stored {
                None => Ok(KeyFetch::NotFound),
                Some((key, version)) => Ok(KeyFetch::Found(RemoteKey {
                    key: Zeroizing::new(key.clone()),
                    version: *version,
                })),
            }
        }

        async fn update_key(&mut self, new_version: u32) -> Result<RemoteKey> {
            let mut key = vec![0u8; crypto::KEY_SIZE];
            crypto::randomize(&mut key);
            key[0] &= 248;
            key[31] &= 127;
            key[31] |= 64;
            self.stored = Some((key.clone(), new_version));
            self.deny = false;
            Ok(RemoteKey {
                key: Zeroizing::new(key),
                version: new_version,
            })
        }

        async fn delete_key(&mut self) -> Result<()> {
            self.stored = None;
            Ok(())
        }
    }

    #[tokio::test]
    async fn store_backed_initial_upload_and_rollover() {
        let store = Box::new(FakeStore {
            stored: None,
            deny: false,
        });
        let mut kp = KeyProvider::remote(store, KeyType::Curve25519).await.unwrap();
        assert_eq!(kp.current_version(), 1);

        let v1_key = kp.current_key().to_vec();

        // Store already holds v1: a full refresh rolls over to v2.
        assert!(kp.refresh(false).await.unwrap());
        assert_eq!(kp.current_version(), 2);
        assert_eq!(kp.key(1).unwrap(), v1_key.as_slice());
        assert!(kp.key(0).is_err());

        // Nothing newer in the store: sync-only refresh is a no-op.
        assert!(!kp.refresh(true).await.unwrap());
        assert_eq!(kp.current_version(), 2);
    }

    #[tokio::test]
    async fn store_backed_adopts_newer_remote_version() {
        let store = Box::new(FakeStore {
            stored: Some((vec![0x11; 32], 5)),
            deny: false,
        });
        let mut kp = KeyProvider::remote(store, KeyType::Curve25519).await.unwrap();
        assert_eq!(kp.current_version(), 5);

        // Simulate a replica having rolled the store forward.
        if let KeySource::Remote(store) = &mut kp.source {
            store.update_key(6).await.unwrap();
        }
        assert!(kp.refresh(true).await.unwrap());
        assert_eq!(kp.current_version(), 6);
        assert!(kp.is_outdated(5).unwrap());
    }

    #[tokio::test]
    async fn denied_full_refresh_recovers_with_version_one() {
        // Initialization runs a full refresh, so a denying store is
        // recovered from by overwriting with a fresh version-1 key.
        let deny_store = Box::new(FakeStore {
            stored: Some((vec![0x22; 32], 3)),
            deny: true,
        });
        let kp = KeyProvider::remote(deny_store, KeyType::Curve25519)
            .await
            .unwrap();
        assert_eq!(kp.current_version(), 1);
    }

    #[tokio::test]
    async fn denied_sync_only_refresh_fails() {
        let mut kp = KeyProvider {
            bundle: KeyBundle::new(crypto::KEY_SIZE, KeyType::Curve25519),
            source: KeySource::Remote(Box::new(FakeStore {
                stored: Some((vec![0x33; 32], 2)),
                deny: true,
            })),
        };
        kp.bundle.initialized = true;
        kp.bundle.current_version = 2;

        let err = kp.refresh(true).await.unwrap_err();
        assert!(matches!(err, ChannelError::KeyRefresh(_)));
        // The held key survives the failure.
        assert_eq!(kp.current_version(), 2);
    }
}
