//! Vault-backed key store over the HSM keys surface with secure key
//! release.
//!
//! The HSM never hands the key out on credentials alone: export requires a
//! current attestation token, minted by posting a fresh quote (with the
//! enclave-held data it commits to) to the attestation service. The key is
//! created non-exportable-except-by-policy, keyed to the enclave's signer
//! identity.
//!
//! The HSM stores AES-256 material; on release the 32 raw bytes are
//! clamped in place into a Curve25519 scalar. 32 uniform bytes retain
//! ~251 bits of entropy after clamping.

use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::Deserialize;
use zeroize::Zeroizing;

use sealed_ml_common::crypto;
use sealed_ml_common::{ChannelError, KeyFetch, RemoteKey, RemoteKeyStore, Result};

use crate::attestation::SecureReleaseAttestor;
use crate::config::{VaultConfig, ATTESTATION_API_VERSION, VAULT_HSM_API_VERSION};
use crate::http_client::{HttpClient, HttpMethod};
use crate::vault_client::{parse_version_tag, SecretTags};

const JSON_HEADERS: &[(&str, &str)] = &[
    ("Content-Type", "application/json"),
    ("Accept", "application/json"),
];

#[derive(Deserialize)]
struct ExportResponse {
    /// Base64 (padding possibly stripped) of the released key bundle JSON.
    value: String,
}

#[derive(Deserialize)]
struct ReleasedKeyBundle {
    key: ReleasedWebKey,
    tags: Option<SecretTags>,
}

#[derive(Deserialize)]
struct ReleasedWebKey {
    /// Base64url key material, JWK-style.
    k: String,
}

#[derive(Deserialize)]
struct CreateResponse {
    key: CreatedKeyId,
    tags: Option<SecretTags>,
}

#[derive(Deserialize)]
struct CreatedKeyId {
    kid: String,
}

pub struct VaultHsmKeyStore {
    config: VaultConfig,
    http_vault: HttpClient,
    http_attest: HttpClient,
    attestor: Box<dyn SecureReleaseAttestor>,
}

impl VaultHsmKeyStore {
    pub fn new(config: VaultConfig, attestor: Box<dyn SecureReleaseAttestor>) -> Result<Self> {
        config.validate_for_hsm()?;
        Self::build(config, attestor)
    }

    /// Construct without URL validation (for tests against a plain-HTTP
    /// mock vault).
    #[doc(hidden)]
    pub fn with_test_config(
        config: VaultConfig,
        attestor: Box<dyn SecureReleaseAttestor>,
    ) -> Result<Self> {
        Self::build(config, attestor)
    }

    fn build(config: VaultConfig, attestor: Box<dyn SecureReleaseAttestor>) -> Result<Self> {
        let http_vault = HttpClient::new(
            &config.app_id,
            &config.app_secret,
            config.ca_bundle_pem.as_deref(),
        )?;
        let http_attest = HttpClient::new(
            &config.app_id,
            &config.app_secret,
            config.ca_bundle_pem.as_deref(),
        )?;
        Ok(Self {
            config,
            http_vault,
            http_attest,
            attestor,
        })
    }

    fn key_identifier(&self, version: Option<&str>) -> String {
        let id = format!("{}keys/{}", self.config.url, self.config.key_name);
        match version {
            Some(v) => format!("{}/{}", id, v),
            None => id,
        }
    }

    fn attestation_url(&self) -> Result<&str> {
        self.config.attestation_url.as_deref().ok_or_else(|| {
            ChannelError::KeyRefresh("attestation url required for HSM key release".to_string())
        })
    }

    /// Quote the enclave and trade the quote for a signed attestation
    /// token. The response body is a JSON-quoted JWT and is spliced into
    /// the export request verbatim.
    async fn attestation_token(&mut self) -> Result<String> {
        let (quote, enclave_held_data) = self.attestor.release_quote()?;
        let body = serde_json::json!({
            "Quote": URL_SAFE_NO_PAD.encode(&quote),
            "EnclaveHeldData": URL_SAFE_NO_PAD.encode(&enclave_held_data),
        })
        .to_string();

        let url = format!(
            "{}attest/Tee/OpenEnclave?api-version={}",
            self.attestation_url()?,
            ATTESTATION_API_VERSION
        );
        self.http_attest
            .request(&url, Some(&body), JSON_HEADERS, HttpMethod::Post)
            .await
    }

    fn parse_released_key(body: &str) -> Result<(Zeroizing<Vec<u8>>, u32)> {
        let export: ExportResponse = serde_json::from_str(body).map_err(|e| {
            ChannelError::KeyRefresh(format!("vault export payload invalid: {}", e))
        })?;

        let mut value = export.value;
        let pad = value.len() % 4;
        if pad != 0 {
            value.push_str(&"=".repeat(4 - pad));
        }
        let bundle_bytes = BASE64.decode(value.as_bytes()).map_err(|e| {
            ChannelError::KeyRefresh(format!("released key bundle not base64: {}", e))
        })?;
        let bundle: ReleasedKeyBundle = serde_json::from_slice(&bundle_bytes).map_err(|e| {
            ChannelError::KeyRefresh(format!("released key bundle invalid: {}", e))
        })?;

        let k = bundle.key.k.trim_end_matches('=');
        let mut key = Zeroizing::new(URL_SAFE_NO_PAD.decode(k).map_err(|e| {
            ChannelError::KeyRefresh(format!("released key material not base64url: {}", e))
        })?);
        if key.len() != crypto::KEY_SIZE {
            return Err(ChannelError::KeyRefresh(format!(
                "released key has unexpected size: {}",
                key.len()
            )));
        }
        crypto::clamp_curve25519(&mut key)?;

        let version = parse_version_tag(bundle.tags)?;
        Ok((key, version))
    }
}

#[async_trait]
impl RemoteKeyStore for VaultHsmKeyStore {
    async fn fetch_key(&mut self, version: Option<&str>) -> Result<KeyFetch> {
        let token = self.attestation_token().await?;
        let body = format!("{{ \"env\": {} }}", token);
        let url = format!(
            "{}/export?api-version={}",
            self.key_identifier(version),
            VAULT_HSM_API_VERSION
        );

        let response = match self
            .http_vault
            .request(&url, Some(&body), JSON_HEADERS, HttpMethod::Post)
            .await
        {
            Err(ChannelError::HttpStatus { status: 404, .. }) => return Ok(KeyFetch::NotFound),
            // Typically "target environment attestation does not meet key
            // release policy requirements" after a policy change.
            Err(ChannelError::HttpStatus { status: 403, .. }) => return Ok(KeyFetch::Denied),
            Err(e) => return Err(e),
            Ok(body) => body,
        };

        let (key, version) = Self::parse_released_key(&response)?;
        Ok(KeyFetch::Found(RemoteKey { key, version }))
    }

    async fn update_key(&mut self, new_version: u32) -> Result<RemoteKey> {
        let mrsigner = hex::encode(self.attestor.signer_id()?);
        let attestation_url = self.attestation_url()?.to_string();

        let mut release_policy = serde_json::Map::new();
        release_policy.insert(
            attestation_url,
            serde_json::json!({ "sgx-mrsigner": mrsigner }),
        );
        let body = serde_json::json!({
            "kty": "AES-HSM",
            "key_size": crypto::KEY_SIZE * 8,
            "key_ops": [],
            "attributes": { "exportable": true },
            "release_policy": release_policy,
            "tags": { "version": new_version.to_string() },
        })
        .to_string();

        let url = format!(
            "{}/create?api-version={}",
            self.key_identifier(None),
            VAULT_HSM_API_VERSION
        );
        let response = self
            .http_vault
            .request(&url, Some(&body), JSON_HEADERS, HttpMethod::Post)
            .await?;

        let created: CreateResponse = serde_json::from_str(&response).map_err(|e| {
            ChannelError::KeyRefresh(format!("vault create payload invalid: {}", e))
        })?;
        let version = parse_version_tag(created.tags)?;
        if version != new_version {
            return Err(ChannelError::KeyRefresh(
                "unexpected version found in tags of created key".to_string(),
            ));
        }

        // The kid carries the store-assigned version identifier. Fetch by
        // that exact identifier: an unversioned fetch may land on a vault
        // node that hasn't replicated the new key yet and hand back a
        // stale one.
        let key_id = self.key_identifier(None);
        let exact_version = created
            .key
            .kid
            .strip_prefix(&format!("{}/", key_id))
            .ok_or_else(|| {
                ChannelError::KeyRefresh(format!(
                    "unexpected key identifier in create response: {}",
                    created.key.kid
                ))
            })?
            .to_string();

        match self.fetch_key(Some(&exact_version)).await? {
            KeyFetch::Found(remote) => {
                if remote.version < new_version {
                    return Err(ChannelError::KeyRefresh(format!(
                        "unexpected version in exported key after rollover: expected={} actual={}",
                        new_version, remote.version
                    )));
                }
                Ok(remote)
            }
            _ => Err(ChannelError::KeyRefresh(
                "vault key export failed after creation".to_string(),
            )),
        }
    }

    async fn delete_key(&mut self) -> Result<()> {
        let url = format!(
            "{}?api-version={}",
            self.key_identifier(None),
            VAULT_HSM_API_VERSION
        );
        self.http_vault
            .request(&url, None, JSON_HEADERS, HttpMethod::Delete)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build the double-encoded export payload the vault returns, with the
    /// outer base64 padding stripped the way the service strips it.
    fn export_body(key: &[u8; 32], version: u32) -> String {
        let bundle = serde_json::json!({
            "key": { "k": URL_SAFE_NO_PAD.encode(key) },
            "tags": { "version": version.to_string() },
        })
        .to_string();
        let value = BASE64.encode(bundle.as_bytes());
        let value = value.trim_end_matches('=');
        format!(r#"{{"value":"{}"}}"#, value)
    }

    #[test]
    fn released_key_is_clamped() {
        let raw = [0xFFu8; 32];
        let body = export_body(&raw, 4);
        let (key, version) = VaultHsmKeyStore::parse_released_key(&body).unwrap();
        assert_eq!(version, 4);
        assert_eq!(key.len(), 32);
        assert_eq!(key[0], 0xF8);
        assert_eq!(key[31], 0x7F);

        // Middle bytes pass through untouched.
        assert!(key[1..31].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn released_key_rejects_wrong_size() {
        let bundle = serde_json::json!({
            "key": { "k": URL_SAFE_NO_PAD.encode([0u8; 16]) },
            "tags": { "version": "1" },
        })
        .to_string();
        let body = format!(r#"{{"value":"{}"}}"#, BASE64.encode(bundle.as_bytes()));
        assert!(VaultHsmKeyStore::parse_released_key(&body).is_err());
    }

    #[test]
    fn released_key_rejects_garbage() {
        assert!(VaultHsmKeyStore::parse_released_key("not json").is_err());
        assert!(VaultHsmKeyStore::parse_released_key(r#"{"value":"!!!"}"#).is_err());
    }
}
