//! Vault-backed key store over the secrets surface.
//!
//! Keys live as hex-encoded secret values with the rollover counter kept
//! in a `version` tag. New key material is minted locally by an auxiliary
//! random provider and uploaded; the vault is the source of truth for
//! which version is current across replicas.

use async_trait::async_trait;
use serde::Deserialize;
use zeroize::Zeroizing;

use sealed_ml_common::{
    ChannelError, KeyFetch, KeyProvider, RemoteKey, RemoteKeyStore, Result,
};

use crate::config::{VaultConfig, VAULT_API_VERSION};
use crate::http_client::{HttpClient, HttpMethod};

#[derive(Deserialize)]
struct SecretBundle {
    value: String,
    tags: Option<SecretTags>,
}

#[derive(Deserialize)]
pub(crate) struct SecretTags {
    pub(crate) version: Option<String>,
}

/// Strict parse of the vault's decimal `version` tag. An absent tag means
/// version 0 (a secret stored outside our rollover scheme); a present but
/// malformed tag is an error, never silently zero.
pub(crate) fn parse_version_tag(tags: Option<SecretTags>) -> Result<u32> {
    match tags.and_then(|t| t.version) {
        None => Ok(0),
        Some(v) => v.parse::<u32>().map_err(|_| {
            ChannelError::KeyRefresh(format!("vault key version tag invalid: {:?}", v))
        }),
    }
}

pub struct VaultKeyStore {
    config: VaultConfig,
    http: HttpClient,
    /// Auxiliary provider minting upload material. Ed25519-typed so stored
    /// keys are always valid channel keys.
    material: KeyProvider,
}

impl VaultKeyStore {
    pub fn new(config: VaultConfig) -> Result<Self> {
        let http = HttpClient::new(
            &config.app_id,
            &config.app_secret,
            config.ca_bundle_pem.as_deref(),
        )?;
        Ok(Self {
            config,
            http,
            material: KeyProvider::random_ed25519(),
        })
    }

    fn secret_url(&self, version: Option<&str>) -> String {
        match version {
            Some(v) => format!(
                "{}secrets/{}/{}?api-version={}",
                self.config.url, self.config.key_name, v, VAULT_API_VERSION
            ),
            None => format!(
                "{}secrets/{}?api-version={}",
                self.config.url, self.config.key_name, VAULT_API_VERSION
            ),
        }
    }

    fn parse_secret(body: &str) -> Result<(Zeroizing<Vec<u8>>, u32)> {
        let bundle: SecretBundle = serde_json::from_str(body).map_err(|e| {
            ChannelError::KeyRefresh(format!("vault secret payload invalid: {}", e))
        })?;
        let key = Zeroizing::new(hex::decode(&bundle.value).map_err(|e| {
            ChannelError::KeyRefresh(format!("vault secret value not hex: {}", e))
        })?);
        let version = parse_version_tag(bundle.tags)?;
        Ok((key, version))
    }
}

#[async_trait]
impl RemoteKeyStore for VaultKeyStore {
    async fn fetch_key(&mut self, version: Option<&str>) -> Result<KeyFetch> {
        let url = self.secret_url(version);
        let body = match self.http.request(&url, None, &[], HttpMethod::Get).await {
            Err(ChannelError::HttpStatus { status: 404, .. }) => return Ok(KeyFetch::NotFound),
            Err(e) => return Err(e),
            Ok(body) => body,
        };

        let (key, version) = Self::parse_secret(&body)?;
        Ok(KeyFetch::Found(RemoteKey { key, version }))
    }

    async fn update_key(&mut self, new_version: u32) -> Result<RemoteKey> {
        self.material.refresh(false).await?;
        let body = serde_json::json!({
            "value": hex::encode(self.material.current_key()),
            "tags": { "version": new_version.to_string() },
        })
        .to_string();

        let response = self
            .http
            .request(
                &self.secret_url(None),
                Some(&body),
                &[("Content-Type", "application/json")],
                HttpMethod::Put,
            )
            .await?;

        let (key, version) = Self::parse_secret(&response)?;
        if version != new_version {
            return Err(ChannelError::KeyRefresh(
                "unexpected version found in tags of stored key".to_string(),
            ));
        }
        Ok(RemoteKey { key, version })
    }

    async fn delete_key(&mut self) -> Result<()> {
        self.http
            .request(
                &self.secret_url(None),
                None,
                &[("Content-Type", "application/json")],
                HttpMethod::Delete,
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{MockHttpServer, MockResponse};

    fn config_for(server: &MockHttpServer) -> VaultConfig {
        VaultConfig::new("app", "pwd", &format!("{}/", server.base_url), "svc-key")
    }

    #[test]
    fn version_tag_parses_strictly() {
        assert_eq!(parse_version_tag(None).unwrap(), 0);
        assert_eq!(
            parse_version_tag(Some(SecretTags {
                version: Some("7".to_string())
            }))
            .unwrap(),
            7
        );
        assert!(parse_version_tag(Some(SecretTags {
            version: Some("7a".to_string())
        }))
        .is_err());
        assert!(parse_version_tag(Some(SecretTags {
            version: Some("".to_string())
        }))
        .is_err());
        assert!(parse_version_tag(Some(SecretTags {
            version: Some("4294967296".to_string())
        }))
        .is_err());
    }

    #[tokio::test]
    async fn fetch_maps_404_to_not_found() {
        let server =
            MockHttpServer::start(vec![MockResponse::new(404, r#"{"error":"no secret"}"#)]).await;
        let mut store = VaultKeyStore::new(config_for(&server)).unwrap();
        assert!(matches!(
            store.fetch_key(None).await.unwrap(),
            KeyFetch::NotFound
        ));
    }

    #[tokio::test]
    async fn fetch_parses_value_and_version() {
        let key_hex = "11".repeat(32);
        let body = format!(r#"{{"value":"{}","tags":{{"version":"3"}}}}"#, key_hex);
        let server = MockHttpServer::start(vec![MockResponse::new(200, &body)]).await;

        let mut store = VaultKeyStore::new(config_for(&server)).unwrap();
        match store.fetch_key(None).await.unwrap() {
            KeyFetch::Found(remote) => {
                assert_eq!(remote.version, 3);
                assert_eq!(remote.key.len(), 32);
                assert!(remote.key.iter().all(|&b| b == 0x11));
            }
            _ => panic!("expected Found"),
        }
    }

    #[tokio::test]
    async fn update_rejects_version_mismatch() {
        // Vault echoes a different version tag than requested.
        let key_hex = "22".repeat(32);
        let body = format!(r#"{{"value":"{}","tags":{{"version":"9"}}}}"#, key_hex);
        let server = MockHttpServer::start(vec![MockResponse::new(200, &body)]).await;

        let mut store = VaultKeyStore::new(config_for(&server)).unwrap();
        let err = store.update_key(2).await.unwrap_err();
        assert!(matches!(err, ChannelError::KeyRefresh(_)));
    }

    #[tokio::test]
    async fn other_http_errors_pass_through() {
        let server =
            MockHttpServer::start(vec![MockResponse::new(500, r#"{"error":"boom"}"#)]).await;
        let mut store = VaultKeyStore::new(config_for(&server)).unwrap();
        let err = store.fetch_key(None).await.unwrap_err();
        assert!(matches!(err, ChannelError::HttpStatus { status: 500, .. }));
    }
}
