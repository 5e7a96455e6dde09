//! Vault and attestation service configuration.

use sealed_ml_common::{ChannelError, Result};

/// Key Vault REST API version for the soft (secrets) surface.
pub const VAULT_API_VERSION: &str = "7.0";
/// Key Vault REST API version for the HSM keys surface.
pub const VAULT_HSM_API_VERSION: &str = "7.0-preview";
/// Attestation service REST API version.
pub const ATTESTATION_API_VERSION: &str = "2018-09-01-preview";

/// Connection settings for a vault-backed key store.
#[derive(Debug, Clone)]
pub struct VaultConfig {
    /// OAuth2 client id used against the vault's identity provider.
    pub app_id: String,
    /// OAuth2 client secret.
    pub app_secret: String,
    /// Vault base URL, with trailing slash.
    pub url: String,
    /// Name of the managed key (secret name or HSM key name).
    pub key_name: String,
    /// Attestation service base URL, with trailing slash. Required for the
    /// HSM secure-key-release store.
    pub attestation_url: Option<String>,
    /// PEM bundle of trust anchors compiled into the enclave. `None` uses
    /// the platform store (host-side test builds only).
    pub ca_bundle_pem: Option<String>,
}

impl VaultConfig {
    pub fn new(app_id: &str, app_secret: &str, url: &str, key_name: &str) -> Self {
        Self {
            app_id: app_id.to_string(),
            app_secret: app_secret.to_string(),
            url: url.to_string(),
            key_name: key_name.to_string(),
            attestation_url: None,
            ca_bundle_pem: None,
        }
    }

    pub fn with_attestation_url(mut self, attestation_url: &str) -> Self {
        self.attestation_url = Some(attestation_url.to_string());
        self
    }

    pub fn with_ca_bundle(mut self, pem: &str) -> Self {
        self.ca_bundle_pem = Some(pem.to_string());
        self
    }

    /// Validate the URL shape the secure-key-release flow depends on: the
    /// release policy embeds `attestation_url` verbatim, so both URLs must
    /// be https and slash-terminated.
    pub fn validate_for_hsm(&self) -> Result<()> {
        for (name, url) in [
            ("vault url", Some(&self.url)),
            ("attestation url", self.attestation_url.as_ref()),
        ] {
            let Some(url) = url else {
                return Err(ChannelError::KeyRefresh(
                    "attestation url required for HSM key release".to_string(),
                ));
            };
            if !url.starts_with("https://") {
                return Err(ChannelError::KeyRefresh(format!("{} invalid: {}", name, url)));
            }
            if !url.ends_with('/') {
                return Err(ChannelError::KeyRefresh(format!(
                    "{} must end with a slash: {}",
                    name, url
                )));
            }
        }
        Ok(())
    }
}
