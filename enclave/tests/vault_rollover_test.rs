//! Store-backed rollover against a mock vault.
//!
//! Exercises the full provider-over-store path: initial upload when the
//! vault is empty, rollover on a subsequent full refresh, and sync-only
//! synchronization.

use sealed_ml_common::{ChannelError, KeyFetch, KeyProvider, KeyType, RemoteKeyStore};
use sealed_ml_enclave::test_helpers::{MockHttpServer, MockResponse};
use sealed_ml_enclave::{VaultConfig, VaultKeyStore};

fn secret_body(key_byte: u8, version: u32) -> String {
    format!(
        r#"{{"value":"{}","tags":{{"version":"{}"}}}}"#,
        hex::encode([key_byte; 32]),
        version
    )
}

fn config_for(server: &MockHttpServer) -> VaultConfig {
    VaultConfig::new("app-id", "app-secret", &format!("{}/", server.base_url), "svc-key")
}

#[tokio::test]
async fn empty_vault_gets_initial_version_then_rolls_over() {
    let server = MockHttpServer::start(vec![
        // Initialization: fetch misses, initial upload stores v1.
        MockResponse::new(404, r#"{"error":"secret not found"}"#),
        MockResponse::new(200, &secret_body(0x11, 1)),
        // Full refresh: vault holds v1, provider rolls over to v2.
        MockResponse::new(200, &secret_body(0x11, 1)),
        MockResponse::new(200, &secret_body(0x22, 2)),
    ])
    .await;

    let store = VaultKeyStore::new(config_for(&server)).unwrap();
    let mut provider = KeyProvider::remote(Box::new(store), KeyType::Curve25519)
        .await
        .unwrap();

    assert_eq!(provider.current_version(), 1);
    assert_eq!(provider.current_key(), [0x11u8; 32].as_slice());

    assert!(provider.refresh(false).await.unwrap());
    assert_eq!(provider.current_version(), 2);
    assert_eq!(provider.current_key(), [0x22u8; 32].as_slice());

    // The previous slot still opens version 1; anything older is gone.
    assert_eq!(provider.key(1).unwrap(), [0x11u8; 32].as_slice());
    assert!(provider.is_outdated(1).unwrap());
    assert!(!provider.is_outdated(2).unwrap());
    assert!(provider.key(0).is_err());
}

#[tokio::test]
async fn sync_only_adopts_newer_replica_key() {
    let server = MockHttpServer::start(vec![
        // Initialization: vault already holds v3.
        MockResponse::new(200, &secret_body(0x33, 3)),
        // Sync-only refresh: a replica has rolled the vault to v4.
        MockResponse::new(200, &secret_body(0x44, 4)),
        // Second sync-only refresh: nothing newer.
        MockResponse::new(200, &secret_body(0x44, 4)),
    ])
    .await;

    let store = VaultKeyStore::new(config_for(&server)).unwrap();
    let mut provider = KeyProvider::remote(Box::new(store), KeyType::Curve25519)
        .await
        .unwrap();
    assert_eq!(provider.current_version(), 3);

    assert!(provider.refresh(true).await.unwrap());
    assert_eq!(provider.current_version(), 4);
    assert_eq!(provider.key(3).unwrap(), [0x33u8; 32].as_slice());

    assert!(!provider.refresh(true).await.unwrap());
    assert_eq!(provider.current_version(), 4);
}

#[tokio::test]
async fn unreachable_vault_surfaces_as_key_refresh_error() {
    // Nothing is listening on this port.
    let config = VaultConfig::new("app", "pwd", "http://127.0.0.1:1/", "svc-key");
    let store = VaultKeyStore::new(config).unwrap();

    let err = KeyProvider::remote(Box::new(store), KeyType::Curve25519)
        .await
        .unwrap_err();
    assert!(matches!(err, ChannelError::KeyRefresh(_)));
}

#[tokio::test]
async fn delete_key_issues_vault_delete() {
    let server = MockHttpServer::start(vec![MockResponse::new(200, "{}")]).await;
    let mut store = VaultKeyStore::new(config_for(&server)).unwrap();
    store.delete_key().await.unwrap();
}

#[tokio::test]
async fn fetch_distinguishes_not_found_from_parse_failures() {
    let server = MockHttpServer::start(vec![
        MockResponse::new(404, "{}"),
        MockResponse::new(200, r#"{"value":"zz-not-hex"}"#),
    ])
    .await;

    let mut store = VaultKeyStore::new(config_for(&server)).unwrap();
    assert!(matches!(
        store.fetch_key(None).await.unwrap(),
        KeyFetch::NotFound
    ));
    assert!(matches!(
        store.fetch_key(None).await.unwrap_err(),
        ChannelError::KeyRefresh(_)
    ));
}
