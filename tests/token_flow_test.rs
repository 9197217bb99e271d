// Integration tests for authorization, storage and refresh over real HTTP

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{Duration, Utc};
use mockito::{Matcher, ServerGuard};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tokenvault::config::{BackendKind, EncryptionMode, VaultConfig};
use tokenvault::credentials::{BlobCodec, FileBackend, KeyManager, KeyMaterial, TokenStore};
use tokenvault::oauth::{HttpTokenEndpoint, ProviderConfig, ProviderRegistry};
use tokenvault::{CredentialStatus, OAuthHandler, TokenRecord, VaultError};

fn open_store(dir: &Path, key: &KeyMaterial) -> Arc<TokenStore> {
    let backend = FileBackend::new(dir).expect("Failed to create backend");
    Arc::new(TokenStore::new(Box::new(backend), BlobCodec::Keyed(key.clone())))
}

fn create_handler(server: &ServerGuard, store: Arc<TokenStore>) -> OAuthHandler {
    let mut registry = ProviderRegistry::new();
    registry.insert(ProviderConfig {
        name: "github".to_string(),
        auth_url: format!("{}/login/oauth/authorize", server.url()),
        token_url: format!("{}/login/oauth/access_token", server.url()),
        scopes: vec!["repo".to_string()],
        client_id: "client-id".to_string(),
        client_secret: Some("client-secret".to_string()),
        redirect_uri: "http://localhost:8765/oauth/github/callback".to_string(),
    });
    let registry = Arc::new(registry);
    let endpoint = HttpTokenEndpoint::new(Arc::clone(&registry), std::time::Duration::from_secs(5))
        .expect("Failed to build endpoint");

    OAuthHandler::new(store, Arc::new(endpoint), Duration::seconds(90)).with_providers(registry)
}

/// Overwrites the stored record with one that expired five minutes ago.
fn expire(store: &TokenStore, identifier: &str) {
    let mut record = store.get(identifier).unwrap();
    record.expires_at = Some(Utc::now() - Duration::minutes(5));
    record.issued_at = Utc::now() - Duration::hours(1);
    store.put(&record).unwrap();
}

#[tokio::test]
async fn test_authorize_use_and_refresh() {
    let dir = TempDir::new().unwrap();
    let key = KeyManager::generate();
    let mut server = mockito::Server::new_async().await;

    let exchange = server
        .mock("POST", "/login/oauth/access_token")
        .match_body(Matcher::UrlEncoded(
            "grant_type".into(),
            "authorization_code".into(),
        ))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token":"gho_first","refresh_token":"ghr_first","expires_in":28800,"token_type":"bearer","scope":"repo"}"#)
        .expect(1)
        .create_async()
        .await;
    let refresh = server
        .mock("POST", "/login/oauth/access_token")
        .match_body(Matcher::AllOf(vec![
            Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
            Matcher::UrlEncoded("refresh_token".into(), "ghr_first".into()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token":"gho_second","refresh_token":"ghr_second","expires_in":28800}"#)
        .expect(1)
        .create_async()
        .await;

    let store = open_store(dir.path(), &key);
    let handler = create_handler(&server, Arc::clone(&store));

    let request = handler.begin_authorization("alice:github").unwrap();
    let record = handler.complete_callback(&request.state, "code-123").await.unwrap();
    assert_eq!(record.token_type, "bearer");
    assert_eq!(record.scope, "repo");

    // Fresh: served without touching the provider
    assert_eq!(handler.token_for("alice:github").await.unwrap(), "gho_first");

    expire(&store, "alice:github");
    assert_eq!(handler.token_for("alice:github").await.unwrap(), "gho_second");

    exchange.assert_async().await;
    refresh.assert_async().await;

    // A second process with the same key sees the rotated credentials
    let reopened = open_store(dir.path(), &key);
    let persisted = reopened.get("alice:github").unwrap();
    assert_eq!(persisted.access_token, "gho_second");
    assert_eq!(persisted.refresh_token.as_deref(), Some("ghr_second"));
    assert!(persisted.expires_at.unwrap() > Utc::now() + Duration::hours(7));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_agents_trigger_one_refresh() {
    let dir = TempDir::new().unwrap();
    let key = KeyManager::generate();
    let mut server = mockito::Server::new_async().await;

    let refresh = server
        .mock("POST", "/login/oauth/access_token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token":"renewed","expires_in":3600}"#)
        .expect(1)
        .create_async()
        .await;

    let store = open_store(dir.path(), &key);
    let issued_at = Utc::now() - Duration::hours(2);
    store
        .put(&TokenRecord {
            identifier: "github".to_string(),
            access_token: "stale".to_string(),
            refresh_token: Some("ghr".to_string()),
            token_type: "Bearer".to_string(),
            expires_at: Some(issued_at + Duration::hours(1)),
            scope: String::new(),
            issued_at,
        })
        .unwrap();

    let handler = Arc::new(create_handler(&server, store));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let handler = Arc::clone(&handler);
            tokio::spawn(async move { handler.token_for("github").await })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), "renewed");
    }
    refresh.assert_async().await;
}

#[tokio::test]
async fn test_revoked_refresh_token_requires_reauthorization() {
    let dir = TempDir::new().unwrap();
    let key = KeyManager::generate();
    let mut server = mockito::Server::new_async().await;

    let _exchange = server
        .mock("POST", "/login/oauth/access_token")
        .match_body(Matcher::UrlEncoded(
            "grant_type".into(),
            "authorization_code".into(),
        ))
        .with_status(200)
        .with_body(r#"{"access_token":"a","refresh_token":"r","expires_in":3600}"#)
        .create_async()
        .await;
    let refresh = server
        .mock("POST", "/login/oauth/access_token")
        .match_body(Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()))
        .with_status(400)
        .with_body(r#"{"error":"invalid_grant"}"#)
        .expect(1)
        .create_async()
        .await;

    let store = open_store(dir.path(), &key);
    let handler = create_handler(&server, Arc::clone(&store));
    handler.complete_authorization("github", "code").await.unwrap();
    expire(&store, "github");

    let err = handler.token_for("github").await.unwrap_err();
    assert!(matches!(err, VaultError::RefreshFailed { .. }));
    assert!(!err.is_retryable());

    let err = handler.token_for("github").await.unwrap_err();
    assert!(matches!(err, VaultError::ReauthorizationRequired { .. }));
    refresh.assert_async().await;

    // A new authorization restores service
    handler.complete_authorization("github", "code").await.unwrap();
    assert_eq!(handler.token_for("github").await.unwrap(), "a");
}

#[tokio::test]
async fn test_provider_outage_keeps_previous_record() {
    let dir = TempDir::new().unwrap();
    let key = KeyManager::generate();
    let mut server = mockito::Server::new_async().await;

    let _outage = server
        .mock("POST", "/login/oauth/access_token")
        .with_status(502)
        .with_body("bad gateway")
        .create_async()
        .await;

    let store = open_store(dir.path(), &key);
    let issued_at = Utc::now() - Duration::hours(2);
    let stale = TokenRecord {
        identifier: "github".to_string(),
        access_token: "stale".to_string(),
        refresh_token: Some("ghr".to_string()),
        token_type: "Bearer".to_string(),
        expires_at: Some(issued_at + Duration::hours(1)),
        scope: String::new(),
        issued_at,
    };
    store.put(&stale).unwrap();

    let handler = create_handler(&server, Arc::clone(&store));
    let err = handler.token_for("github").await.unwrap_err();
    assert!(err.is_retryable());

    let reopened = open_store(dir.path(), &key);
    assert_eq!(reopened.get("github").unwrap(), stale);
}

#[tokio::test]
async fn test_invalid_client_keeps_refresh_token() {
    let dir = TempDir::new().unwrap();
    let key = KeyManager::generate();
    let mut server = mockito::Server::new_async().await;

    let refresh = server
        .mock("POST", "/login/oauth/access_token")
        .with_status(401)
        .with_body(r#"{"error":"invalid_client","error_description":"client secret is wrong"}"#)
        .expect(2)
        .create_async()
        .await;

    let store = open_store(dir.path(), &key);
    let issued_at = Utc::now() - Duration::hours(2);
    let stale = TokenRecord {
        identifier: "github".to_string(),
        access_token: "stale".to_string(),
        refresh_token: Some("ghr".to_string()),
        token_type: "Bearer".to_string(),
        expires_at: Some(issued_at + Duration::hours(1)),
        scope: String::new(),
        issued_at,
    };
    store.put(&stale).unwrap();

    let handler = create_handler(&server, Arc::clone(&store));
    for _ in 0..2 {
        let err = handler.token_for("github").await.unwrap_err();
        assert!(matches!(err, VaultError::RefreshFailed { .. }));
    }
    refresh.assert_async().await;

    // Fixing the client secret is enough; no re-authorization needed
    let reopened = open_store(dir.path(), &key);
    assert_eq!(reopened.get("github").unwrap(), stale);
}

#[tokio::test]
async fn test_tampered_entry_is_rejected() {
    let dir = TempDir::new().unwrap();
    let key = KeyManager::generate();
    let store = open_store(dir.path(), &key);
    let issued_at = Utc::now();
    store
        .put(&TokenRecord {
            identifier: "github".to_string(),
            access_token: "secret".to_string(),
            refresh_token: None,
            token_type: "Bearer".to_string(),
            expires_at: None,
            scope: String::new(),
            issued_at,
        })
        .unwrap();

    // Flip one ciphertext bit inside the envelope
    let path = dir.path().join("github.token");
    let mut envelope: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    let mut blob = BASE64.decode(envelope["blob"].as_str().unwrap()).unwrap();
    let last = blob.len() - 1;
    blob[last] ^= 0x01;
    envelope["blob"] = serde_json::Value::String(BASE64.encode(&blob));
    std::fs::write(&path, serde_json::to_vec(&envelope).unwrap()).unwrap();

    let reader = open_store(dir.path(), &key);
    assert!(matches!(reader.get("github"), Err(VaultError::Integrity { .. })));
    assert!(matches!(
        reader.status("github", Duration::seconds(90)).unwrap(),
        CredentialStatus::Unreadable { .. }
    ));
}

#[tokio::test]
async fn test_zero_byte_entry_does_not_break_other_identifiers() {
    let dir = TempDir::new().unwrap();
    let key = KeyManager::generate();
    let mut server = mockito::Server::new_async().await;
    let _exchange = server
        .mock("POST", "/login/oauth/access_token")
        .with_status(200)
        .with_body(r#"{"access_token":"a","expires_in":3600}"#)
        .create_async()
        .await;

    let store = open_store(dir.path(), &key);
    let handler = create_handler(&server, Arc::clone(&store));
    handler.complete_authorization("alice:github", "c").await.unwrap();
    handler.complete_authorization("bob:github", "c").await.unwrap();

    std::fs::write(dir.path().join("alice%3Agithub.token"), b"").unwrap();
    store.clear_cache();

    assert!(matches!(
        handler.token_for("alice:github").await,
        Err(VaultError::Decode { .. })
    ));
    assert!(matches!(
        handler.status("alice:github").unwrap(),
        CredentialStatus::Unreadable { .. }
    ));
    assert_eq!(handler.token_for("bob:github").await.unwrap(), "a");
}

#[test]
fn test_store_from_config_sqlite_unencrypted() {
    let dir = TempDir::new().unwrap();
    let mut config = VaultConfig::default();
    config.storage.backend = BackendKind::Sqlite;
    config.storage.sqlite_path = dir.path().join("nested").join("tokens.db");
    config.encryption.mode = EncryptionMode::Unencrypted;

    let store = config.open_store().unwrap();
    assert!(!store.is_encrypted());

    let issued_at = Utc::now();
    store
        .put(&TokenRecord {
            identifier: "mcp".to_string(),
            access_token: "plain".to_string(),
            refresh_token: None,
            token_type: "Bearer".to_string(),
            expires_at: Some(issued_at + Duration::hours(1)),
            scope: String::new(),
            issued_at,
        })
        .unwrap();
    assert_eq!(store.list().unwrap(), vec!["mcp".to_string()]);
}

#[test]
fn test_keyed_config_without_key_refuses_to_open() {
    let dir = TempDir::new().unwrap();
    let mut config = VaultConfig::default();
    config.storage.directory = dir.path().to_path_buf();
    config.encryption.key_env = "TOKENVAULT_TEST_KEY_THAT_IS_NEVER_SET".to_string();

    assert!(matches!(config.open_store(), Err(VaultError::InvalidKey(_))));
}
