//! End-to-end command flows over the directory-backed collaborators

mod common;

use base64::prelude::*;
use certgate_auth::InitMode;
use certgate_dispatch::{
    DirectoryGatewayClient, DirectorySecretStore, GatewayClient, MemoryGatewayClient, MemorySecretStore,
    SecretStore,
};
use common::{chain_material, dispatcher, gateway_document, TestProvider};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tempfile::TempDir;

fn b64(text: &str) -> String {
    BASE64_STANDARD.encode(text.as_bytes())
}

#[tokio::test]
async fn test_bundle_to_gateway_listener() {
    let vault_dir = TempDir::new().unwrap();
    let gateway_dir = TempDir::new().unwrap();
    std::fs::create_dir_all(gateway_dir.path().join("rg-prod")).unwrap();
    std::fs::write(
        gateway_dir.path().join("rg-prod/edge.json"),
        serde_json::to_vec_pretty(&gateway_document("rg-prod", "edge")).unwrap(),
    )
    .unwrap();

    let store: Arc<dyn SecretStore> =
        Arc::new(DirectorySecretStore::open(vault_dir.path(), "https://prod.vault.azure.net").unwrap());
    let gateways: Arc<dyn GatewayClient> = Arc::new(DirectoryGatewayClient::open(gateway_dir.path()).unwrap());
    let mut dispatcher = dispatcher(TestProvider::logged_in(), store, gateways).await;

    let m = chain_material("shop.test");
    let bundle = format!("{}{}{}", m.leaf_pem, m.intermediate_pem, m.key_pem);
    let import = json!({
        "command": "import_bundle",
        "name": "shop-tls",
        "bundle_pem_base64": b64(&bundle),
        "password": "export-secret"
    });
    let response = dispatcher.handle_json(&import.to_string()).await;
    assert!(response.success, "{}", response.message);
    assert!(response.message.contains("add_gateway_ssl_certificate"));
    let chain = response.data.as_ref().unwrap()["chain"].as_array().unwrap().clone();
    assert_eq!(chain.len(), 2);

    let add = json!({
        "command": "add_gateway_ssl_certificate",
        "resource_group_name": "rg-prod",
        "appgw_name": "edge",
        "cert_name": "shop-ssl",
        "keyvault_cert_name": "shop-tls"
    });
    let response = dispatcher.handle_json(&add.to_string()).await;
    assert!(response.success, "{}", response.message);
    assert_eq!(
        response.data.unwrap()["key_vault_secret_id"],
        json!("https://prod.vault.azure.net/secrets/shop-tls")
    );

    let attach = json!({
        "command": "attach_listener_certificate",
        "resource_group": "rg-prod",
        "gateway": "edge",
        "listener": "listener-443",
        "cert_name": "shop-ssl"
    });
    let response = dispatcher.handle_json(&attach.to_string()).await;
    assert!(response.success, "{}", response.message);

    // both collaborators persisted their state
    let on_disk: serde_json::Value =
        serde_json::from_slice(&std::fs::read(gateway_dir.path().join("rg-prod/edge.json")).unwrap()).unwrap();
    let listener_ref = on_disk["properties"]["httpListeners"][0]["properties"]["sslCertificate"]["id"]
        .as_str()
        .unwrap();
    assert!(listener_ref.ends_with("/applicationGateways/edge/sslCertificates/shop-ssl"));
    assert!(listener_ref.starts_with("/subscriptions/00000000-0000-0000-0000-000000000001/"));

    let reopened = DirectorySecretStore::open(vault_dir.path(), "https://prod.vault.azure.net").unwrap();
    let cert = reopened.get_certificate("shop-tls").await.unwrap();
    assert!(cert.subject.contains("shop.test"));
}

#[tokio::test]
async fn test_login_after_failure_unblocks_commands() {
    let vault_dir = TempDir::new().unwrap();
    let provider = Arc::new(TestProvider::default());
    let store: Arc<dyn SecretStore> =
        Arc::new(DirectorySecretStore::open(vault_dir.path(), "https://v.vault.azure.net").unwrap());
    let gateways: Arc<dyn GatewayClient> = Arc::new(MemoryGatewayClient::new());
    let mut dispatcher = dispatcher(provider.clone(), store, gateways).await;

    let set = json!({ "command": "set_secret", "name": "token", "value": "abc" }).to_string();
    let response = dispatcher.handle_json(&set).await;
    assert!(!response.success);
    assert!(response.message.contains("Not logged in"));
    assert_eq!(provider.calls(), 1);

    provider.logged_in.store(true, Ordering::SeqCst);
    let response = dispatcher.handle_json(&set).await;
    assert!(response.success, "{}", response.message);

    // authenticated now: further commands add no provider calls
    let calls = provider.calls();
    let response = dispatcher.handle_json(r#"{"command": "list_secrets"}"#).await;
    assert!(response.success);
    assert_eq!(provider.calls(), calls);
}

#[tokio::test]
async fn test_eager_check_only_start() {
    let provider = TestProvider::logged_in();
    let auth = common::auth_manager(provider.clone(), InitMode::EagerCheckOnly).await;
    assert!(auth.session().is_authenticated());
    assert_eq!(provider.calls(), 1);
}

#[tokio::test]
async fn test_encrypted_key_error_is_sanitized_with_hint() {
    let store: Arc<dyn SecretStore> = Arc::new(MemorySecretStore::default());
    let gateways: Arc<dyn GatewayClient> = Arc::new(MemoryGatewayClient::new());
    let mut dispatcher = dispatcher(TestProvider::logged_in(), store, gateways).await;

    let encrypted_key = std::fs::read_to_string(
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("crates/certgate-cert/tests/fixtures/rsa_pkcs8_encrypted.key"),
    )
    .unwrap();
    let m = chain_material("locked.test");

    let command = json!({
        "command": "import_crt",
        "name": "locked",
        "cert_crt_base64": BASE64_STANDARD.encode(&m.leaf_der),
        "key_base64": b64(&encrypted_key)
    });
    let response = dispatcher.handle_json(&command.to_string()).await;
    assert!(!response.success);
    assert!(response.message.contains("passphrase"));
    assert!(!response.message.contains("-----BEGIN"));
}
