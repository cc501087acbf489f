//! Common test utilities and helpers for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use certgate_auth::{
    AccessToken, AuthManager, CliToolProbe, CredentialError, CredentialHandle,
    CredentialProvider, FixedAnswer, InitMode,
};
use certgate_core::config::AuthConfig;
use certgate_core::sanitize::Sanitizer;
use certgate_dispatch::{Dispatcher, GatewayClient, SecretStore};
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Credential provider whose login state the test flips.
#[derive(Default)]
pub struct TestProvider {
    pub logged_in: AtomicBool,
    pub calls: AtomicUsize,
}

impl TestProvider {
    pub fn logged_in() -> Arc<Self> {
        let provider = Self::default();
        provider.logged_in.store(true, Ordering::SeqCst);
        Arc::new(provider)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialProvider for TestProvider {
    async fn acquire_token(&self, _scope: &str) -> Result<AccessToken, CredentialError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.logged_in.load(Ordering::SeqCst) {
            Ok(AccessToken::new("integration-token", None))
        } else {
            Err(CredentialError::new("ERROR: Please run 'az login' to setup account."))
        }
    }

    async fn upgrade(&self, token: AccessToken, scope: &str) -> Result<CredentialHandle, CredentialError> {
        Ok(CredentialHandle::new(token, scope))
    }
}

/// An auth manager that never touches the real CLI.
pub async fn auth_manager(provider: Arc<TestProvider>, mode: InitMode) -> AuthManager {
    let config = AuthConfig::default();
    AuthManager::new(
        &config,
        provider,
        Arc::new(CliToolProbe::new(&config)),
        Arc::new(FixedAnswer(false)),
    )
    .start(mode)
    .await
    .expect("non-interactive start never fails")
}

pub async fn dispatcher(
    provider: Arc<TestProvider>,
    store: Arc<dyn SecretStore>,
    gateways: Arc<dyn GatewayClient>,
) -> Dispatcher {
    Dispatcher::new(
        auth_manager(provider, InitMode::Lazy).await,
        store,
        gateways,
        Sanitizer::default(),
    )
}

/// Leaf signed by an intermediate signed by a root, all PEM.
pub struct ChainMaterial {
    pub leaf_pem: String,
    pub leaf_der: Vec<u8>,
    pub intermediate_pem: String,
    pub root_pem: String,
    pub key_pem: String,
}

fn params(name: &str, ca: bool) -> CertificateParams {
    let mut params = CertificateParams::new(vec![name.to_string()]).expect("params");
    params.distinguished_name.push(DnType::CommonName, name);
    if ca {
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    }
    params
}

pub fn chain_material(leaf_name: &str) -> ChainMaterial {
    let root_kp = KeyPair::generate().expect("root key");
    let root = params("root.test", true).self_signed(&root_kp).expect("root cert");

    let inter_kp = KeyPair::generate().expect("intermediate key");
    let inter = params("intermediate.test", true)
        .signed_by(&inter_kp, &root, &root_kp)
        .expect("intermediate cert");

    let leaf_kp = KeyPair::generate().expect("leaf key");
    let leaf = params(leaf_name, false)
        .signed_by(&leaf_kp, &inter, &inter_kp)
        .expect("leaf cert");

    ChainMaterial {
        leaf_pem: leaf.pem(),
        leaf_der: leaf.der().to_vec(),
        intermediate_pem: inter.pem(),
        root_pem: root.pem(),
        key_pem: leaf_kp.serialize_pem(),
    }
}

/// An ARM-shaped gateway document with one HTTPS listener and no certificates.
pub fn gateway_document(resource_group: &str, name: &str) -> serde_json::Value {
    let id = format!(
        "/subscriptions/00000000-0000-0000-0000-000000000001/resourceGroups/{}/providers/Microsoft.Network/applicationGateways/{}",
        resource_group, name
    );
    serde_json::json!({
        "id": id,
        "name": name,
        "location": "westeurope",
        "properties": {
            "operationalState": "Running",
            "sku": { "name": "WAF_v2", "tier": "WAF_v2", "capacity": 1 },
            "sslCertificates": [],
            "httpListeners": [
                {
                    "name": "listener-443",
                    "properties": {
                        "protocol": "Https",
                        "frontendPort": { "id": format!("{}/frontendPorts/port-443", id) }
                    }
                }
            ]
        }
    })
}
