//! Application gateway collaborator and document helpers.
//!
//! Gateways are handled as opaque ARM-shaped JSON documents. The client only
//! moves documents in and out; the helpers below read and edit the two
//! collections this tool cares about:
//!
//! - `properties.sslCertificates[]` with `properties.keyVaultSecretId`
//! - `properties.httpListeners[]` with `properties.sslCertificate.id`

use async_trait::async_trait;
use certgate_core::config::{BackendKind, GatewayConfig};
use certgate_core::error::ResultExt;
use certgate_core::{CertgateError, GatewayError, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Reads and writes application gateway documents.
#[async_trait]
pub trait GatewayClient: Send + Sync {
    async fn get_gateway(&self, resource_group: &str, name: &str) -> Result<Value>;

    /// Replaces the stored document and returns what the backend now holds.
    async fn update_gateway(&self, resource_group: &str, name: &str, document: Value) -> Result<Value>;

    /// All gateways, or those of one resource group.
    async fn list_gateways(&self, resource_group: Option<&str>) -> Result<Vec<Value>>;
}

/// Builds the gateway client selected by `config`.
pub fn gateway_client_from_config(config: &GatewayConfig) -> Result<Arc<dyn GatewayClient>> {
    match (config.backend.kind, &config.backend.path) {
        (BackendKind::Memory, _) => Ok(Arc::new(MemoryGatewayClient::new())),
        (BackendKind::Directory, Some(path)) => Ok(Arc::new(DirectoryGatewayClient::open(path)?)),
        (BackendKind::Directory, None) => {
            Err(GatewayError::backend("the directory backend needs a path").into())
        }
    }
}

fn not_found(resource_group: &str, name: &str) -> CertgateError {
    GatewayError::GatewayNotFound {
        resource_group: resource_group.to_string(),
        name: name.to_string(),
    }
    .into()
}

/// Gateways held in process memory, keyed by resource group and name.
#[derive(Debug, Default)]
pub struct MemoryGatewayClient {
    gateways: RwLock<BTreeMap<(String, String), Value>>,
}

impl MemoryGatewayClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a gateway document.
    pub fn insert(&self, resource_group: &str, name: &str, document: Value) {
        self.gateways
            .write()
            .insert((resource_group.to_string(), name.to_string()), document);
    }

    pub fn with_gateway(self, resource_group: &str, name: &str, document: Value) -> Self {
        self.insert(resource_group, name, document);
        self
    }
}

#[async_trait]
impl GatewayClient for MemoryGatewayClient {
    async fn get_gateway(&self, resource_group: &str, name: &str) -> Result<Value> {
        self.gateways
            .read()
            .get(&(resource_group.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| not_found(resource_group, name))
    }

    async fn update_gateway(&self, resource_group: &str, name: &str, document: Value) -> Result<Value> {
        let mut gateways = self.gateways.write();
        let slot = gateways
            .get_mut(&(resource_group.to_string(), name.to_string()))
            .ok_or_else(|| not_found(resource_group, name))?;
        *slot = document.clone();
        debug!(resource_group, name, "Updated gateway");
        Ok(document)
    }

    async fn list_gateways(&self, resource_group: Option<&str>) -> Result<Vec<Value>> {
        Ok(self
            .gateways
            .read()
            .iter()
            .filter(|((rg, _), _)| resource_group.map_or(true, |wanted| rg.as_str() == wanted))
            .map(|(_, doc)| doc.clone())
            .collect())
    }
}

/// Gateways stored as `<root>/<resource group>/<name>.json`.
#[derive(Debug)]
pub struct DirectoryGatewayClient {
    root: PathBuf,
    lock: Mutex<()>,
}

impl DirectoryGatewayClient {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            lock: Mutex::new(()),
        })
    }

    fn path_for(&self, resource_group: &str, name: &str) -> PathBuf {
        self.root.join(resource_group).join(format!("{}.json", name))
    }

    fn read_document(path: &Path) -> Result<Value> {
        let raw = std::fs::read(path)?;
        serde_json::from_slice(&raw).map_err(|e| {
            GatewayError::invalid_document(format!("{}: {}", path.display(), e)).into()
        })
    }
}

#[async_trait]
impl GatewayClient for DirectoryGatewayClient {
    async fn get_gateway(&self, resource_group: &str, name: &str) -> Result<Value> {
        let path = self.path_for(resource_group, name);
        if !path.is_file() {
            return Err(not_found(resource_group, name));
        }
        Self::read_document(&path)
    }

    async fn update_gateway(&self, resource_group: &str, name: &str, document: Value) -> Result<Value> {
        let _guard = self.lock.lock();
        let path = self.path_for(resource_group, name);
        let dir = path
            .parent()
            .filter(|_| path.is_file())
            .ok_or_else(|| not_found(resource_group, name))?;

        let json = serde_json::to_vec_pretty(&document).internal_context("encoding gateway document")?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&json)?;
        tmp.persist(&path).map_err(|e| CertgateError::from(e.error))?;

        debug!(path = %path.display(), "Wrote gateway document");
        Ok(document)
    }

    async fn list_gateways(&self, resource_group: Option<&str>) -> Result<Vec<Value>> {
        let (base, depth) = match resource_group {
            Some(rg) => (self.root.join(rg), 1),
            None => (self.root.clone(), 2),
        };
        if !base.is_dir() {
            return Ok(Vec::new());
        }

        let mut gateways = Vec::new();
        let entries = WalkDir::new(&base)
            .min_depth(depth)
            .max_depth(depth)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"));

        for entry in entries {
            // one unreadable gateway must not hide the others
            match Self::read_document(entry.path()) {
                Ok(doc) => gateways.push(doc),
                Err(e) => warn!(path = %entry.path().display(), error = %e, "Skipping gateway document"),
            }
        }
        Ok(gateways)
    }
}

/// SKU block of a gateway summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkuInfo {
    pub name: Option<String>,
    pub tier: Option<String>,
    pub capacity: Option<u64>,
}

/// One line of `list_gateways`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewaySummary {
    pub name: String,
    pub resource_group: Option<String>,
    pub location: Option<String>,
    pub state: Option<String>,
    pub sku: Option<SkuInfo>,
}

impl GatewaySummary {
    pub fn from_document(document: &Value) -> Self {
        let properties = &document["properties"];
        let sku = properties.get("sku").or_else(|| document.get("sku"));
        Self {
            name: str_field(document, "name").unwrap_or_default(),
            resource_group: document
                .get("id")
                .and_then(Value::as_str)
                .and_then(|id| id_segment(id, 4)),
            location: str_field(document, "location"),
            state: str_field(properties, "operationalState"),
            sku: sku.filter(|s| s.is_object()).map(|s| SkuInfo {
                name: str_field(s, "name"),
                tier: str_field(s, "tier"),
                capacity: s.get("capacity").and_then(Value::as_u64),
            }),
        }
    }
}

/// An SSL certificate entry on a gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SslCertificateInfo {
    pub name: String,
    pub key_vault_secret_id: Option<String>,
    pub provisioning_state: Option<String>,
}

/// An HTTP listener on a gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerInfo {
    pub name: String,
    pub protocol: Option<String>,
    pub frontend_port: Option<String>,
    pub ssl_certificate: Option<String>,
}

/// Detailed view returned by `get_gateway`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayDetails {
    #[serde(flatten)]
    pub summary: GatewaySummary,
    pub ssl_certificates: Vec<SslCertificateInfo>,
    pub http_listeners: Vec<ListenerInfo>,
}

impl GatewayDetails {
    pub fn from_document(document: &Value) -> Self {
        Self {
            summary: GatewaySummary::from_document(document),
            ssl_certificates: ssl_certificates(document),
            http_listeners: http_listeners(document),
        }
    }
}

/// What `upsert_ssl_certificate` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SslAction {
    Added,
    Updated,
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Segment `index` of a `/`-separated resource id (`""` before the first slash
/// counts as segment 0).
fn id_segment(id: &str, index: usize) -> Option<String> {
    id.split('/')
        .nth(index)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn last_id_segment(reference: &Value) -> Option<String> {
    reference
        .get("id")
        .and_then(Value::as_str)
        .and_then(|id| id.rsplit('/').next())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn entries<'a>(document: &'a Value, key: &str) -> impl Iterator<Item = &'a Value> {
    document["properties"][key]
        .as_array()
        .into_iter()
        .flatten()
}

/// Subscription id taken from the document's resource id.
pub fn subscription_from_document(document: &Value) -> Option<String> {
    document
        .get("id")
        .and_then(Value::as_str)
        .and_then(|id| id_segment(id, 2))
}

pub fn ssl_certificates(document: &Value) -> Vec<SslCertificateInfo> {
    entries(document, "sslCertificates")
        .map(|cert| {
            let props = &cert["properties"];
            SslCertificateInfo {
                name: str_field(cert, "name").unwrap_or_default(),
                key_vault_secret_id: str_field(props, "keyVaultSecretId"),
                provisioning_state: str_field(props, "provisioningState"),
            }
        })
        .collect()
}

pub fn http_listeners(document: &Value) -> Vec<ListenerInfo> {
    entries(document, "httpListeners")
        .map(|listener| {
            let props = &listener["properties"];
            ListenerInfo {
                name: str_field(listener, "name").unwrap_or_default(),
                protocol: str_field(props, "protocol"),
                frontend_port: last_id_segment(&props["frontendPort"]),
                ssl_certificate: last_id_segment(&props["sslCertificate"]),
            }
        })
        .collect()
}

/// Resource id of an SSL certificate entry, as a listener references it.
pub fn ssl_certificate_resource_id(
    subscription_id: &str,
    resource_group: &str,
    gateway: &str,
    certificate: &str,
) -> String {
    format!(
        "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Network/applicationGateways/{}/sslCertificates/{}",
        subscription_id, resource_group, gateway, certificate
    )
}

fn properties_mut(document: &mut Value) -> std::result::Result<&mut Map<String, Value>, GatewayError> {
    let root = document
        .as_object_mut()
        .ok_or_else(|| GatewayError::invalid_document("gateway document is not an object"))?;
    root.entry("properties")
        .or_insert_with(|| json!({}))
        .as_object_mut()
        .ok_or_else(|| GatewayError::invalid_document("'properties' is not an object"))
}

fn array_mut<'a>(
    document: &'a mut Value,
    key: &str,
) -> std::result::Result<&'a mut Vec<Value>, GatewayError> {
    properties_mut(document)?
        .entry(key)
        .or_insert_with(|| json!([]))
        .as_array_mut()
        .ok_or_else(|| GatewayError::invalid_document(format!("'properties.{}' is not an array", key)))
}

fn entry_properties<'a>(
    entry: &'a mut Value,
    what: &str,
) -> std::result::Result<&'a mut Map<String, Value>, GatewayError> {
    entry
        .as_object_mut()
        .ok_or_else(|| GatewayError::invalid_document(format!("{} entry is not an object", what)))?
        .entry("properties")
        .or_insert_with(|| json!({}))
        .as_object_mut()
        .ok_or_else(|| GatewayError::invalid_document(format!("{} properties are not an object", what)))
}

fn named<'a>(items: &'a mut [Value], name: &str) -> Option<&'a mut Value> {
    items
        .iter_mut()
        .find(|item| item.get("name").and_then(Value::as_str) == Some(name))
}

/// Points the SSL certificate `name` at `secret_id`, adding the entry when
/// the gateway does not have one yet.
pub fn upsert_ssl_certificate(
    document: &mut Value,
    name: &str,
    secret_id: &str,
) -> std::result::Result<SslAction, GatewayError> {
    let certs = array_mut(document, "sslCertificates")?;
    if let Some(existing) = named(certs, name) {
        entry_properties(existing, "SSL certificate")?
            .insert("keyVaultSecretId".to_string(), json!(secret_id));
        return Ok(SslAction::Updated);
    }

    certs.push(json!({
        "name": name,
        "properties": { "keyVaultSecretId": secret_id }
    }));
    Ok(SslAction::Added)
}

/// Drops the SSL certificate entry `name`.
pub fn remove_ssl_certificate(
    document: &mut Value,
    gateway: &str,
    name: &str,
) -> std::result::Result<(), GatewayError> {
    let certs = array_mut(document, "sslCertificates")?;
    let before = certs.len();
    certs.retain(|item| item.get("name").and_then(Value::as_str) != Some(name));
    if certs.len() == before {
        return Err(GatewayError::SslCertificateNotFound {
            gateway: gateway.to_string(),
            certificate: name.to_string(),
        });
    }
    Ok(())
}

/// Sets the certificate reference of `listener` to `certificate_id`.
pub fn attach_listener_certificate(
    document: &mut Value,
    gateway: &str,
    listener: &str,
    certificate_id: &str,
) -> std::result::Result<(), GatewayError> {
    let listeners = array_mut(document, "httpListeners")?;
    let entry = named(listeners, listener).ok_or_else(|| GatewayError::ListenerNotFound {
        gateway: gateway.to_string(),
        listener: listener.to_string(),
    })?;
    entry_properties(entry, "listener")?
        .insert("sslCertificate".to_string(), json!({ "id": certificate_id }));

    info!(gateway, listener, certificate_id, "Attached certificate to listener");
    Ok(())
}
