//! Secret store collaborator.
//!
//! [`SecretStore`] is the Key Vault-shaped surface the dispatcher talks to:
//! plain secrets plus imported certificates. Importing a certificate also
//! publishes its container as a secret of the same name, which is what a
//! gateway `keyVaultSecretId` points at.
//!
//! Two backends ship with the crate: [`MemorySecretStore`] for tests and
//! one-shot runs, and [`DirectorySecretStore`], which keeps the whole vault
//! in a single JSON document rewritten atomically on every change.

use async_trait::async_trait;
use base64::prelude::*;
use certgate_cert::{parse_certificate, read_container, thumbprint_hex};
use certgate_core::config::{BackendKind, StoreConfig};
use certgate_core::error::ResultExt;
use certgate_core::{CertgateError, CertificateError, Result, StoreError};
use chrono::{DateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Vault URL used when none is configured.
pub const DEFAULT_VAULT_URL: &str = "https://certgate-local.vault.azure.net";

const PKCS12_CONTENT_TYPE: &str = "application/x-pkcs12";
const VAULT_FILE: &str = "vault.json";

static NAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9A-Za-z-]{1,127}$").expect("valid name pattern"));

/// Metadata of a stored secret. Never carries the value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretProperties {
    pub name: String,
    pub id: String,
    pub version: String,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

/// A secret together with its value.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret {
    #[serde(flatten)]
    pub properties: SecretProperties,
    pub value: String,
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secret")
            .field("properties", &self.properties)
            .field("value", &"[REDACTED]")
            .finish()
    }
}

/// Metadata of an imported certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateProperties {
    pub name: String,
    pub id: String,
    pub secret_id: String,
    pub version: String,
    pub enabled: bool,
    pub subject: String,
    pub thumbprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

/// Result of `import_certificate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportedCertificate {
    pub name: String,
    pub id: String,
    pub secret_id: String,
    pub thumbprint: String,
    /// False when an existing certificate got a new version
    pub is_new: bool,
}

/// Receipt of a delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedItem {
    pub name: String,
    pub deleted_on: DateTime<Utc>,
}

/// Key Vault-shaped secret and certificate store.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Base URL the ids of this store are built from.
    fn vault_url(&self) -> &str;

    /// Creates a secret or adds a new version of an existing one.
    async fn set_secret(&self, name: &str, value: &str) -> Result<SecretProperties>;

    async fn get_secret(&self, name: &str) -> Result<Secret>;

    async fn list_secrets(&self) -> Result<Vec<SecretProperties>>;

    async fn delete_secret(&self, name: &str) -> Result<DeletedItem>;

    /// Imports a PKCS#12 container. `password` opens it when protected.
    async fn import_certificate(
        &self,
        name: &str,
        pkcs12: &[u8],
        password: Option<&str>,
    ) -> Result<ImportedCertificate>;

    async fn get_certificate(&self, name: &str) -> Result<CertificateProperties>;

    async fn list_certificates(&self) -> Result<Vec<CertificateProperties>>;

    async fn delete_certificate(&self, name: &str) -> Result<DeletedItem>;
}

/// Checks a secret or certificate name against the vault naming rules.
pub fn validate_name(name: &str) -> std::result::Result<(), StoreError> {
    if NAME_PATTERN.is_match(name) {
        Ok(())
    } else {
        Err(StoreError::InvalidName {
            name: name.to_string(),
            reason: "use 1-127 characters from 0-9, a-z, A-Z and '-'".to_string(),
        })
    }
}

/// Builds the store selected by `config`.
pub fn store_from_config(config: &StoreConfig) -> Result<Arc<dyn SecretStore>> {
    match (config.kind, &config.path) {
        (BackendKind::Memory, _) => Ok(Arc::new(MemorySecretStore::new(DEFAULT_VAULT_URL))),
        (BackendKind::Directory, Some(path)) => {
            Ok(Arc::new(DirectorySecretStore::open(path, DEFAULT_VAULT_URL)?))
        }
        (BackendKind::Directory, None) => Err(StoreError::backend(
            "the directory backend needs a path",
        )
        .into()),
    }
}

/// Whole vault contents. Both backends apply the same operations to it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct VaultState {
    #[serde(default)]
    secrets: BTreeMap<String, Secret>,
    #[serde(default)]
    certificates: BTreeMap<String, CertificateProperties>,
}

fn new_version() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn secret_base(vault_url: &str, name: &str) -> String {
    format!("{}/secrets/{}", vault_url.trim_end_matches('/'), name)
}

fn certificate_base(vault_url: &str, name: &str) -> String {
    format!("{}/certificates/{}", vault_url.trim_end_matches('/'), name)
}

impl VaultState {
    fn put_secret(
        &mut self,
        vault_url: &str,
        name: &str,
        value: String,
        content_type: Option<String>,
    ) -> SecretProperties {
        let now = Utc::now();
        let version = new_version();
        let created = self
            .secrets
            .get(name)
            .map(|s| s.properties.created)
            .unwrap_or(now);
        let properties = SecretProperties {
            name: name.to_string(),
            id: format!("{}/{}", secret_base(vault_url, name), version),
            version,
            enabled: true,
            content_type,
            created,
            updated: now,
        };
        self.secrets.insert(
            name.to_string(),
            Secret {
                properties: properties.clone(),
                value,
            },
        );
        properties
    }

    fn get_secret(&self, name: &str) -> Result<Secret> {
        self.secrets
            .get(name)
            .cloned()
            .ok_or_else(|| secret_not_found(name))
    }

    fn list_secrets(&self) -> Vec<SecretProperties> {
        self.secrets.values().map(|s| s.properties.clone()).collect()
    }

    fn delete_secret(&mut self, name: &str) -> Result<DeletedItem> {
        self.secrets
            .remove(name)
            .map(|_| deleted(name))
            .ok_or_else(|| secret_not_found(name))
    }

    fn import_certificate(
        &mut self,
        vault_url: &str,
        name: &str,
        pkcs12: &[u8],
        password: Option<&str>,
    ) -> Result<ImportedCertificate> {
        let contents = read_container(pkcs12, password)?;
        if contents.key.is_none() {
            return Err(CertificateError::NoKeyMaterial.into());
        }
        let leaf_der = contents.leaf().ok_or_else(|| {
            CertificateError::malformed_certificate("container holds no certificate")
        })?;
        let leaf = parse_certificate(leaf_der)?;

        let is_new = !self.certificates.contains_key(name);
        let secret = self.put_secret(
            vault_url,
            name,
            BASE64_STANDARD.encode(pkcs12),
            Some(PKCS12_CONTENT_TYPE.to_string()),
        );

        let now = Utc::now();
        let created = self
            .certificates
            .get(name)
            .map(|c| c.created)
            .unwrap_or(now);
        let properties = CertificateProperties {
            name: name.to_string(),
            id: format!("{}/{}", certificate_base(vault_url, name), secret.version),
            secret_id: secret_base(vault_url, name),
            version: secret.version,
            enabled: true,
            subject: leaf.subject().to_string(),
            thumbprint: thumbprint_hex(leaf.der()),
            expires: Utc.timestamp_opt(leaf.not_after(), 0).single(),
            created,
            updated: now,
        };
        let imported = ImportedCertificate {
            name: name.to_string(),
            id: properties.id.clone(),
            secret_id: properties.secret_id.clone(),
            thumbprint: properties.thumbprint.clone(),
            is_new,
        };
        self.certificates.insert(name.to_string(), properties);
        Ok(imported)
    }

    fn get_certificate(&self, name: &str) -> Result<CertificateProperties> {
        self.certificates
            .get(name)
            .cloned()
            .ok_or_else(|| certificate_not_found(name))
    }

    fn list_certificates(&self) -> Vec<CertificateProperties> {
        self.certificates.values().cloned().collect()
    }

    fn delete_certificate(&mut self, name: &str) -> Result<DeletedItem> {
        if self.certificates.remove(name).is_none() {
            return Err(certificate_not_found(name));
        }
        self.secrets.remove(name);
        Ok(deleted(name))
    }
}

fn secret_not_found(name: &str) -> CertgateError {
    StoreError::SecretNotFound {
        name: name.to_string(),
    }
    .into()
}

fn certificate_not_found(name: &str) -> CertgateError {
    StoreError::CertificateNotFound {
        name: name.to_string(),
    }
    .into()
}

fn deleted(name: &str) -> DeletedItem {
    DeletedItem {
        name: name.to_string(),
        deleted_on: Utc::now(),
    }
}

/// Process-local store.
#[derive(Debug)]
pub struct MemorySecretStore {
    vault_url: String,
    state: RwLock<VaultState>,
}

impl MemorySecretStore {
    pub fn new(vault_url: impl Into<String>) -> Self {
        Self {
            vault_url: vault_url.into(),
            state: RwLock::new(VaultState::default()),
        }
    }
}

impl Default for MemorySecretStore {
    fn default() -> Self {
        Self::new(DEFAULT_VAULT_URL)
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    fn vault_url(&self) -> &str {
        &self.vault_url
    }

    async fn set_secret(&self, name: &str, value: &str) -> Result<SecretProperties> {
        validate_name(name)?;
        let props = self
            .state
            .write()
            .put_secret(&self.vault_url, name, value.to_string(), None);
        debug!(name, version = %props.version, "Stored secret");
        Ok(props)
    }

    async fn get_secret(&self, name: &str) -> Result<Secret> {
        self.state.read().get_secret(name)
    }

    async fn list_secrets(&self) -> Result<Vec<SecretProperties>> {
        Ok(self.state.read().list_secrets())
    }

    async fn delete_secret(&self, name: &str) -> Result<DeletedItem> {
        self.state.write().delete_secret(name)
    }

    async fn import_certificate(
        &self,
        name: &str,
        pkcs12: &[u8],
        password: Option<&str>,
    ) -> Result<ImportedCertificate> {
        validate_name(name)?;
        let imported = self
            .state
            .write()
            .import_certificate(&self.vault_url, name, pkcs12, password)?;
        info!(name, thumbprint = %imported.thumbprint, is_new = imported.is_new, "Imported certificate");
        Ok(imported)
    }

    async fn get_certificate(&self, name: &str) -> Result<CertificateProperties> {
        self.state.read().get_certificate(name)
    }

    async fn list_certificates(&self) -> Result<Vec<CertificateProperties>> {
        Ok(self.state.read().list_certificates())
    }

    async fn delete_certificate(&self, name: &str) -> Result<DeletedItem> {
        self.state.write().delete_certificate(name)
    }
}

/// Store persisted as `vault.json` under a directory.
///
/// Each mutation loads the document, applies the change and replaces the
/// file through a temporary sibling, so a crash never leaves half a vault.
#[derive(Debug)]
pub struct DirectorySecretStore {
    vault_url: String,
    file: PathBuf,
    lock: Mutex<()>,
}

impl DirectorySecretStore {
    /// Opens (creating if needed) the vault under `dir`.
    pub fn open(dir: impl AsRef<Path>, vault_url: impl Into<String>) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            vault_url: vault_url.into(),
            file: dir.join(VAULT_FILE),
            lock: Mutex::new(()),
        })
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    fn load(&self) -> Result<VaultState> {
        if !self.file.exists() {
            return Ok(VaultState::default());
        }
        let raw = std::fs::read(&self.file)?;
        serde_json::from_slice(&raw).map_err(|e| {
            StoreError::backend(format!("{}: {}", self.file.display(), e)).into()
        })
    }

    fn save(&self, state: &VaultState) -> Result<()> {
        let dir = self
            .file
            .parent()
            .ok_or_else(|| StoreError::backend("vault file has no parent directory"))?;
        let json = serde_json::to_vec_pretty(state).internal_context("encoding vault state")?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&json)?;
        tmp.persist(&self.file).map_err(|e| CertgateError::from(e.error))?;
        Ok(())
    }

    fn read<T>(&self, f: impl FnOnce(&VaultState) -> Result<T>) -> Result<T> {
        let _guard = self.lock.lock();
        f(&self.load()?)
    }

    fn write<T>(&self, f: impl FnOnce(&mut VaultState) -> Result<T>) -> Result<T> {
        let _guard = self.lock.lock();
        let mut state = self.load()?;
        let out = f(&mut state)?;
        self.save(&state)?;
        Ok(out)
    }
}

#[async_trait]
impl SecretStore for DirectorySecretStore {
    fn vault_url(&self) -> &str {
        &self.vault_url
    }

    async fn set_secret(&self, name: &str, value: &str) -> Result<SecretProperties> {
        validate_name(name)?;
        self.write(|state| Ok(state.put_secret(&self.vault_url, name, value.to_string(), None)))
    }

    async fn get_secret(&self, name: &str) -> Result<Secret> {
        self.read(|state| state.get_secret(name))
    }

    async fn list_secrets(&self) -> Result<Vec<SecretProperties>> {
        self.read(|state| Ok(state.list_secrets()))
    }

    async fn delete_secret(&self, name: &str) -> Result<DeletedItem> {
        self.write(|state| state.delete_secret(name))
    }

    async fn import_certificate(
        &self,
        name: &str,
        pkcs12: &[u8],
        password: Option<&str>,
    ) -> Result<ImportedCertificate> {
        validate_name(name)?;
        let imported = self.write(|state| {
            state.import_certificate(&self.vault_url, name, pkcs12, password)
        })?;
        info!(
            name,
            thumbprint = %imported.thumbprint,
            is_new = imported.is_new,
            file = %self.file.display(),
            "Imported certificate"
        );
        Ok(imported)
    }

    async fn get_certificate(&self, name: &str) -> Result<CertificateProperties> {
        self.read(|state| state.get_certificate(name))
    }

    async fn list_certificates(&self) -> Result<Vec<CertificateProperties>> {
        self.read(|state| Ok(state.list_certificates()))
    }

    async fn delete_certificate(&self, name: &str) -> Result<DeletedItem> {
        self.write(|state| state.delete_certificate(name))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use certgate_cert::{encode_pkcs12, parse_certificate, parse_private_key};
    use rcgen::{CertificateParams, DnType, KeyPair};
    use tempfile::TempDir;

    /// A self-signed leaf as an unprotected or protected container.
    pub(crate) fn sample_pfx(name: &str, password: Option<&str>) -> Vec<u8> {
        let kp = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec![name.to_string()]).unwrap();
        params.distinguished_name.push(DnType::CommonName, name);
        let cert = params.self_signed(&kp).unwrap();
        let leaf = parse_certificate(cert.der()).unwrap();
        let key = parse_private_key(kp.serialize_pem().as_bytes(), None).unwrap();
        encode_pkcs12(&leaf, Some(&key), &[], password)
            .unwrap()
            .into_bytes()
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("web-cert-01").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("has_underscore").is_err());
        assert!(validate_name(&"a".repeat(128)).is_err());
    }

    #[tokio::test]
    async fn test_secret_lifecycle() {
        let store = MemorySecretStore::default();
        let first = store.set_secret("db-password", "one").await.unwrap();
        let second = store.set_secret("db-password", "two").await.unwrap();
        assert_ne!(first.version, second.version);
        assert_eq!(first.created, second.created);
        assert!(second.id.starts_with(DEFAULT_VAULT_URL));

        let secret = store.get_secret("db-password").await.unwrap();
        assert_eq!(secret.value, "two");
        assert!(!format!("{:?}", secret).contains("two"));

        assert_eq!(store.list_secrets().await.unwrap().len(), 1);
        store.delete_secret("db-password").await.unwrap();
        assert!(matches!(
            store.get_secret("db-password").await,
            Err(CertgateError::Store(StoreError::SecretNotFound { .. }))
        ));
    }

    #[tokio::test]
    async fn test_import_certificate_publishes_secret() {
        let store = MemorySecretStore::default();
        let pfx = sample_pfx("web.example.com", None);

        let imported = store.import_certificate("web", &pfx, None).await.unwrap();
        assert!(imported.is_new);
        assert_eq!(imported.secret_id, format!("{}/secrets/web", DEFAULT_VAULT_URL));
        assert_eq!(imported.thumbprint.len(), 40);

        let secret = store.get_secret("web").await.unwrap();
        assert_eq!(secret.properties.content_type.as_deref(), Some(PKCS12_CONTENT_TYPE));

        let props = store.get_certificate("web").await.unwrap();
        assert!(props.subject.contains("web.example.com"));
        assert!(props.expires.is_some());

        let again = store.import_certificate("web", &pfx, None).await.unwrap();
        assert!(!again.is_new);
        assert_eq!(store.list_certificates().await.unwrap().len(), 1);

        store.delete_certificate("web").await.unwrap();
        assert!(store.get_secret("web").await.is_err());
    }

    #[tokio::test]
    async fn test_import_protected_container() {
        let store = MemorySecretStore::default();
        let pfx = sample_pfx("secure.example.com", Some("s3cret"));

        let missing = store.import_certificate("secure", &pfx, None).await;
        assert!(matches!(
            missing,
            Err(CertgateError::Certificate(CertificateError::PassphraseRequired))
        ));
        let wrong = store.import_certificate("secure", &pfx, Some("nope")).await;
        assert!(matches!(
            wrong,
            Err(CertgateError::Certificate(CertificateError::PassphraseIncorrectOrMalformedKey))
        ));
        assert!(store.import_certificate("secure", &pfx, Some("s3cret")).await.is_ok());
    }

    #[tokio::test]
    async fn test_import_rejects_garbage() {
        let store = MemorySecretStore::default();
        assert!(store.import_certificate("bad", b"garbage", None).await.is_err());
        assert!(store.list_certificates().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_directory_store_persists() {
        let dir = TempDir::new().unwrap();
        let pfx = sample_pfx("disk.example.com", None);
        {
            let store = DirectorySecretStore::open(dir.path(), DEFAULT_VAULT_URL).unwrap();
            store.set_secret("api-key", "value").await.unwrap();
            store.import_certificate("disk", &pfx, None).await.unwrap();
            assert!(store.file().exists());
        }

        let reopened = DirectorySecretStore::open(dir.path(), DEFAULT_VAULT_URL).unwrap();
        assert_eq!(reopened.get_secret("api-key").await.unwrap().value, "value");
        assert_eq!(reopened.list_certificates().await.unwrap().len(), 1);
        reopened.delete_secret("api-key").await.unwrap();

        let again = DirectorySecretStore::open(dir.path(), DEFAULT_VAULT_URL).unwrap();
        assert!(again.get_secret("api-key").await.is_err());
    }

    #[test]
    fn test_store_from_config() {
        let config = StoreConfig {
            kind: BackendKind::Directory,
            path: None,
        };
        assert!(store_from_config(&config).is_err());
        assert!(store_from_config(&StoreConfig::default()).is_ok());
    }
}
