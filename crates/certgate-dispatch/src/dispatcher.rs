//! Command dispatch.
//!
//! The [`Dispatcher`] owns the authentication manager and the collaborators.
//! Commands run one at a time through `&mut self`, gated commands pass
//! through `require_authenticated` first, and every failure message is
//! sanitized before it is returned.

use crate::command::{Command, CommandResponse, SecretInput};
use crate::gateway::{
    attach_listener_certificate, remove_ssl_certificate, ssl_certificate_resource_id,
    ssl_certificates, subscription_from_document, upsert_ssl_certificate, GatewayClient,
    GatewayDetails, GatewaySummary, SslAction,
};
use crate::store::{ImportedCertificate, SecretStore};
use base64::prelude::*;
use certgate_auth::{AuthManager, AuthStatus};
use certgate_cert::{
    assemble_bundle, assemble_discovered, assemble_explicit, assemble_from_sources,
    chain_subjects, classify_format, encode_pkcs12, parse_certificates, AssembledChain,
    CertFormat, CertificateChain, ChainSource, DiscoveryRequest,
};
use certgate_core::error::IoError;
use certgate_core::sanitize::Sanitizer;
use certgate_core::{CertgateError, CertificateError, GatewayError, Result};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const GATEWAY_HINT: &str =
    "Hint: register it on an application gateway with the add_gateway_ssl_certificate command.";
const PASSPHRASE_HINT: &str =
    "Hint: the key or container is encrypted; supply its passphrase in the `password` field.";

/// Routes commands to the auth manager, the secret store and the gateway
/// client.
pub struct Dispatcher {
    auth: AuthManager,
    store: Arc<dyn SecretStore>,
    gateways: Arc<dyn GatewayClient>,
    sanitizer: Sanitizer,
    subscription_id: Option<String>,
}

impl Dispatcher {
    pub fn new(
        auth: AuthManager,
        store: Arc<dyn SecretStore>,
        gateways: Arc<dyn GatewayClient>,
        sanitizer: Sanitizer,
    ) -> Self {
        Self {
            auth,
            store,
            gateways,
            sanitizer,
            subscription_id: None,
        }
    }

    /// Subscription used for listener references when a gateway document
    /// does not carry its own resource id.
    pub fn with_subscription_id(mut self, subscription_id: Option<String>) -> Self {
        self.subscription_id = subscription_id;
        self
    }

    pub fn auth(&self) -> &AuthManager {
        &self.auth
    }

    /// Parses one JSON command and runs it.
    pub async fn handle_json(&mut self, line: &str) -> CommandResponse {
        match serde_json::from_str::<Command>(line) {
            Ok(command) => self.handle(command).await,
            Err(e) => {
                let message = self.sanitizer.sanitize(&format!("Invalid command: {}", e));
                warn!(error = %message, "Rejected command");
                CommandResponse::failure(message)
            }
        }
    }

    /// Runs one command to completion.
    pub async fn handle(&mut self, command: Command) -> CommandResponse {
        let name = command.name();
        info!(command = name, "Handling command");

        if command.requires_auth() {
            if let Err(e) = self.auth.require_authenticated().await {
                return self.failure(name, &CertgateError::from(e));
            }
        }

        match self.execute(command).await {
            Ok(response) => {
                debug!(command = name, success = response.success, "Command finished");
                response
            }
            Err(e) => self.failure(name, &e),
        }
    }

    fn failure(&self, command: &str, error: &CertgateError) -> CommandResponse {
        // auth diagnostics already name the remediation step
        let mut message = match error {
            CertgateError::Auth(e) => self.sanitizer.sanitize(e.message()),
            other => self.sanitizer.sanitize(&other.to_string()),
        };
        if let CertgateError::Certificate(e) = error {
            if e.is_passphrase_related() {
                message.push_str("\n\n");
                message.push_str(PASSPHRASE_HINT);
            }
        }
        if error.is_input_error() {
            warn!(command, error = %message, "Command rejected its input");
        } else {
            error!(command, error = %message, "Command failed");
        }
        CommandResponse::failure(message)
    }

    /// Status of the session as a response. The status message can carry
    /// raw provider output, so it is sanitized like any failure.
    fn auth_response(&self, status: AuthStatus) -> CommandResponse {
        let status = AuthStatus {
            message: self.sanitizer.sanitize(&status.message),
            ..status
        };
        let response = if status.authenticated {
            CommandResponse::ok(status.message.clone())
        } else {
            CommandResponse::failure(status.message.clone())
        };
        response.with_data(json!(status))
    }

    async fn execute(&mut self, command: Command) -> Result<CommandResponse> {
        match command {
            Command::CheckAuth => {
                // a fresh session is validated once by check_auth itself
                if self.auth.session().is_initialized() {
                    self.auth.refresh(true).await;
                }
                let status = self.auth.check_auth().await;
                Ok(self.auth_response(status))
            }
            Command::RefreshAuth { force } => {
                self.auth.refresh(force).await;
                let status = self.auth.session().status();
                Ok(self.auth_response(status))
            }

            Command::SetSecret { name, value } => {
                let props = self.store.set_secret(&name, &value).await?;
                Ok(CommandResponse::ok(format!(
                    "Secret '{}' stored (version {})",
                    props.name, props.version
                ))
                .with_data(json!(props)))
            }
            Command::SetSecrets { secrets } => self.set_secrets(secrets).await,
            Command::GetSecret { name } => {
                let secret = self.store.get_secret(&name).await?;
                Ok(CommandResponse::ok(format!(
                    "Secret '{}' (version {}, updated {})",
                    secret.properties.name, secret.properties.version, secret.properties.updated
                ))
                .with_data(json!(secret)))
            }
            Command::ListSecrets => {
                let secrets = self.store.list_secrets().await?;
                Ok(CommandResponse::ok(format!("{} secret(s)", secrets.len())).with_data(json!(secrets)))
            }
            Command::DeleteSecret { name } => {
                let deleted = self.store.delete_secret(&name).await?;
                Ok(CommandResponse::ok(format!("Secret '{}' deleted", deleted.name)).with_data(json!(deleted)))
            }

            Command::DetectCertificateFormat {
                cert_base64,
                filename,
            } => {
                let bytes = decode_base64("cert_base64", &cert_base64)?;
                Ok(detect_response(&bytes, filename.as_deref()))
            }
            Command::ImportPfx {
                name,
                pfx_base64,
                password,
            } => {
                let bytes = decode_base64("pfx_base64", &pfx_base64)?;
                self.import_container(&name, &bytes, password.as_deref()).await
            }
            Command::ImportPfxFile {
                name,
                pfx_path,
                password,
            } => {
                let bytes = read_file(&pfx_path).await?;
                self.import_container(&name, &bytes, password.as_deref()).await
            }
            Command::ImportPem {
                name,
                cert_path,
                key_path,
                cert_pem_base64,
                key_pem_base64,
                password,
                key_password,
            } => {
                let (cert, key) = match (cert_path, key_path, cert_pem_base64, key_pem_base64) {
                    (Some(cert), Some(key), _, _) => (read_file(&cert).await?, read_file(&key).await?),
                    (_, _, Some(cert), Some(key)) => (
                        decode_base64("cert_pem_base64", &cert)?,
                        decode_base64("key_pem_base64", &key)?,
                    ),
                    _ => {
                        return Ok(CommandResponse::failure(
                            "Provide cert_path and key_path, or cert_pem_base64 and key_pem_base64",
                        ))
                    }
                };
                let key_passphrase = key_password.as_deref().or(password.as_deref());
                let assembled = assemble_explicit(&cert, &key, &[], key_passphrase)?;
                self.import_assembled(&name, assembled, password.as_deref(), None).await
            }
            Command::ImportCrt {
                name,
                cert_crt_base64,
                key_base64,
                password,
                key_password,
            } => {
                let cert = decode_base64("cert_crt_base64", &cert_crt_base64)?;
                let key = decode_base64("key_base64", &key_base64)?;
                let key_passphrase = key_password.as_deref().or(password.as_deref());
                let assembled = assemble_explicit(&cert, &key, &[], key_passphrase)?;
                self.import_assembled(&name, assembled, password.as_deref(), None).await
            }
            Command::ImportBundle {
                name,
                bundle_pem_base64,
                password,
                key_password,
            } => {
                let bundle = decode_base64("bundle_pem_base64", &bundle_pem_base64)?;
                let key_passphrase = key_password.as_deref().or(password.as_deref());
                let assembled = assemble_bundle(&bundle, key_passphrase)?;
                self.import_assembled(&name, assembled, password.as_deref(), None).await
            }
            Command::ImportWithChain {
                name,
                cert_base64,
                key_base64,
                chain_base64_list,
                password,
                key_password,
            } => {
                let cert = decode_base64("cert_base64", &cert_base64)?;
                let key = decode_base64("key_base64", &key_base64)?;
                let chain = chain_base64_list
                    .iter()
                    .map(|c| decode_base64("chain_base64_list", c))
                    .collect::<Result<Vec<_>>>()?;
                let key_passphrase = key_password.as_deref().or(password.as_deref());
                let assembled = assemble_explicit(&cert, &key, &chain, key_passphrase)?;
                self.import_assembled(&name, assembled, password.as_deref(), None).await
            }
            Command::ImportFromFiles {
                name,
                cert_path,
                key_path,
                chain_paths,
                password,
                key_password,
            } => {
                let cert = read_file(&cert_path).await?;
                if is_container(&cert, &cert_path) {
                    return self.import_container(&name, &cert, password.as_deref()).await;
                }
                let key_path = key_path.ok_or_else(|| {
                    CertificateError::malformed_key("key_path is required unless cert_path is a .pfx or .p12 file")
                })?;
                let key = read_file(&key_path).await?;
                let mut chain = Vec::with_capacity(chain_paths.len());
                for path in &chain_paths {
                    chain.push(read_file(path).await?);
                }
                let key_passphrase = key_password.as_deref().or(password.as_deref());
                let assembled = assemble_explicit(&cert, &key, &chain, key_passphrase)?;
                self.import_assembled(&name, assembled, password.as_deref(), None).await
            }
            Command::ImportWithAutoChain {
                name,
                cert_path,
                key_path,
                chain_directory,
                chain_patterns,
                password,
                key_password,
            } => {
                if has_container_extension(&cert_path) {
                    let cert = read_file(&cert_path).await?;
                    return self.import_container(&name, &cert, password.as_deref()).await;
                }
                let request = DiscoveryRequest {
                    leaf_path: cert_path,
                    key_path,
                    search_dir: chain_directory,
                    patterns: chain_patterns,
                };
                let key_passphrase = key_password.as_deref().or(password.as_deref());
                let discovered = assemble_discovered(&request, key_passphrase)?;
                let files: Vec<String> = discovered
                    .chain_files
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect();
                self.import_assembled(&name, discovered.assembled, password.as_deref(), Some(files))
                    .await
            }
            Command::ImportFromSources {
                name,
                cert,
                key,
                chain,
                password,
                key_password,
            } => {
                let key_passphrase = key_password.as_deref().or(password.as_deref());
                let assembled = match key {
                    Some(key) => assemble_from_sources(&cert, &key, &chain, key_passphrase)?,
                    None => {
                        let bytes = cert.load()?;
                        let is_pfx = match &cert {
                            ChainSource::Path(path) => is_container(&bytes, path),
                            ChainSource::Inline(_) => classify_format(&bytes, None) == CertFormat::Pkcs12,
                        };
                        if is_pfx {
                            return self.import_container(&name, &bytes, password.as_deref()).await;
                        }
                        with_extra_chain(assemble_bundle(&bytes, key_passphrase)?, &chain)?
                    }
                };
                self.import_assembled(&name, assembled, password.as_deref(), None).await
            }
            Command::GetCertificate { name } => {
                let cert = self.store.get_certificate(&name).await?;
                let expires = cert
                    .expires
                    .map(|e| e.to_rfc3339())
                    .unwrap_or_else(|| "unknown".to_string());
                Ok(CommandResponse::ok(format!(
                    "Certificate '{}'\nEnabled: {}\nExpires: {}\nThumbprint: {}",
                    cert.name, cert.enabled, expires, cert.thumbprint
                ))
                .with_data(json!(cert)))
            }
            Command::ListCertificates => {
                let certs = self.store.list_certificates().await?;
                Ok(CommandResponse::ok(format!("{} certificate(s)", certs.len())).with_data(json!(certs)))
            }
            Command::DeleteCertificate { name } => {
                let deleted = self.store.delete_certificate(&name).await?;
                Ok(CommandResponse::ok(format!("Certificate '{}' deleted", deleted.name))
                    .with_data(json!(deleted)))
            }

            Command::ListGateways { resource_group } => {
                let documents = self.gateways.list_gateways(resource_group.as_deref()).await?;
                let summaries: Vec<GatewaySummary> =
                    documents.iter().map(GatewaySummary::from_document).collect();
                Ok(CommandResponse::ok(format!("{} application gateway(s)", summaries.len()))
                    .with_data(json!(summaries)))
            }
            Command::GetGateway {
                resource_group,
                gateway,
            } => {
                let document = self.gateways.get_gateway(&resource_group, &gateway).await?;
                let details = GatewayDetails::from_document(&document);
                Ok(CommandResponse::ok(format!(
                    "Application gateway '{}': {} SSL certificate(s), {} listener(s)",
                    gateway,
                    details.ssl_certificates.len(),
                    details.http_listeners.len()
                ))
                .with_data(json!(details)))
            }
            Command::AddGatewaySslCertificate {
                resource_group,
                gateway,
                cert_name,
                keyvault_cert_name,
            } => {
                self.add_gateway_ssl_certificate(&resource_group, &gateway, &cert_name, &keyvault_cert_name)
                    .await
            }
            Command::ListGatewaySslCertificates {
                resource_group,
                gateway,
            } => {
                let document = self.gateways.get_gateway(&resource_group, &gateway).await?;
                let certs = ssl_certificates(&document);
                Ok(CommandResponse::ok(format!(
                    "{} SSL certificate(s) on '{}'",
                    certs.len(),
                    gateway
                ))
                .with_data(json!(certs)))
            }
            Command::RemoveGatewaySslCertificate {
                resource_group,
                gateway,
                cert_name,
            } => {
                let mut document = self.gateways.get_gateway(&resource_group, &gateway).await?;
                remove_ssl_certificate(&mut document, &gateway, &cert_name)?;
                self.gateways
                    .update_gateway(&resource_group, &gateway, document)
                    .await?;
                Ok(CommandResponse::ok(format!(
                    "SSL certificate '{}' removed from '{}'",
                    cert_name, gateway
                )))
            }
            Command::AttachListenerCertificate {
                resource_group,
                gateway,
                listener,
                cert_name,
            } => {
                let mut document = self.gateways.get_gateway(&resource_group, &gateway).await?;
                let subscription = subscription_from_document(&document)
                    .or_else(|| self.subscription_id.clone())
                    .ok_or_else(|| {
                        GatewayError::invalid_document(
                            "gateway has no resource id and no subscription id is configured",
                        )
                    })?;
                let certificate_id =
                    ssl_certificate_resource_id(&subscription, &resource_group, &gateway, &cert_name);
                attach_listener_certificate(&mut document, &gateway, &listener, &certificate_id)?;
                self.gateways
                    .update_gateway(&resource_group, &gateway, document)
                    .await?;
                Ok(CommandResponse::ok(format!(
                    "Listener '{}' now uses SSL certificate '{}'",
                    listener, cert_name
                ))
                .with_data(json!({ "listener": listener, "ssl_certificate_id": certificate_id })))
            }
        }
    }

    async fn set_secrets(&self, secrets: Vec<SecretInput>) -> Result<CommandResponse> {
        if secrets.is_empty() {
            return Ok(CommandResponse::failure(
                "No secrets given; `secrets` needs at least one entry",
            ));
        }

        let mut results = Vec::with_capacity(secrets.len());
        let mut failed = 0usize;
        for SecretInput { name, value } in &secrets {
            match self.store.set_secret(name, value).await {
                Ok(props) => results.push(json!({
                    "name": name,
                    "success": true,
                    "version": props.version,
                })),
                Err(e) => {
                    failed += 1;
                    results.push(json!({
                        "name": name,
                        "success": false,
                        "error": self.sanitizer.sanitize(&e.to_string()),
                    }));
                }
            }
        }

        let total = secrets.len();
        let succeeded = total - failed;
        let data = json!({
            "total": total,
            "succeeded": succeeded,
            "failed": failed,
            "results": results,
        });
        let message = format!("{} of {} secret(s) stored", succeeded, total);
        let response = if failed == 0 {
            CommandResponse::ok(message)
        } else {
            CommandResponse::failure(format!("{}; {} failed", message, failed))
        };
        Ok(response.with_data(data))
    }

    async fn add_gateway_ssl_certificate(
        &self,
        resource_group: &str,
        gateway: &str,
        cert_name: &str,
        keyvault_cert_name: &str,
    ) -> Result<CommandResponse> {
        // the gateway may only reference certificates the store actually holds
        self.store.get_certificate(keyvault_cert_name).await?;
        let secret_id = format!(
            "{}/secrets/{}",
            self.store.vault_url().trim_end_matches('/'),
            keyvault_cert_name
        );

        let mut document = self.gateways.get_gateway(resource_group, gateway).await?;
        let action = upsert_ssl_certificate(&mut document, cert_name, &secret_id)?;
        self.gateways
            .update_gateway(resource_group, gateway, document)
            .await?;

        info!(gateway, cert_name, ?action, "Gateway SSL certificate saved");
        Ok(CommandResponse::ok(format!(
            "SSL certificate '{}' {} on '{}' from store certificate '{}'",
            cert_name,
            match action {
                SslAction::Added => "added",
                SslAction::Updated => "updated",
            },
            gateway,
            keyvault_cert_name
        ))
        .with_data(json!({
            "action": action,
            "name": cert_name,
            "key_vault_secret_id": secret_id,
        })))
    }

    async fn import_container(
        &self,
        name: &str,
        bytes: &[u8],
        password: Option<&str>,
    ) -> Result<CommandResponse> {
        let imported = self.store.import_certificate(name, bytes, password).await?;
        Ok(imported_response(&imported, None, None))
    }

    async fn import_assembled(
        &self,
        name: &str,
        assembled: AssembledChain,
        password: Option<&str>,
        chain_files: Option<Vec<String>>,
    ) -> Result<CommandResponse> {
        let AssembledChain { chain, key } = assembled;
        let container = encode_pkcs12(chain.leaf(), Some(&key), chain.intermediates(), password)?;
        let imported = self
            .store
            .import_certificate(name, container.as_bytes(), password)
            .await?;
        Ok(imported_response(&imported, Some(chain_subjects(&chain)), chain_files))
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("auth", &self.auth)
            .field("vault_url", &self.store.vault_url())
            .field("sanitizer", &self.sanitizer)
            .field("subscription_id", &self.subscription_id)
            .finish()
    }
}

fn imported_response(
    imported: &ImportedCertificate,
    chain: Option<Vec<String>>,
    chain_files: Option<Vec<String>>,
) -> CommandResponse {
    let mut message = format!(
        "Certificate '{}' imported\nThumbprint: {}",
        imported.name, imported.thumbprint
    );
    if let Some(chain) = &chain {
        message.push_str(&format!("\nChain: {} certificate(s)", chain.len()));
    }
    if imported.is_new {
        message.push_str("\n\n");
        message.push_str(GATEWAY_HINT);
    }

    let mut data = json!({ "certificate": imported });
    if let Some(chain) = chain {
        data["chain"] = json!(chain);
    }
    if let Some(files) = chain_files {
        data["chain_files"] = json!(files);
    }
    CommandResponse::ok(message).with_data(data)
}

fn detect_response(bytes: &[u8], filename: Option<&str>) -> CommandResponse {
    let format = classify_format(bytes, filename);
    let message = match format {
        CertFormat::Pem => "Format: PEM (text). Use import_pem or import_bundle.".to_string(),
        CertFormat::Der => {
            "Format: DER (binary, usually .crt or .cer). Use import_crt.".to_string()
        }
        CertFormat::Pkcs12 => "Format: PKCS12 (.pfx or .p12). Use import_pfx.".to_string(),
        CertFormat::Unknown => {
            let head: String = bytes.iter().take(20).map(|b| format!("{:02x}", b)).collect();
            format!("Unknown format. First bytes: {}", head)
        }
    };
    CommandResponse::ok(message).with_data(json!({ "format": format }))
}

fn decode_base64(field: &str, value: &str) -> Result<Vec<u8>> {
    let compact: String = value.split_whitespace().collect();
    BASE64_STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| CertificateError::unsupported(format!("{} is not valid base64: {}", field, e)).into())
}

async fn read_file(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path).await.map_err(|e| {
        let mut err = IoError::from(e);
        err.message = format!("{}: {}", path.display(), err.message);
        CertgateError::Io(err)
    })
}

fn has_container_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("pfx") || ext.eq_ignore_ascii_case("p12"))
        .unwrap_or(false)
}

fn is_container(bytes: &[u8], path: &Path) -> bool {
    let filename = path.file_name().and_then(|n| n.to_str());
    classify_format(bytes, filename) == CertFormat::Pkcs12
}

/// Appends certificates from `extra` after the chain a bundle already had.
fn with_extra_chain(assembled: AssembledChain, extra: &[ChainSource]) -> Result<AssembledChain> {
    if extra.is_empty() {
        return Ok(assembled);
    }
    let AssembledChain { chain, key } = assembled;
    let mut intermediates = chain.intermediates().to_vec();
    for source in extra {
        intermediates.extend(parse_certificates(&source.load()?)?);
    }
    Ok(AssembledChain {
        chain: CertificateChain::new(chain.leaf().clone(), intermediates),
        key,
    })
}
