//! Wire format of the dispatcher: one JSON object per command, one per
//! response.

use certgate_cert::ChainSource;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;

/// A name/value pair of `set_secrets`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretInput {
    pub name: String,
    pub value: String,
}

impl fmt::Debug for SecretInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretInput")
            .field("name", &self.name)
            .field("value", &"[REDACTED]")
            .finish()
    }
}

/// A request to the dispatcher.
///
/// Binary payloads travel as base64. `password` both decrypts the private
/// key and protects the container handed to the store; `key_password`, when
/// given, decrypts the key instead.
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    CheckAuth,
    RefreshAuth {
        #[serde(default)]
        force: bool,
    },

    SetSecret {
        name: String,
        value: String,
    },
    SetSecrets {
        secrets: Vec<SecretInput>,
    },
    GetSecret {
        name: String,
    },
    ListSecrets,
    DeleteSecret {
        name: String,
    },

    DetectCertificateFormat {
        cert_base64: String,
        #[serde(default)]
        filename: Option<String>,
    },
    ImportPfx {
        name: String,
        pfx_base64: String,
        #[serde(default)]
        password: Option<String>,
    },
    ImportPfxFile {
        name: String,
        pfx_path: PathBuf,
        #[serde(default)]
        password: Option<String>,
    },
    /// PEM leaf and key, from paths (preferred) or base64
    ImportPem {
        name: String,
        #[serde(default)]
        cert_path: Option<PathBuf>,
        #[serde(default)]
        key_path: Option<PathBuf>,
        #[serde(default)]
        cert_pem_base64: Option<String>,
        #[serde(default)]
        key_pem_base64: Option<String>,
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        key_password: Option<String>,
    },
    /// DER or PEM leaf with a key
    ImportCrt {
        name: String,
        cert_crt_base64: String,
        key_base64: String,
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        key_password: Option<String>,
    },
    ImportBundle {
        name: String,
        bundle_pem_base64: String,
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        key_password: Option<String>,
    },
    ImportWithChain {
        name: String,
        cert_base64: String,
        key_base64: String,
        #[serde(default)]
        chain_base64_list: Vec<String>,
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        key_password: Option<String>,
    },
    ImportFromFiles {
        name: String,
        cert_path: PathBuf,
        #[serde(default)]
        key_path: Option<PathBuf>,
        #[serde(default)]
        chain_paths: Vec<PathBuf>,
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        key_password: Option<String>,
    },
    ImportWithAutoChain {
        name: String,
        cert_path: PathBuf,
        key_path: PathBuf,
        #[serde(default)]
        chain_directory: Option<PathBuf>,
        #[serde(default)]
        chain_patterns: Vec<String>,
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        key_password: Option<String>,
    },
    /// Every input may be a path or inline content
    ImportFromSources {
        name: String,
        cert: ChainSource,
        #[serde(default)]
        key: Option<ChainSource>,
        #[serde(default)]
        chain: Vec<ChainSource>,
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        key_password: Option<String>,
    },
    GetCertificate {
        name: String,
    },
    ListCertificates,
    DeleteCertificate {
        name: String,
    },

    ListGateways {
        #[serde(default, alias = "resource_group_name")]
        resource_group: Option<String>,
    },
    GetGateway {
        #[serde(alias = "resource_group_name")]
        resource_group: String,
        #[serde(alias = "appgw_name")]
        gateway: String,
    },
    AddGatewaySslCertificate {
        #[serde(alias = "resource_group_name")]
        resource_group: String,
        #[serde(alias = "appgw_name")]
        gateway: String,
        cert_name: String,
        keyvault_cert_name: String,
    },
    ListGatewaySslCertificates {
        #[serde(alias = "resource_group_name")]
        resource_group: String,
        #[serde(alias = "appgw_name")]
        gateway: String,
    },
    RemoveGatewaySslCertificate {
        #[serde(alias = "resource_group_name")]
        resource_group: String,
        #[serde(alias = "appgw_name")]
        gateway: String,
        cert_name: String,
    },
    AttachListenerCertificate {
        #[serde(alias = "resource_group_name")]
        resource_group: String,
        #[serde(alias = "appgw_name")]
        gateway: String,
        listener: String,
        cert_name: String,
    },
}

impl Command {
    /// The `command` tag of this request.
    pub fn name(&self) -> &'static str {
        match self {
            Command::CheckAuth => "check_auth",
            Command::RefreshAuth { .. } => "refresh_auth",
            Command::SetSecret { .. } => "set_secret",
            Command::SetSecrets { .. } => "set_secrets",
            Command::GetSecret { .. } => "get_secret",
            Command::ListSecrets => "list_secrets",
            Command::DeleteSecret { .. } => "delete_secret",
            Command::DetectCertificateFormat { .. } => "detect_certificate_format",
            Command::ImportPfx { .. } => "import_pfx",
            Command::ImportPfxFile { .. } => "import_pfx_file",
            Command::ImportPem { .. } => "import_pem",
            Command::ImportCrt { .. } => "import_crt",
            Command::ImportBundle { .. } => "import_bundle",
            Command::ImportWithChain { .. } => "import_with_chain",
            Command::ImportFromFiles { .. } => "import_from_files",
            Command::ImportWithAutoChain { .. } => "import_with_auto_chain",
            Command::ImportFromSources { .. } => "import_from_sources",
            Command::GetCertificate { .. } => "get_certificate",
            Command::ListCertificates => "list_certificates",
            Command::DeleteCertificate { .. } => "delete_certificate",
            Command::ListGateways { .. } => "list_gateways",
            Command::GetGateway { .. } => "get_gateway",
            Command::AddGatewaySslCertificate { .. } => "add_gateway_ssl_certificate",
            Command::ListGatewaySslCertificates { .. } => "list_gateway_ssl_certificates",
            Command::RemoveGatewaySslCertificate { .. } => "remove_gateway_ssl_certificate",
            Command::AttachListenerCertificate { .. } => "attach_listener_certificate",
        }
    }

    /// False for the auth commands themselves and for pure format probing.
    pub fn requires_auth(&self) -> bool {
        !matches!(
            self,
            Command::CheckAuth | Command::RefreshAuth { .. } | Command::DetectCertificateFormat { .. }
        )
    }
}

// Commands carry secrets and key material; only the tag is printable.
impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("command", &self.name())
            .finish_non_exhaustive()
    }
}

/// Outcome of one command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl CommandResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}
