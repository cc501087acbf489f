//! Command dispatch for certgate
//!
//! Wires the normalization pipeline and the authentication gate to the two
//! collaborators this tool manages: a Key Vault-shaped [`SecretStore`] and
//! an application gateway [`GatewayClient`].
//!
//! ```no_run
//! use certgate_auth::{AuthManager, InitMode};
//! use certgate_core::{sanitize::Sanitizer, AppConfig};
//! use certgate_dispatch::{gateway_client_from_config, store_from_config, Dispatcher};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AppConfig::default();
//! let auth = AuthManager::from_config(&config.auth).start(InitMode::Lazy).await?;
//! let mut dispatcher = Dispatcher::new(
//!     auth,
//!     store_from_config(&config.store)?,
//!     gateway_client_from_config(&config.gateway)?,
//!     Sanitizer::new(config.sanitizer.max_length),
//! );
//! let response = dispatcher.handle_json(r#"{"command": "list_secrets"}"#).await;
//! println!("{}", response.message);
//! # Ok(())
//! # }
//! ```

pub mod command;
pub mod dispatcher;
pub mod gateway;
pub mod store;

pub use command::{Command, CommandResponse, SecretInput};
pub use dispatcher::Dispatcher;
pub use gateway::{
    gateway_client_from_config, DirectoryGatewayClient, GatewayClient, GatewayDetails,
    GatewaySummary, ListenerInfo, MemoryGatewayClient, SkuInfo, SslAction, SslCertificateInfo,
};
pub use store::{
    store_from_config, CertificateProperties, DeletedItem, DirectorySecretStore,
    ImportedCertificate, MemorySecretStore, Secret, SecretProperties, SecretStore,
    DEFAULT_VAULT_URL,
};
