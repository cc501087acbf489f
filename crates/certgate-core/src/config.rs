//! Configuration management for certgate.
//!
//! Configuration comes from a YAML file, optionally layered with
//! `CERTGATE__SECTION__FIELD` environment variables, and is validated before
//! the binary wires up any collaborator.

use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "CERTGATE";

/// Main application configuration.
///
/// # Examples
///
/// ```no_run
/// use certgate_core::config::AppConfig;
///
/// let config = AppConfig::from_file("certgate.yaml").unwrap();
/// config.validate().unwrap();
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Authentication gate settings
    #[serde(default)]
    pub auth: AuthConfig,

    /// Secret store backend
    #[serde(default)]
    pub store: StoreConfig,

    /// Application gateway backend
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Error message sanitizing
    #[serde(default)]
    pub sanitizer: SanitizerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Creates a new default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::file_not_found(path.display().to_string()).into());
        }
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::LoadFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        Self::from_yaml(&contents)
    }

    /// Loads configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| {
            ConfigError::InvalidFormat {
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Loads configuration with the `config` crate: the optional file first,
    /// then `CERTGATE__*` environment variables on top.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be loaded or the merged result
    /// does not deserialize.
    pub fn from_config_builder(path: Option<&Path>) -> Result<Self> {
        let origin = path
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<environment>".to_string());

        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigError::LoadFailed {
                path: origin,
                reason: e.to_string(),
            })?;

        config.try_deserialize().map_err(|e| {
            ConfigError::InvalidFormat {
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails.
    pub fn validate(&self) -> Result<()> {
        self.auth.validate()?;
        self.store.validate("store")?;
        self.gateway.backend.validate("gateway")?;

        if self.sanitizer.max_length == 0 {
            return Err(ConfigError::invalid_value(
                "sanitizer.max_length",
                "must be greater than zero",
            )
            .into());
        }

        self.logging.parse_level()?;
        Ok(())
    }
}

/// How the authentication gate initializes at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// Validate at startup and run the interactive login flow when needed
    EagerInteractive,
    /// Validate at startup without ever prompting
    EagerCheckOnly,
    /// Defer validation until the first command needs it
    #[default]
    Lazy,
}

impl fmt::Display for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuthMode::EagerInteractive => "eager_interactive",
            AuthMode::EagerCheckOnly => "eager_check_only",
            AuthMode::Lazy => "lazy",
        };
        f.write_str(s)
    }
}

impl FromStr for AuthMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "eager_interactive" | "interactive" => Ok(AuthMode::EagerInteractive),
            "eager_check_only" | "eager" | "check" => Ok(AuthMode::EagerCheckOnly),
            "lazy" => Ok(AuthMode::Lazy),
            other => Err(format!("unknown auth mode: {}", other)),
        }
    }
}

/// Authentication gate settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Initialization mode
    #[serde(default)]
    pub mode: AuthMode,

    /// Scope requested for the lightweight token check
    #[serde(default = "default_token_scope")]
    pub token_scope: String,

    /// Cloud CLI executable used by the probes and the credential provider
    #[serde(default = "default_cli_program")]
    pub cli_program: String,

    /// Timeout for the tool existence probe in seconds
    #[serde(default = "default_exists_timeout")]
    pub exists_timeout_secs: u64,

    /// Timeout for the version and account probes in seconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// Timeout for token acquisition in seconds
    #[serde(default = "default_probe_timeout")]
    pub token_timeout_secs: u64,

    /// Timeout for the interactive login in seconds
    #[serde(default = "default_login_timeout")]
    pub login_timeout_secs: u64,
}

fn default_token_scope() -> String {
    "https://management.azure.com/.default".to_string()
}

fn default_cli_program() -> String {
    "az".to_string()
}

fn default_exists_timeout() -> u64 {
    2
}

fn default_probe_timeout() -> u64 {
    5
}

fn default_login_timeout() -> u64 {
    120
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            mode: AuthMode::default(),
            token_scope: default_token_scope(),
            cli_program: default_cli_program(),
            exists_timeout_secs: default_exists_timeout(),
            probe_timeout_secs: default_probe_timeout(),
            token_timeout_secs: default_probe_timeout(),
            login_timeout_secs: default_login_timeout(),
        }
    }
}

impl AuthConfig {
    pub fn exists_timeout(&self) -> Duration {
        Duration::from_secs(self.exists_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn token_timeout(&self) -> Duration {
        Duration::from_secs(self.token_timeout_secs)
    }

    pub fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.login_timeout_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.token_scope.trim().is_empty() {
            return Err(ConfigError::invalid_value("auth.token_scope", "must not be empty").into());
        }
        if self.cli_program.trim().is_empty() {
            return Err(ConfigError::invalid_value("auth.cli_program", "must not be empty").into());
        }
        let timeouts = [
            ("auth.exists_timeout_secs", self.exists_timeout_secs),
            ("auth.probe_timeout_secs", self.probe_timeout_secs),
            ("auth.token_timeout_secs", self.token_timeout_secs),
            ("auth.login_timeout_secs", self.login_timeout_secs),
        ];
        for (field, value) in timeouts {
            if value == 0 {
                return Err(ConfigError::invalid_value(field, "must be greater than zero").into());
            }
        }
        Ok(())
    }
}

/// Where a collaborator keeps its state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Process-local, lost on exit
    #[default]
    Memory,
    /// Files under a directory
    Directory,
}

/// Secret store backend settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub kind: BackendKind,

    /// Root directory when `kind` is `directory`
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl StoreConfig {
    fn validate(&self, section: &str) -> Result<()> {
        if self.kind == BackendKind::Directory && self.path.is_none() {
            return Err(ConfigError::validation_failed(format!(
                "{}.path is required for the directory backend",
                section
            ))
            .into());
        }
        Ok(())
    }
}

/// Application gateway backend settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(flatten)]
    pub backend: StoreConfig,

    /// Subscription used to build resource ids
    #[serde(default)]
    pub subscription_id: Option<String>,
}

/// Error message sanitizing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SanitizerConfig {
    /// Maximum length of a message leaving the process, in characters
    #[serde(default = "default_max_length")]
    pub max_length: usize,
}

fn default_max_length() -> usize {
    crate::sanitize::DEFAULT_MAX_LENGTH
}

impl Default for SanitizerConfig {
    fn default() -> Self {
        Self {
            max_length: default_max_length(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "text" or "json"
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

impl LoggingConfig {
    /// Parses the log level string to a tracing Level.
    pub fn parse_level(&self) -> Result<Level> {
        self.level.parse().map_err(|_| {
            ConfigError::InvalidValue {
                field: "logging.level".to_string(),
                reason: format!("Invalid log level: {}", self.level),
            }
            .into()
        })
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text format
    #[default]
    Text,
    /// JSON format for structured logging
    Json,
}
