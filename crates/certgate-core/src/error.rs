//! Error types for certgate.
//!
//! Every library crate in the workspace reports failures through these enums.
//! All of them are serializable so the dispatcher can hand them back inside a
//! command response after sanitizing.

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Result type alias using CertgateError as the error type.
pub type Result<T> = std::result::Result<T, CertgateError>;

/// Top-level error type for all certgate operations.
#[derive(Debug, Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "details")]
pub enum CertgateError {
    /// Certificate and key normalization errors
    #[error("Certificate error: {0}")]
    Certificate(#[from] CertificateError),

    /// Authentication gate errors
    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Secret store errors
    #[error("Secret store error: {0}")]
    Store(#[from] StoreError),

    /// Application gateway errors
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    /// Internal errors that shouldn't normally occur
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CertgateError {
    /// Returns true when the failure is caused by the caller's input rather
    /// than by the environment.
    pub fn is_input_error(&self) -> bool {
        matches!(self, CertgateError::Certificate(_))
    }
}

/// Errors raised while classifying, parsing, assembling or encoding
/// certificate material.
#[derive(Debug, Error, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum CertificateError {
    /// No parse attempt produced a certificate
    #[error("Malformed certificate: {reason}")]
    MalformedCertificate { reason: String },

    /// No parse attempt produced a private key
    #[error("Malformed private key: {reason}")]
    MalformedKey { reason: String },

    /// The key is encrypted and no passphrase was supplied
    #[error("Private key is encrypted; a passphrase is required")]
    PassphraseRequired,

    /// A passphrase was supplied but decryption or parsing still failed
    #[error("Passphrase is incorrect or the private key is malformed")]
    PassphraseIncorrectOrMalformedKey,

    /// A bundle carried no private key block
    #[error("No private key found in bundle")]
    NoPrivateKeyFound,

    /// A chain file or search directory does not exist
    #[error("Chain file not found: {path}")]
    ChainFileNotFound { path: String },

    /// The input is recognizable but cannot be processed
    #[error("Unsupported format: {reason}")]
    UnsupportedFormat { reason: String },

    /// The encoder was asked to build a container without a key
    #[error("No key material supplied")]
    NoKeyMaterial,

    /// Building the output container failed
    #[error("Encoding failed: {reason}")]
    EncodingFailed { reason: String },
}

impl CertificateError {
    /// Creates a malformed certificate error.
    pub fn malformed_certificate(reason: impl Into<String>) -> Self {
        Self::MalformedCertificate {
            reason: reason.into(),
        }
    }

    /// Creates a malformed key error.
    pub fn malformed_key(reason: impl Into<String>) -> Self {
        Self::MalformedKey {
            reason: reason.into(),
        }
    }

    /// Creates a chain file not found error.
    pub fn chain_file_not_found(path: impl Into<String>) -> Self {
        Self::ChainFileNotFound { path: path.into() }
    }

    /// Creates an unsupported format error.
    pub fn unsupported(reason: impl Into<String>) -> Self {
        Self::UnsupportedFormat {
            reason: reason.into(),
        }
    }

    pub fn encoding(reason: impl Into<String>) -> Self {
        Self::EncodingFailed {
            reason: reason.into(),
        }
    }

    /// Returns true if supplying (another) passphrase could change the outcome.
    pub fn is_passphrase_related(&self) -> bool {
        matches!(
            self,
            CertificateError::PassphraseRequired
                | CertificateError::PassphraseIncorrectOrMalformedKey
        )
    }
}

/// Errors produced by the authentication gate.
///
/// Each variant carries a human-readable diagnostic that already includes the
/// remediation step for the operator.
#[derive(Debug, Error, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The credential tooling is not installed or not reachable
    #[error("Authentication unavailable: {message}")]
    AuthUnavailable { message: String },

    /// The tooling is present but no account is logged in
    #[error("Authentication required: {message}")]
    AuthRequired { message: String },

    /// Token acquisition failed for some other reason
    #[error("Authentication failed: {message}")]
    AuthTransientFailure { message: String },
}

impl AuthError {
    /// Returns the diagnostic message without the variant prefix.
    pub fn message(&self) -> &str {
        match self {
            AuthError::AuthUnavailable { message }
            | AuthError::AuthRequired { message }
            | AuthError::AuthTransientFailure { message } => message,
        }
    }

    /// Returns true if retrying later, without operator action, may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, AuthError::AuthTransientFailure { .. })
    }
}

/// Errors related to configuration.
#[derive(Debug, Error, Serialize, Deserialize)]
pub enum ConfigError {
    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// Failed to load configuration
    #[error("Failed to load configuration from {path}: {reason}")]
    LoadFailed { path: String, reason: String },

    /// Invalid configuration format
    #[error("Invalid configuration format: {reason}")]
    InvalidFormat { reason: String },

    /// Invalid configuration value
    #[error("Invalid configuration value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    /// Configuration validation failed
    #[error("Configuration validation failed: {reason}")]
    ValidationFailed { reason: String },
}

impl ConfigError {
    /// Creates a file not found error.
    pub fn file_not_found(path: impl Into<String>) -> Self {
        Self::FileNotFound { path: path.into() }
    }

    /// Creates an invalid value error.
    pub fn invalid_value(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Creates a validation failed error.
    pub fn validation_failed(reason: impl Into<String>) -> Self {
        Self::ValidationFailed {
            reason: reason.into(),
        }
    }
}

/// Errors reported by a secret store backend.
#[derive(Debug, Error, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Secret not found
    #[error("Secret not found: {name}")]
    SecretNotFound { name: String },

    /// Certificate not found
    #[error("Certificate not found: {name}")]
    CertificateNotFound { name: String },

    /// The name cannot be used by the store
    #[error("Invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    /// The backend rejected the request
    #[error("Store backend failure: {reason}")]
    Backend { reason: String },
}

impl StoreError {
    /// Creates a backend failure error.
    pub fn backend(reason: impl Into<String>) -> Self {
        Self::Backend {
            reason: reason.into(),
        }
    }
}

/// Errors reported while reading or updating an application gateway.
#[derive(Debug, Error, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Gateway not found
    #[error("Application gateway not found: {resource_group}/{name}")]
    GatewayNotFound {
        resource_group: String,
        name: String,
    },

    /// SSL certificate entry not found on the gateway
    #[error("SSL certificate '{certificate}' not found on gateway '{gateway}'")]
    SslCertificateNotFound { gateway: String, certificate: String },

    /// HTTP listener not found on the gateway
    #[error("Listener '{listener}' not found on gateway '{gateway}'")]
    ListenerNotFound { gateway: String, listener: String },

    /// The gateway document does not have the expected shape
    #[error("Invalid gateway document: {reason}")]
    InvalidDocument { reason: String },

    /// The backend rejected the request
    #[error("Gateway backend failure: {reason}")]
    Backend { reason: String },
}

impl GatewayError {
    /// Creates an invalid document error.
    pub fn invalid_document(reason: impl Into<String>) -> Self {
        Self::InvalidDocument {
            reason: reason.into(),
        }
    }

    /// Creates a backend failure error.
    pub fn backend(reason: impl Into<String>) -> Self {
        Self::Backend {
            reason: reason.into(),
        }
    }
}

/// Wrapper for I/O errors to make them serializable.
#[derive(Debug, Error, Serialize, Deserialize)]
#[error("I/O error: {kind:?}: {message}")]
pub struct IoError {
    pub kind: IoErrorKind,
    pub message: String,
}

impl From<io::Error> for IoError {
    fn from(err: io::Error) -> Self {
        Self {
            kind: err.kind().into(),
            message: err.to_string(),
        }
    }
}

impl From<io::Error> for CertgateError {
    fn from(err: io::Error) -> Self {
        CertgateError::Io(err.into())
    }
}

/// Serializable subset of std::io::ErrorKind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoErrorKind {
    NotFound,
    PermissionDenied,
    AlreadyExists,
    InvalidInput,
    InvalidData,
    TimedOut,
    UnexpectedEof,
    Other,
}

impl From<io::ErrorKind> for IoErrorKind {
    fn from(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::NotFound => IoErrorKind::NotFound,
            io::ErrorKind::PermissionDenied => IoErrorKind::PermissionDenied,
            io::ErrorKind::AlreadyExists => IoErrorKind::AlreadyExists,
            io::ErrorKind::InvalidInput => IoErrorKind::InvalidInput,
            io::ErrorKind::InvalidData => IoErrorKind::InvalidData,
            io::ErrorKind::TimedOut => IoErrorKind::TimedOut,
            io::ErrorKind::UnexpectedEof => IoErrorKind::UnexpectedEof,
            _ => IoErrorKind::Other,
        }
    }
}

/// Extension trait for converting Results to CertgateError.
pub trait ResultExt<T> {
    /// Converts the error to an internal error with context.
    fn internal_context(self, context: &str) -> Result<T>;
}

impl<T, E: std::error::Error> ResultExt<T> for std::result::Result<T, E> {
    fn internal_context(self, context: &str) -> Result<T> {
        self.map_err(|e| CertgateError::Internal(format!("{}: {}", context, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_serialization() {
        let err = CertgateError::Certificate(CertificateError::chain_file_not_found(
            "/srv/certs/chain.pem",
        ));
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("Certificate"));
        assert!(json.contains("chain.pem"));
    }

    #[test]
    fn test_certificate_error_helpers() {
        let err = CertificateError::malformed_key("no attempt succeeded");
        assert!(matches!(err, CertificateError::MalformedKey { .. }));

        let err = CertificateError::unsupported("legacy PEM encryption");
        assert!(matches!(err, CertificateError::UnsupportedFormat { .. }));
    }

    #[test]
    fn test_passphrase_related() {
        assert!(CertificateError::PassphraseRequired.is_passphrase_related());
        assert!(CertificateError::PassphraseIncorrectOrMalformedKey.is_passphrase_related());
        assert!(!CertificateError::NoPrivateKeyFound.is_passphrase_related());
    }

    #[test]
    fn test_auth_error_message() {
        let err = AuthError::AuthRequired {
            message: "run `az login`".to_string(),
        };
        assert_eq!(err.message(), "run `az login`");
        assert!(!err.is_transient());
        assert!(format!("{}", err).starts_with("Authentication required"));

        let err = AuthError::AuthTransientFailure {
            message: "network".to_string(),
        };
        assert!(err.is_transient());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: CertgateError = io_err.into();
        assert!(matches!(
            err,
            CertgateError::Io(IoError {
                kind: IoErrorKind::NotFound,
                ..
            })
        ));
    }

    #[test]
    fn test_input_error_classification() {
        let err: CertgateError = CertificateError::NoKeyMaterial.into();
        assert!(err.is_input_error());

        let err: CertgateError = StoreError::backend("boom").into();
        assert!(!err.is_input_error());
    }

    #[test]
    fn test_internal_context() {
        let res: std::result::Result<(), io::Error> =
            Err(io::Error::new(io::ErrorKind::Other, "disk"));
        let err = res.internal_context("writing container").unwrap_err();
        assert_eq!(
            format!("{}", err),
            "Internal error: writing container: disk"
        );
    }
}
