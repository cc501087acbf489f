//! Authentication session state.

use crate::credential::CredentialHandle;
use certgate_core::AuthError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where the session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthState {
    /// No validation has run yet
    Uninitialized,
    /// The last validation failed
    Unauthenticated,
    /// An interactive login is in progress
    LoggingIn,
    /// A credential handle is held
    Authenticated,
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthState::Uninitialized => write!(f, "Uninitialized"),
            AuthState::Unauthenticated => write!(f, "Unauthenticated"),
            AuthState::LoggingIn => write!(f, "LoggingIn"),
            AuthState::Authenticated => write!(f, "Authenticated"),
        }
    }
}

/// Why the last validation failed. Drives the remediation text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ToolMissing,
    NotLoggedIn,
    Other,
}

impl FailureKind {
    /// Classifies tool output by the CLI's login wording. A missing tool is
    /// reported by the provider from the spawn result, never from text.
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("az login") || lower.contains("not logged in") {
            FailureKind::NotLoggedIn
        } else {
            FailureKind::Other
        }
    }

    /// Human-readable diagnostic with remediation for `program`.
    pub fn diagnostic(&self, program: &str, detail: &str) -> String {
        match self {
            FailureKind::NotLoggedIn => {
                format!("Not logged in to Azure.\nRun:  {} login", program)
            }
            FailureKind::ToolMissing => format!(
                "Azure CLI is not installed or not logged in.\n\
                 Install: https://learn.microsoft.com/cli/azure/install-azure-cli\n\
                 Then run:  {} login",
                program
            ),
            FailureKind::Other => format!("Authentication check failed: {}", detail),
        }
    }

    pub fn into_error(self, message: String) -> AuthError {
        match self {
            FailureKind::ToolMissing => AuthError::AuthUnavailable { message },
            FailureKind::NotLoggedIn => AuthError::AuthRequired { message },
            FailureKind::Other => AuthError::AuthTransientFailure { message },
        }
    }
}

/// Snapshot returned by `check_auth`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthStatus {
    pub authenticated: bool,
    pub message: String,
}

/// The single identity of the process.
///
/// `is_authenticated` and the credential handle only change together, so a
/// reader never sees one without the other.
#[derive(Debug, Default)]
pub struct AuthSession {
    credential: Option<CredentialHandle>,
    message: String,
    initialized: bool,
    logging_in: bool,
    last_failure: Option<FailureKind>,
}

impl AuthSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> AuthState {
        if self.logging_in {
            AuthState::LoggingIn
        } else if self.credential.is_some() {
            AuthState::Authenticated
        } else if self.initialized {
            AuthState::Unauthenticated
        } else {
            AuthState::Uninitialized
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.credential.is_some()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn credential(&self) -> Option<&CredentialHandle> {
        self.credential.as_ref()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn last_failure(&self) -> Option<FailureKind> {
        self.last_failure
    }

    pub fn status(&self) -> AuthStatus {
        AuthStatus {
            authenticated: self.is_authenticated(),
            message: self.message.clone(),
        }
    }

    /// The credential a gated operation may use, or the error it should see.
    pub fn gate(&self) -> Result<&CredentialHandle, AuthError> {
        if let Some(credential) = &self.credential {
            return Ok(credential);
        }
        let kind = self.last_failure.unwrap_or(FailureKind::Other);
        let message = if self.message.is_empty() {
            "Authentication has not been checked yet".to_string()
        } else {
            self.message.clone()
        };
        Err(kind.into_error(message))
    }

    pub(crate) fn mark_initialized(&mut self) {
        self.initialized = true;
    }

    pub(crate) fn set_logging_in(&mut self, logging_in: bool) {
        self.logging_in = logging_in;
    }

    pub(crate) fn authenticate(&mut self, credential: CredentialHandle, message: impl Into<String>) {
        self.credential = Some(credential);
        self.message = message.into();
        self.last_failure = None;
        self.initialized = true;
    }

    pub(crate) fn fail(&mut self, kind: FailureKind, message: impl Into<String>) {
        self.credential = None;
        self.message = message.into();
        self.last_failure = Some(kind);
        self.initialized = true;
    }

    pub(crate) fn clear_credential(&mut self) {
        self.credential = None;
    }
}
