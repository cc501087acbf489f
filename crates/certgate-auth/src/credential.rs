//! Credential acquisition.

use crate::probe::{run_captured, ProbeOutcome};
use crate::session::FailureKind;
use async_trait::async_trait;
use certgate_core::config::AuthConfig;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::fmt;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use zeroize::Zeroizing;

/// A bearer token returned by the lightweight credential path.
#[derive(Clone)]
pub struct AccessToken {
    secret: Zeroizing<String>,
    expires_on: Option<DateTime<Utc>>,
}

impl AccessToken {
    pub fn new(secret: impl Into<String>, expires_on: Option<DateTime<Utc>>) -> Self {
        Self {
            secret: Zeroizing::new(secret.into()),
            expires_on,
        }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn expires_on(&self) -> Option<DateTime<Utc>> {
        self.expires_on
    }

    pub fn is_empty(&self) -> bool {
        self.secret.trim().is_empty()
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("secret", &"<redacted>")
            .field("expires_on", &self.expires_on)
            .finish()
    }
}

/// The richer credential used for cloud calls once a token check passed.
#[derive(Clone)]
pub struct CredentialHandle {
    token: AccessToken,
    scope: String,
    acquired_at: DateTime<Utc>,
}

impl CredentialHandle {
    pub fn new(token: AccessToken, scope: impl Into<String>) -> Self {
        Self {
            token,
            scope: scope.into(),
            acquired_at: Utc::now(),
        }
    }

    pub fn token(&self) -> &AccessToken {
        &self.token
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }
}

impl fmt::Debug for CredentialHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialHandle")
            .field("scope", &self.scope)
            .field("acquired_at", &self.acquired_at)
            .field("expires_on", &self.token.expires_on)
            .finish()
    }
}

/// Failure reported by a [`CredentialProvider`]. The message is what the
/// underlying tool said; `kind` picks the remediation the session shows.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct CredentialError {
    pub message: String,
    pub kind: FailureKind,
}

impl CredentialError {
    /// A failure reported by the tool, classified from its login wording.
    pub fn new(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind: FailureKind::classify(&message),
            message,
        }
    }

    /// The credential tool could not be started at all.
    pub fn tool_missing(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: FailureKind::ToolMissing,
        }
    }
}

/// Source of identity for the auth state machine.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Lightweight validation: acquire a token for `scope`.
    async fn acquire_token(&self, scope: &str) -> Result<AccessToken, CredentialError>;

    /// Turns a freshly acquired token into the handle used for cloud calls.
    async fn upgrade(&self, token: AccessToken, scope: &str) -> Result<CredentialHandle, CredentialError>;
}

/// Acquires tokens through `az account get-access-token`.
#[derive(Debug, Clone)]
pub struct CliCredentialProvider {
    program: String,
    timeout: Duration,
}

#[derive(Deserialize)]
struct CliToken {
    #[serde(rename = "accessToken")]
    access_token: String,
    #[serde(default)]
    expires_on: Option<i64>,
}

impl CliCredentialProvider {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            program: config.cli_program.clone(),
            timeout: config.token_timeout(),
        }
    }
}

#[async_trait]
impl CredentialProvider for CliCredentialProvider {
    async fn acquire_token(&self, scope: &str) -> Result<AccessToken, CredentialError> {
        let mut command = Command::new(&self.program);
        command
            .args(["account", "get-access-token", "--scope", scope, "-o", "json"])
            .env("AZURE_CORE_NO_COLOR", "1")
            .stdin(Stdio::null());

        match run_captured(command, self.timeout).await {
            ProbeOutcome::Success(stdout) => parse_cli_token(&stdout),
            ProbeOutcome::Failed(stderr) => Err(CredentialError::new(stderr)),
            ProbeOutcome::TimedOut => Err(CredentialError::new(format!(
                "token request timed out after {}s",
                self.timeout.as_secs()
            ))),
            ProbeOutcome::NotFound => Err(CredentialError::tool_missing(format!(
                "Azure CLI executable '{}' was not found",
                self.program
            ))),
        }
    }

    async fn upgrade(&self, token: AccessToken, scope: &str) -> Result<CredentialHandle, CredentialError> {
        Ok(CredentialHandle::new(token, scope))
    }
}

fn parse_cli_token(stdout: &str) -> Result<AccessToken, CredentialError> {
    let parsed: CliToken = serde_json::from_str(stdout)
        .map_err(|e| CredentialError::new(format!("unexpected token response: {}", e)))?;
    let expires_on = parsed
        .expires_on
        .and_then(|secs| DateTime::from_timestamp(secs, 0));
    Ok(AccessToken::new(parsed.access_token, expires_on))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cli_token() {
        let token = parse_cli_token(
            r#"{"accessToken": "eyJ0eXAi", "expiresOn": "2026-01-01 10:00:00.000000", "expires_on": 1767261600, "tokenType": "Bearer"}"#,
        )
        .unwrap();
        assert_eq!(token.secret(), "eyJ0eXAi");
        assert_eq!(token.expires_on().unwrap().timestamp(), 1767261600);
    }

    #[test]
    fn test_parse_cli_token_without_expiry() {
        let token = parse_cli_token(r#"{"accessToken": "abc"}"#).unwrap();
        assert!(token.expires_on().is_none());
        assert!(!token.is_empty());
    }

    #[test]
    fn test_parse_cli_token_garbage() {
        assert!(parse_cli_token("ERROR: not json").is_err());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let handle = CredentialHandle::new(AccessToken::new("top-secret", None), "scope");
        assert!(!format!("{:?}", handle).contains("top-secret"));
        assert!(!format!("{:?}", handle.token()).contains("top-secret"));
    }

    #[tokio::test]
    async fn test_missing_cli_mentions_azure_cli() {
        let config = AuthConfig {
            cli_program: "certgate-missing-cli".to_string(),
            ..Default::default()
        };
        let err = CliCredentialProvider::new(&config)
            .acquire_token("https://management.azure.com/.default")
            .await
            .unwrap_err();
        assert!(err.message.contains("CLI"));
        assert_eq!(err.kind, FailureKind::ToolMissing);
    }

    #[test]
    fn test_tool_output_is_never_tool_missing() {
        for message in [
            "AADSTS7000215: Invalid client secret provided.",
            "Azure service returned 503 Service Unavailable",
            "hazard: connection reset by peer",
        ] {
            assert_eq!(CredentialError::new(message).kind, FailureKind::Other, "{}", message);
        }
        assert_eq!(
            CredentialError::new("ERROR: Please run 'az login' to setup account.").kind,
            FailureKind::NotLoggedIn
        );
    }
}
