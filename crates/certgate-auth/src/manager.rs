//! The authentication state machine.

use crate::credential::{CliCredentialProvider, CredentialError, CredentialHandle, CredentialProvider};
use crate::probe::{CliToolProbe, ProbeOutcome, ToolProbe};
use crate::prompt::{ConfirmPrompt, StdinPrompt};
use crate::session::{AuthSession, AuthState, AuthStatus, FailureKind};
use certgate_core::config::{AuthConfig, AuthMode};
use certgate_core::AuthError;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// How the manager validates at construction time.
pub type InitMode = AuthMode;

const AUTHENTICATED_MESSAGE: &str = "Authenticated with Azure";

/// Unrecoverable failure of the eager interactive start.
///
/// Only the binary's entry point handles this, by exiting the process.
#[derive(Debug, Error)]
pub enum InteractiveLoginError {
    #[error("{program} is not installed. Install: https://learn.microsoft.com/cli/azure/install-azure-cli")]
    ToolNotInstalled { program: String },

    #[error("Login is required. Run '{program} login' first.")]
    Declined { program: String },

    #[error("Login failed: {reason}")]
    LoginFailed { reason: String },

    #[error("Login timed out after {secs}s")]
    LoginTimedOut { secs: u64 },

    #[error("Authentication failed after login: {message}")]
    CredentialUnavailable { message: String },
}

/// Owns the process identity and every transition of it.
///
/// All mutating operations take `&mut self`; whoever holds the manager is
/// the only writer.
pub struct AuthManager {
    session: AuthSession,
    provider: Arc<dyn CredentialProvider>,
    probe: Arc<dyn ToolProbe>,
    prompt: Arc<dyn ConfirmPrompt>,
    scope: String,
    program: String,
    login_timeout: Duration,
}

impl AuthManager {
    pub fn new(
        config: &AuthConfig,
        provider: Arc<dyn CredentialProvider>,
        probe: Arc<dyn ToolProbe>,
        prompt: Arc<dyn ConfirmPrompt>,
    ) -> Self {
        Self {
            session: AuthSession::new(),
            provider,
            probe,
            prompt,
            scope: config.token_scope.clone(),
            program: config.cli_program.clone(),
            login_timeout: config.login_timeout(),
        }
    }

    /// Manager backed by the cloud CLI and a stdin prompt.
    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(
            config,
            Arc::new(CliCredentialProvider::new(config)),
            Arc::new(CliToolProbe::new(config)),
            Arc::new(StdinPrompt),
        )
    }

    /// Runs the construction-time step for `mode`.
    ///
    /// `Lazy` does nothing; `EagerCheckOnly` validates once and never
    /// fails; `EagerInteractive` may log in and fails hard when it cannot.
    pub async fn start(mut self, mode: InitMode) -> Result<Self, InteractiveLoginError> {
        info!(%mode, "Starting authentication manager");
        match mode {
            InitMode::EagerInteractive => self.interactive_login().await?,
            InitMode::EagerCheckOnly => {
                self.validate().await;
            }
            InitMode::Lazy => {}
        }
        Ok(self)
    }

    pub fn session(&self) -> &AuthSession {
        &self.session
    }

    pub fn state(&self) -> AuthState {
        self.session.state()
    }

    /// Runs full validation the first time it is called; later calls are
    /// no-ops.
    pub async fn ensure_initialized(&mut self) {
        if !self.session.is_initialized() {
            self.validate().await;
            self.session.mark_initialized();
        }
    }

    /// Re-checks authentication and returns the new state.
    ///
    /// Without `force`, an authenticated session returns `true` without any
    /// external call. With `force`, an authenticated session costs exactly
    /// one token acquisition; if that fails the credential is dropped and a
    /// full validation follows.
    pub async fn refresh(&mut self, force: bool) -> bool {
        if self.session.is_authenticated() {
            if !force {
                debug!("Already authenticated, skipping re-check");
                return true;
            }

            match self.provider.acquire_token(&self.scope).await {
                Ok(token) if !token.is_empty() => {
                    debug!("Forced re-check passed");
                    return true;
                }
                Ok(_) => warn!("Login state changed, running full validation"),
                Err(e) => warn!(error = %e, "Forced re-check failed, running full validation"),
            }
            self.session.clear_credential();
        }

        self.validate().await
    }

    /// Current status, validating first if nothing has been checked yet.
    pub async fn check_auth(&mut self) -> AuthStatus {
        self.ensure_initialized().await;
        self.session.status()
    }

    /// The credential for a gated operation.
    ///
    /// An unauthenticated session is re-validated once (the user may have
    /// logged in since the last check) before the failure is reported.
    pub async fn require_authenticated(&mut self) -> Result<CredentialHandle, AuthError> {
        let first_check = !self.session.is_initialized();
        self.ensure_initialized().await;

        if !self.session.is_authenticated() && !first_check {
            self.refresh(false).await;
        }

        self.session.gate().cloned()
    }

    /// Lightweight token acquisition, upgraded to the full handle on success.
    async fn validate(&mut self) -> bool {
        let token = match self.provider.acquire_token(&self.scope).await {
            Ok(token) if !token.is_empty() => token,
            Ok(_) => {
                let message = FailureKind::NotLoggedIn.diagnostic(&self.program, "");
                warn!("Token request returned an empty token");
                self.session.fail(FailureKind::NotLoggedIn, message);
                return false;
            }
            Err(e) => return self.record_failure(&e),
        };

        match self.provider.upgrade(token, &self.scope).await {
            Ok(handle) => {
                info!(scope = %self.scope, "Authentication validated");
                self.session.authenticate(handle, AUTHENTICATED_MESSAGE);
                true
            }
            Err(e) => self.record_failure(&e),
        }
    }

    fn record_failure(&mut self, error: &CredentialError) -> bool {
        let kind = error.kind;
        warn!(?kind, "Authentication check failed");
        self.session.fail(kind, kind.diagnostic(&self.program, &error.message));
        false
    }

    async fn tool_available(&self) -> bool {
        if self.probe.exists().await.is_success() {
            return true;
        }
        debug!(program = %self.program, "Existence probe failed, trying version probe");
        self.probe.version().await.is_success()
    }

    async fn interactive_login(&mut self) -> Result<(), InteractiveLoginError> {
        info!("Checking Azure authentication");

        if !self.tool_available().await {
            return Err(InteractiveLoginError::ToolNotInstalled {
                program: self.program.clone(),
            });
        }

        if !self.probe.account_status().await.is_success() {
            warn!("Not logged in to Azure");
            if !self.prompt.confirm("Not logged in to Azure. Log in now?").await {
                return Err(InteractiveLoginError::Declined {
                    program: self.program.clone(),
                });
            }

            info!("Continue the login in your browser");
            self.session.set_logging_in(true);
            let outcome = self.probe.login().await;
            self.session.set_logging_in(false);

            match outcome {
                ProbeOutcome::Success(_) => info!("Login succeeded"),
                ProbeOutcome::TimedOut => {
                    return Err(InteractiveLoginError::LoginTimedOut {
                        secs: self.login_timeout.as_secs(),
                    })
                }
                ProbeOutcome::NotFound => {
                    return Err(InteractiveLoginError::ToolNotInstalled {
                        program: self.program.clone(),
                    })
                }
                ProbeOutcome::Failed(reason) => {
                    return Err(InteractiveLoginError::LoginFailed { reason })
                }
            }
        }

        if self.validate().await {
            Ok(())
        } else {
            Err(InteractiveLoginError::CredentialUnavailable {
                message: self.session.message().to_string(),
            })
        }
    }
}

impl std::fmt::Debug for AuthManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthManager")
            .field("state", &self.session.state())
            .field("scope", &self.scope)
            .field("program", &self.program)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::{AccessToken, CredentialError};
    use crate::prompt::FixedAnswer;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Scripted failure; `None` means success.
    #[derive(Default)]
    struct Script(Mutex<Option<CredentialError>>);

    impl Script {
        fn set(&self, failure: Option<&str>) {
            *self.0.lock() = failure.map(CredentialError::new);
        }

        fn set_error(&self, error: CredentialError) {
            *self.0.lock() = Some(error);
        }

        fn get(&self) -> Option<CredentialError> {
            self.0.lock().clone()
        }
    }

    #[derive(Default)]
    struct MockProvider {
        token_calls: AtomicUsize,
        upgrade_calls: AtomicUsize,
        failure: Script,
        empty: AtomicBool,
    }

    #[async_trait]
    impl CredentialProvider for MockProvider {
        async fn acquire_token(&self, _scope: &str) -> Result<AccessToken, CredentialError> {
            self.token_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(error) = self.failure.get() {
                return Err(error);
            }
            if self.empty.load(Ordering::SeqCst) {
                return Ok(AccessToken::new("", None));
            }
            Ok(AccessToken::new("token", None))
        }

        async fn upgrade(
            &self,
            token: AccessToken,
            scope: &str,
        ) -> Result<CredentialHandle, CredentialError> {
            self.upgrade_calls.fetch_add(1, Ordering::SeqCst);
            Ok(CredentialHandle::new(token, scope))
        }
    }

    struct MockProbe {
        exists: ProbeOutcome,
        version: ProbeOutcome,
        account: ProbeOutcome,
        login: ProbeOutcome,
        login_calls: AtomicUsize,
    }

    impl Default for MockProbe {
        fn default() -> Self {
            Self {
                exists: ProbeOutcome::Success("/usr/bin/az".into()),
                version: ProbeOutcome::Success("azure-cli 2.60.0".into()),
                account: ProbeOutcome::Success("{}".into()),
                login: ProbeOutcome::Success(String::new()),
                login_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ToolProbe for MockProbe {
        async fn exists(&self) -> ProbeOutcome {
            self.exists.clone()
        }

        async fn version(&self) -> ProbeOutcome {
            self.version.clone()
        }

        async fn account_status(&self) -> ProbeOutcome {
            self.account.clone()
        }

        async fn login(&self) -> ProbeOutcome {
            self.login_calls.fetch_add(1, Ordering::SeqCst);
            self.login.clone()
        }
    }

    fn manager(provider: &Arc<MockProvider>, probe: MockProbe, answer: bool) -> AuthManager {
        AuthManager::new(
            &AuthConfig::default(),
            provider.clone(),
            Arc::new(probe),
            Arc::new(FixedAnswer(answer)),
        )
    }

    fn calls(provider: &MockProvider) -> usize {
        provider.token_calls.load(Ordering::SeqCst)
    }

    #[tokio::test]
    async fn test_lazy_start_makes_no_calls() {
        let provider = Arc::new(MockProvider::default());
        let auth = manager(&provider, MockProbe::default(), true)
            .start(InitMode::Lazy)
            .await
            .unwrap();
        assert_eq!(calls(&provider), 0);
        assert_eq!(auth.state(), AuthState::Uninitialized);
    }

    #[tokio::test]
    async fn test_ensure_initialized_runs_once() {
        let provider = Arc::new(MockProvider::default());
        let mut auth = manager(&provider, MockProbe::default(), true);

        auth.ensure_initialized().await;
        auth.ensure_initialized().await;
        assert_eq!(calls(&provider), 1);
        assert_eq!(provider.upgrade_calls.load(Ordering::SeqCst), 1);
        assert_eq!(auth.state(), AuthState::Authenticated);
    }

    #[tokio::test]
    async fn test_fast_path_refresh_makes_zero_calls() {
        let provider = Arc::new(MockProvider::default());
        let mut auth = manager(&provider, MockProbe::default(), true)
            .start(InitMode::EagerCheckOnly)
            .await
            .unwrap();
        assert_eq!(calls(&provider), 1);

        for _ in 0..5 {
            assert!(auth.refresh(false).await);
        }
        assert_eq!(calls(&provider), 1);
    }

    #[tokio::test]
    async fn test_forced_refresh_makes_exactly_one_call() {
        let provider = Arc::new(MockProvider::default());
        let mut auth = manager(&provider, MockProbe::default(), true)
            .start(InitMode::EagerCheckOnly)
            .await
            .unwrap();

        for i in 1..=3 {
            assert!(auth.refresh(true).await);
            assert_eq!(calls(&provider), 1 + i);
        }
        // the fast re-check never upgrades
        assert_eq!(provider.upgrade_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_forced_refresh_failure_falls_through() {
        let provider = Arc::new(MockProvider::default());
        let mut auth = manager(&provider, MockProbe::default(), true)
            .start(InitMode::EagerCheckOnly)
            .await
            .unwrap();

        provider.failure.set(Some("ERROR: Please run 'az login' to setup account."));
        assert!(!auth.refresh(true).await);
        // one fast check plus one full validation
        assert_eq!(calls(&provider), 3);
        assert_eq!(auth.state(), AuthState::Unauthenticated);
        assert!(auth.session().credential().is_none());
        assert!(auth.session().message().contains("az login"));
    }

    #[tokio::test]
    async fn test_refresh_recovers_after_login() {
        let provider = Arc::new(MockProvider::default());
        provider.failure.set(Some("not logged in"));
        let mut auth = manager(&provider, MockProbe::default(), true);

        assert!(!auth.refresh(false).await);
        provider.failure.set(None);
        assert!(auth.refresh(false).await);
        assert_eq!(auth.state(), AuthState::Authenticated);
    }

    #[tokio::test]
    async fn test_check_auth_reports_status() {
        let provider = Arc::new(MockProvider::default());
        let mut auth = manager(&provider, MockProbe::default(), true);
        let status = auth.check_auth().await;
        assert!(status.authenticated);
        assert_eq!(status.message, AUTHENTICATED_MESSAGE);

        let provider = Arc::new(MockProvider::default());
        provider.empty.store(true, Ordering::SeqCst);
        let mut auth = manager(&provider, MockProbe::default(), true);
        let status = auth.check_auth().await;
        assert!(!status.authenticated);
        assert!(status.message.contains("az login"));
    }

    #[tokio::test]
    async fn test_require_authenticated_error_kinds() {
        let cases = [
            (CredentialError::new("Please run 'az login' to setup account."), "required"),
            (
                CredentialError::tool_missing("Azure CLI executable 'az' was not found"),
                "unavailable",
            ),
            (CredentialError::new("token request timed out after 5s"), "transient"),
            (CredentialError::new("AADSTS7000215: Invalid client secret provided."), "transient"),
        ];

        for (failure, expected) in cases {
            let provider = Arc::new(MockProvider::default());
            provider.failure.set_error(failure.clone());
            let mut auth = manager(&provider, MockProbe::default(), true);

            let err = auth.require_authenticated().await.unwrap_err();
            let kind = match err {
                AuthError::AuthRequired { .. } => "required",
                AuthError::AuthUnavailable { .. } => "unavailable",
                AuthError::AuthTransientFailure { .. } => "transient",
            };
            assert_eq!(kind, expected, "failure message: {}", failure.message);
            // the first call validates once, not twice
            assert_eq!(calls(&provider), 1);
        }
    }

    #[tokio::test]
    async fn test_require_authenticated_rechecks_after_failure() {
        let provider = Arc::new(MockProvider::default());
        provider.failure.set(Some("not logged in"));
        let mut auth = manager(&provider, MockProbe::default(), true);
        assert!(auth.require_authenticated().await.is_err());

        provider.failure.set(None);
        let handle = auth.require_authenticated().await.unwrap();
        assert_eq!(handle.token().secret(), "token");
        assert_eq!(calls(&provider), 2);

        // authenticated: no further calls
        auth.require_authenticated().await.unwrap();
        assert_eq!(calls(&provider), 2);
    }

    #[tokio::test]
    async fn test_eager_check_only_never_fails() {
        let provider = Arc::new(MockProvider::default());
        provider.failure.set(Some("boom"));
        let auth = manager(&provider, MockProbe::default(), false)
            .start(InitMode::EagerCheckOnly)
            .await
            .unwrap();
        assert_eq!(auth.state(), AuthState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_interactive_tool_missing() {
        let provider = Arc::new(MockProvider::default());
        let probe = MockProbe {
            exists: ProbeOutcome::TimedOut,
            version: ProbeOutcome::NotFound,
            ..Default::default()
        };
        let err = manager(&provider, probe, true)
            .start(InitMode::EagerInteractive)
            .await
            .unwrap_err();
        assert!(matches!(err, InteractiveLoginError::ToolNotInstalled { .. }));
        assert_eq!(calls(&provider), 0);
    }

    #[tokio::test]
    async fn test_interactive_version_fallback() {
        let provider = Arc::new(MockProvider::default());
        let probe = MockProbe {
            exists: ProbeOutcome::Failed(String::new()),
            ..Default::default()
        };
        let auth = manager(&provider, probe, true)
            .start(InitMode::EagerInteractive)
            .await
            .unwrap();
        assert_eq!(auth.state(), AuthState::Authenticated);
    }

    #[tokio::test]
    async fn test_interactive_declined() {
        let provider = Arc::new(MockProvider::default());
        let probe = MockProbe {
            account: ProbeOutcome::Failed("Please run 'az login'".into()),
            ..Default::default()
        };
        let err = manager(&provider, probe, false)
            .start(InitMode::EagerInteractive)
            .await
            .unwrap_err();
        assert!(matches!(err, InteractiveLoginError::Declined { .. }));
    }

    #[tokio::test]
    async fn test_interactive_login_then_authenticated() {
        let provider = Arc::new(MockProvider::default());
        let probe = Arc::new(MockProbe {
            account: ProbeOutcome::Failed("Please run 'az login'".into()),
            ..Default::default()
        });
        let auth = AuthManager::new(
            &AuthConfig::default(),
            provider.clone(),
            probe.clone(),
            Arc::new(FixedAnswer(true)),
        )
        .start(InitMode::EagerInteractive)
        .await
        .unwrap();

        assert_eq!(probe.login_calls.load(Ordering::SeqCst), 1);
        assert_eq!(auth.state(), AuthState::Authenticated);
    }

    #[tokio::test]
    async fn test_interactive_login_timeout() {
        let provider = Arc::new(MockProvider::default());
        let probe = MockProbe {
            account: ProbeOutcome::TimedOut,
            login: ProbeOutcome::TimedOut,
            ..Default::default()
        };
        let err = manager(&provider, probe, true)
            .start(InitMode::EagerInteractive)
            .await
            .unwrap_err();
        assert!(matches!(err, InteractiveLoginError::LoginTimedOut { secs: 120 }));
    }

    #[tokio::test]
    async fn test_interactive_credential_unavailable_after_login() {
        let provider = Arc::new(MockProvider::default());
        provider.failure.set(Some("token request timed out after 5s"));
        let err = manager(&provider, MockProbe::default(), true)
            .start(InitMode::EagerInteractive)
            .await
            .unwrap_err();
        assert!(matches!(err, InteractiveLoginError::CredentialUnavailable { .. }));
    }
}
