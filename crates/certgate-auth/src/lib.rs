//! Authentication gate for certgate
//!
//! A single [`AuthManager`] owns the process identity. It checks lazily or
//! eagerly, caches the result, re-checks cheaply on demand and, in the
//! interactive start mode only, walks the user through a CLI login.
//!
//! ```no_run
//! use certgate_auth::{AuthManager, InitMode};
//! use certgate_core::config::AuthConfig;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mut auth = AuthManager::from_config(&AuthConfig::default())
//!     .start(InitMode::Lazy)
//!     .await?;
//! let status = auth.check_auth().await;
//! println!("authenticated: {}", status.authenticated);
//! # Ok(())
//! # }
//! ```

pub mod credential;
pub mod manager;
pub mod probe;
pub mod prompt;
pub mod session;

pub use credential::{AccessToken, CliCredentialProvider, CredentialError, CredentialHandle, CredentialProvider};
pub use manager::{AuthManager, InitMode, InteractiveLoginError};
pub use probe::{CliToolProbe, ProbeOutcome, ToolProbe};
pub use prompt::{ConfirmPrompt, FixedAnswer, StdinPrompt};
pub use session::{AuthSession, AuthState, AuthStatus, FailureKind};
