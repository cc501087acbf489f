//! Local tool probes.
//!
//! Every probe is a subprocess bounded by a timeout. A probe never returns an
//! error: a missing binary, a non-zero exit and a timeout are all just
//! negative outcomes.

use async_trait::async_trait;
use certgate_core::config::AuthConfig;
use std::io;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Result of a single bounded subprocess call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Exit status zero, with trimmed stdout
    Success(String),
    /// Non-zero exit or spawn failure, with trimmed stderr
    Failed(String),
    /// The deadline passed and the child was killed
    TimedOut,
    /// The executable does not exist
    NotFound,
}

impl ProbeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ProbeOutcome::Success(_))
    }
}

/// Checks on the local cloud CLI used for interactive login.
#[async_trait]
pub trait ToolProbe: Send + Sync {
    /// Fast existence check (`which` / `where`).
    async fn exists(&self) -> ProbeOutcome;

    /// Slower fallback: runs the tool's version command.
    async fn version(&self) -> ProbeOutcome;

    /// Whether an account is currently logged in.
    async fn account_status(&self) -> ProbeOutcome;

    /// Runs the interactive login.
    async fn login(&self) -> ProbeOutcome;
}

/// [`ToolProbe`] backed by the `az` CLI (or whichever program is configured).
#[derive(Debug, Clone)]
pub struct CliToolProbe {
    program: String,
    exists_timeout: Duration,
    probe_timeout: Duration,
    login_timeout: Duration,
}

impl CliToolProbe {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            program: config.cli_program.clone(),
            exists_timeout: config.exists_timeout(),
            probe_timeout: config.probe_timeout(),
            login_timeout: config.login_timeout(),
        }
    }

    fn cli(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .env("AZURE_CORE_NO_COLOR", "1")
            .env("AZURE_LOGGING_LEVEL", "ERROR")
            .stdin(Stdio::null());
        command
    }
}

#[async_trait]
impl ToolProbe for CliToolProbe {
    async fn exists(&self) -> ProbeOutcome {
        let locator = if cfg!(windows) { "where" } else { "which" };
        let mut command = Command::new(locator);
        command.arg(&self.program).stdin(Stdio::null());
        run_captured(command, self.exists_timeout).await
    }

    async fn version(&self) -> ProbeOutcome {
        let mut command = self.cli();
        command.arg("--version");
        run_captured(command, self.probe_timeout).await
    }

    async fn account_status(&self) -> ProbeOutcome {
        let mut command = self.cli();
        command.args(["account", "show", "-o", "json"]);
        let outcome = run_captured(command, self.probe_timeout).await;
        if outcome == ProbeOutcome::TimedOut {
            warn!(
                program = %self.program,
                timeout_secs = self.probe_timeout.as_secs(),
                "Account probe timed out; the CLI is responding slowly"
            );
        }
        outcome
    }

    async fn login(&self) -> ProbeOutcome {
        // stdout stays clean for the command protocol; prompts go to stderr
        let mut command = Command::new(&self.program);
        command
            .arg("login")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());
        run_captured(command, self.login_timeout).await
    }
}

/// Spawns `command`, kills it if `limit` passes, and folds every outcome
/// into a [`ProbeOutcome`].
pub(crate) async fn run_captured(mut command: Command, limit: Duration) -> ProbeOutcome {
    command.kill_on_drop(true);

    let outcome = match timeout(limit, command.output()).await {
        Err(_) => ProbeOutcome::TimedOut,
        Ok(Err(e)) if e.kind() == io::ErrorKind::NotFound => ProbeOutcome::NotFound,
        Ok(Err(e)) => ProbeOutcome::Failed(e.to_string()),
        Ok(Ok(output)) if output.status.success() => {
            ProbeOutcome::Success(String::from_utf8_lossy(&output.stdout).trim().to_string())
        }
        Ok(Ok(output)) => {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if stderr.is_empty() {
                ProbeOutcome::Failed(format!("exited with {}", output.status))
            } else {
                ProbeOutcome::Failed(stderr)
            }
        }
    };

    debug!(
        program = ?command.as_std().get_program(),
        success = outcome.is_success(),
        "Probe finished"
    );
    outcome
}
