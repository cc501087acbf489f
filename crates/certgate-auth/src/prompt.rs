//! Yes/no confirmation before an interactive login.

use async_trait::async_trait;
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};

#[async_trait]
pub trait ConfirmPrompt: Send + Sync {
    async fn confirm(&self, question: &str) -> bool;
}

/// Asks on stderr and reads one line from stdin. Anything but `y`/`yes`
/// (or a read failure) is a no.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdinPrompt;

#[async_trait]
impl ConfirmPrompt for StdinPrompt {
    async fn confirm(&self, question: &str) -> bool {
        let mut stderr = io::stderr();
        let asked = stderr.write_all(format!("{} (y/n): ", question).as_bytes()).await;
        if asked.is_err() || stderr.flush().await.is_err() {
            return false;
        }

        let mut answer = String::new();
        match BufReader::new(io::stdin()).read_line(&mut answer).await {
            Ok(_) => is_yes(&answer),
            Err(_) => false,
        }
    }
}

/// Always gives the same answer. Useful when stdin is not a terminal.
#[derive(Debug, Clone, Copy)]
pub struct FixedAnswer(pub bool);

#[async_trait]
impl ConfirmPrompt for FixedAnswer {
    async fn confirm(&self, _question: &str) -> bool {
        self.0
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}
