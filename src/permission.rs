use std::future::Future;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

pub const RATIONALE: &str =
    "geotrack needs access to your location to record and forward your position.";

pub trait PermissionGate: Send + Sync {
    /// Whether location access was granted. Never errors: failures read as `false`.
    fn request_permission(&self) -> impl Future<Output = bool> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum PermissionPolicy {
    /// No explicit grant is required on this platform.
    #[default]
    Granted,
    Denied,
    /// Ask on the terminal.
    Prompt,
}

impl PermissionGate for PermissionPolicy {
    async fn request_permission(&self) -> bool {
        match self {
            PermissionPolicy::Granted => true,
            PermissionPolicy::Denied => false,
            PermissionPolicy::Prompt => prompt_terminal().await,
        }
    }
}

async fn prompt_terminal() -> bool {
    let mut stderr = tokio::io::stderr();
    let question = format!("{RATIONALE}\nAllow location access? [y/N] ");
    if let Err(err) = stderr.write_all(question.as_bytes()).await {
        tracing::warn!(?err, "failed to show permission prompt");
        return false;
    }
    let _ = stderr.flush().await;

    let mut line = String::new();
    match BufReader::new(tokio::io::stdin()).read_line(&mut line).await {
        Ok(_) => is_affirmative(&line),
        Err(err) => {
            tracing::warn!(?err, "failed to read permission answer");
            false
        }
    }
}

fn is_affirmative(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
