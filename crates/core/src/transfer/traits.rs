//! Session runner boundary between the scheduler and the transfer tool.

use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use tokio::sync::{mpsc, watch};

use super::error::TransferError;

/// Everything needed to launch one transfer session.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub job_id: String,
    pub source: String,
    pub destination: String,
    /// Account the tool impersonates.
    pub identity: String,
    /// Service-account key on this host.
    pub credentials_path: PathBuf,
    /// Same key as seen from the SSH transfer host, when it lives elsewhere.
    pub remote_credentials_path: Option<PathBuf>,
    pub dry_run: bool,
}

/// Newly transferred bytes since the previous report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionProgress {
    pub delta_bytes: u64,
    /// Current rate as printed by the tool, if it printed one.
    pub speed: Option<String>,
}

impl SessionProgress {
    pub fn bytes(delta_bytes: u64) -> Self {
        Self {
            delta_bytes,
            speed: None,
        }
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionOutcome {
    Completed,
    /// No parsable progress for longer than the stall timeout.
    Stalled { idle_secs: u64 },
    Crashed {
        exit_code: Option<i32>,
        diagnostics: String,
    },
    Cancelled,
}

impl SessionOutcome {
    /// Label for metrics and audit records.
    pub fn label(&self) -> &'static str {
        match self {
            SessionOutcome::Completed => "completed",
            SessionOutcome::Stalled { .. } => "stalled",
            SessionOutcome::Crashed { .. } => "crashed",
            SessionOutcome::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionReport {
    pub outcome: SessionOutcome,
    /// Sum of the deltas sent on the progress channel.
    pub bytes: u64,
    pub duration_ms: u64,
}

/// Runs one transfer session to its end.
///
/// Progress deltas are sent on `progress` as they are observed; `cancel`
/// flipping to `true` must stop the session promptly and yield
/// [`SessionOutcome::Cancelled`].
#[async_trait]
pub trait SessionRunner: Send + Sync {
    fn name(&self) -> &str;

    async fn run_session(
        &self,
        request: SessionRequest,
        progress: mpsc::Sender<SessionProgress>,
        cancel: watch::Receiver<bool>,
    ) -> Result<SessionReport, TransferError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_labels() {
        assert_eq!(SessionOutcome::Completed.label(), "completed");
        assert_eq!(SessionOutcome::Stalled { idle_secs: 360 }.label(), "stalled");
        assert_eq!(
            SessionOutcome::Crashed {
                exit_code: Some(7),
                diagnostics: String::new()
            }
            .label(),
            "crashed"
        );
        assert_eq!(SessionOutcome::Cancelled.label(), "cancelled");
    }

    #[test]
    fn test_outcome_serializes_tagged() {
        let json = serde_json::to_string(&SessionOutcome::Stalled { idle_secs: 360 }).unwrap();
        assert_eq!(json, r#"{"kind":"stalled","idle_secs":360}"#);
    }
}
