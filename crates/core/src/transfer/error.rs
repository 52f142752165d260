//! Error types for the transfer module.

use std::path::PathBuf;
use thiserror::Error;

/// Failures that prevent a session from being supervised at all.
///
/// A tool that starts and then exits non-zero is a
/// [`SessionOutcome::Crashed`](super::SessionOutcome::Crashed), not an error.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The tool (or ssh) could not be spawned.
    #[error("failed to launch {binary}: {source}")]
    Launch {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid progress pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
}
