//! Transfer tool supervision.
//!
//! One session is one run of the external transfer tool under one identity.
//! [`ProcessSupervisor`] is the production [`SessionRunner`].

mod command;
mod config;
mod error;
mod progress;
mod supervisor;
mod traits;

pub use command::{build_command, build_transfer_args, shell_quote, TransferCommand};
pub use config::{SshConfig, SshMode, TransferConfig};
pub use error::TransferError;
pub use progress::{ProgressParser, ProgressSample, DEFAULT_PROGRESS_PATTERN};
pub use supervisor::{is_stalled, ProcessSupervisor};
pub use traits::{SessionOutcome, SessionProgress, SessionReport, SessionRequest, SessionRunner};
