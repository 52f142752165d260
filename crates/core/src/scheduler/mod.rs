//! Job scheduler: claims runnable jobs and drives them through transfer
//! sessions, rotating identities as they hit their quota.

mod config;
mod runner;
mod types;

pub use config::SchedulerConfig;
pub use runner::{Claim, JobScheduler, UpdateCallback};
pub use types::{ActiveSession, SchedulerError, SchedulerStatus, TickReport};
