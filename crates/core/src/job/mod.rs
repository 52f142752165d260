//! Transfer jobs and their persistence.

mod sqlite_store;
mod store;
mod types;

pub use sqlite_store::SqliteJobStore;
pub use store::{JobFilter, JobStore, JobStoreError};
pub use types::{EnqueueRequest, Job, JobCounter, JobState, RUNNABLE_STATES};
