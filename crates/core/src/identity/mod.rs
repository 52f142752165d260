//! Temporary identities: records, persistence and lifecycle.

mod error;
mod manager;
mod naming;
mod sqlite_store;
mod store;
mod types;

pub use error::{IdentityError, ProvisionError};
pub use manager::{DomainHealth, IdentityManager, RetireOutcome};
pub use naming::generate_handle;
pub use sqlite_store::SqliteIdentityStore;
pub use store::{IdentityFilter, IdentityStore, IdentityStoreError};
pub use types::{Identity, IdentityState};
