//! Testing utilities and mock implementations for E2E tests.
//!
//! Mocks stand in for the directory service, the transfer tool and the
//! chat webhook, so the whole engine can run without real infrastructure.
//!
//! # Example
//!
//! ```rust,ignore
//! use isync_core::testing::{fixtures, MockDirectoryClient, MockSession, MockSessionRunner};
//!
//! let directory = Arc::new(MockDirectoryClient::new());
//! let runner = Arc::new(MockSessionRunner::new());
//!
//! // Script the next session: 2 GiB of progress, then a clean exit
//! runner.push(MockSession::completes(vec![GIB, GIB])).await;
//!
//! let identities = fixtures::identity_manager(directory.clone(), 10 * GIB);
//! ```

mod mock_directory;
mod mock_notifier;
mod mock_session_runner;

pub use mock_directory::MockDirectoryClient;
pub use mock_notifier::MockNotifier;
pub use mock_session_runner::{MockSession, MockSessionRunner};

/// Test fixtures and helper functions.
pub mod fixtures {
    use std::sync::Arc;

    use chrono::Duration;

    use crate::config::{AuthConfig, AuthMethod, Config, DomainProfile};
    use crate::directory::{DirectoryClient, DirectoryConfig};
    use crate::identity::{IdentityManager, SqliteIdentityStore};
    use crate::quota::{QuotaConfig, QuotaTracker};
    use crate::scheduler::SchedulerConfig;

    /// Domains the fixture config and identity manager know about.
    pub const DOMAINS: [&str; 2] = ["example.com", "example.org"];

    /// Profile for `domain` with group `pool@<domain>`.
    pub fn domain_profile(domain: &str) -> DomainProfile {
        DomainProfile::new(domain, format!("admin@{}", domain), format!("pool@{}", domain))
            .with_credentials_path(format!("/keys/{}.json", domain))
    }

    /// Three attempts, 100ms then 200ms backoff, no propagation wait.
    pub fn directory_config() -> DirectoryConfig {
        DirectoryConfig {
            call_timeout_secs: 5,
            ..DirectoryConfig::default()
        }
        .with_max_attempts(3)
        .with_backoff(100, 1000)
        .with_propagation_delay_ms(0)
    }

    /// Fast polling for loop tests.
    pub fn scheduler_config() -> SchedulerConfig {
        SchedulerConfig::default()
            .with_poll_interval_ms(10)
            .with_max_concurrent_sessions(4)
    }

    /// Identity manager over an in-memory store, knowing every fixture domain.
    pub fn identity_manager(
        directory: Arc<dyn DirectoryClient>,
        threshold: u64,
    ) -> Arc<IdentityManager> {
        let store = Arc::new(SqliteIdentityStore::in_memory().expect("in-memory identity store"));
        Arc::new(IdentityManager::new(
            store,
            directory,
            QuotaTracker::new(threshold, Duration::hours(24)),
            directory_config(),
            DOMAINS.iter().map(|d| domain_profile(d)).collect(),
        ))
    }

    /// Complete configuration with auth disabled and both fixture domains.
    pub fn config() -> Config {
        Config {
            auth: AuthConfig {
                method: AuthMethod::None,
                api_key: None,
            },
            server: Default::default(),
            database: Default::default(),
            scheduler: scheduler_config(),
            quota: QuotaConfig::default(),
            transfer: Default::default(),
            directory: directory_config(),
            notifications: Default::default(),
            domains: DOMAINS.iter().map(|d| domain_profile(d)).collect(),
        }
    }
}
