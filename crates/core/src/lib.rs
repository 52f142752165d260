pub mod audit;
pub mod auth;
pub mod config;
pub mod directory;
pub mod engine;
pub mod identity;
pub mod job;
pub mod metrics;
pub mod notify;
pub mod quota;
pub mod scheduler;
pub mod testing;
pub mod transfer;

pub use auth::{
    create_authenticator, AuthError, AuthRequest, Authenticator, NoneAuthenticator, Principal,
};
pub use config::{
    load_config, load_config_from_str, validate_config, AuthMethod, Config, ConfigError,
    DomainProfile, SanitizedConfig,
};
pub use engine::{DomainPool, Engine, EngineError, EngineStatus, IdentitySummary};
pub use identity::{Identity, IdentityManager, IdentityState};
pub use job::{EnqueueRequest, Job, JobFilter, JobState};
pub use scheduler::{JobScheduler, SchedulerConfig, SchedulerError};
