use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use crate::directory::DirectoryConfig;
use crate::notify::NotifyConfig;
use crate::quota::QuotaConfig;
use crate::scheduler::SchedulerConfig;
use crate::transfer::{SshMode, TransferConfig};

/// Root configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub auth: AuthConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub directory: DirectoryConfig,
    #[serde(default)]
    pub notifications: NotifyConfig,
    /// Destination domains jobs may target.
    #[serde(default)]
    pub domains: Vec<DomainProfile>,
}

impl Config {
    /// Look up a domain profile by name.
    pub fn domain(&self, name: &str) -> Option<&DomainProfile> {
        self.domains.iter().find(|d| d.name == name)
    }
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    8080
}

/// Authentication configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    pub method: AuthMethod,
    /// Required when method = "api_key".
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    None,
    ApiKey,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("isync.db")
}

/// One destination account-management domain.
///
/// Immutable once loaded. Jobs reference a profile by `name`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct DomainProfile {
    /// Destination domain, e.g. "example.com". Generated handles live here.
    pub name: String,
    /// Administrator the directory calls impersonate.
    pub admin: String,
    /// Delegated credential material handed to the transfer tool.
    #[serde(default = "default_credentials_path")]
    pub credentials_path: PathBuf,
    /// Credential path as seen from the SSH transfer host, when different.
    #[serde(default)]
    pub remote_credentials_path: Option<PathBuf>,
    /// Group granting temporary identities access to the destination.
    pub group: String,
    /// Maximum identities alive at once (provisioning, active or retiring).
    #[serde(default = "default_pool_size_limit")]
    pub pool_size_limit: usize,
}

impl DomainProfile {
    pub fn new(name: impl Into<String>, admin: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            admin: admin.into(),
            credentials_path: default_credentials_path(),
            remote_credentials_path: None,
            group: group.into(),
            pool_size_limit: default_pool_size_limit(),
        }
    }

    pub fn with_credentials_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.credentials_path = path.into();
        self
    }

    pub fn with_pool_size_limit(mut self, limit: usize) -> Self {
        self.pool_size_limit = limit;
        self
    }
}

fn default_credentials_path() -> PathBuf {
    PathBuf::from("keys/master.json")
}

fn default_pool_size_limit() -> usize {
    10
}

/// Sanitized config for API responses (secrets redacted)
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedConfig {
    pub auth: SanitizedAuthConfig,
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub quota: QuotaConfig,
    pub transfer: SanitizedTransferConfig,
    pub directory: SanitizedDirectoryConfig,
    pub webhook_configured: bool,
    pub domains: Vec<DomainProfile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SanitizedAuthConfig {
    pub method: String,
    pub api_key_configured: bool,
}

/// Transfer settings without the SSH key location.
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedTransferConfig {
    pub binary: PathBuf,
    pub command: String,
    pub transfers: u32,
    pub chunk_size: String,
    pub stall_timeout_secs: u64,
    pub ssh_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_mode: Option<SshMode>,
}

/// Directory settings with the token command hidden.
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedDirectoryConfig {
    pub api_base: String,
    pub token_command_configured: bool,
    pub call_timeout_secs: u64,
    pub provision_max_attempts: u32,
    pub protected_handles: usize,
}

impl From<&Config> for SanitizedConfig {
    fn from(config: &Config) -> Self {
        Self {
            auth: SanitizedAuthConfig {
                method: match config.auth.method {
                    AuthMethod::None => "none".to_string(),
                    AuthMethod::ApiKey => "api_key".to_string(),
                },
                api_key_configured: config.auth.api_key.is_some(),
            },
            server: config.server.clone(),
            database: config.database.clone(),
            scheduler: config.scheduler.clone(),
            quota: config.quota.clone(),
            transfer: SanitizedTransferConfig {
                binary: config.transfer.binary.clone(),
                command: config.transfer.command.clone(),
                transfers: config.transfer.transfers,
                chunk_size: config.transfer.chunk_size.clone(),
                stall_timeout_secs: config.transfer.stall_timeout_secs,
                ssh_enabled: config.transfer.ssh.is_some(),
                ssh_mode: config.transfer.ssh.as_ref().map(|s| s.mode),
            },
            directory: SanitizedDirectoryConfig {
                api_base: config.directory.api_base.clone(),
                token_command_configured: !config.directory.token_command.is_empty(),
                call_timeout_secs: config.directory.call_timeout_secs,
                provision_max_attempts: config.directory.provision_max_attempts,
                protected_handles: config.directory.protected_handles.len(),
            },
            webhook_configured: config
                .notifications
                .webhook_url
                .as_deref()
                .is_some_and(|url| !url.is_empty()),
            domains: config.domains.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_valid_config_with_none_auth() {
        let toml = r#"
[auth]
method = "none"

[server]
host = "127.0.0.1"
port = 9000
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(matches!(config.auth.method, AuthMethod::None));
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host.to_string(), "127.0.0.1");
        assert!(config.domains.is_empty());
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let toml = r#"
[auth]
method = "none"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host.to_string(), "0.0.0.0");
        assert_eq!(config.database.path, PathBuf::from("isync.db"));
        assert_eq!(config.quota.threshold, 700 * 1024 * 1024 * 1024);
        assert_eq!(config.transfer.command, "copy");
    }

    #[test]
    fn test_deserialize_missing_auth_fails() {
        let toml = r#"
[server]
port = 8080
"#;
        let result: Result<Config, _> = toml::from_str(toml);
        assert!(result.is_err());
    }

    #[test]
    fn test_deserialize_domains() {
        let toml = r#"
[auth]
method = "none"

[[domains]]
name = "example.com"
admin = "admin@example.com"
group = "uploaders@example.com"
credentials_path = "keys/example.json"
pool_size_limit = 3

[[domains]]
name = "other.org"
admin = "root@other.org"
group = "pool@other.org"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.domains.len(), 2);

        let example = config.domain("example.com").unwrap();
        assert_eq!(example.pool_size_limit, 3);
        assert_eq!(example.credentials_path, PathBuf::from("keys/example.json"));

        let other = config.domain("other.org").unwrap();
        assert_eq!(other.pool_size_limit, 10);
        assert_eq!(other.credentials_path, PathBuf::from("keys/master.json"));
        assert!(config.domain("missing.net").is_none());
    }

    #[test]
    fn test_sanitized_config_hides_secrets() {
        let toml = r#"
[auth]
method = "api_key"
api_key = "super-secret"

[directory]
token_command = ["mint-token", "--key", "keys/master.json"]

[notifications]
webhook_url = "https://hooks.slack.com/services/T000/B000/XXXX"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let sanitized = SanitizedConfig::from(&config);
        let json = serde_json::to_string(&sanitized).unwrap();

        assert!(!json.contains("super-secret"));
        assert!(!json.contains("mint-token"));
        assert!(!json.contains("hooks.slack.com"));
        assert!(sanitized.auth.api_key_configured);
        assert!(sanitized.directory.token_command_configured);
        assert!(sanitized.webhook_configured);
    }
}
