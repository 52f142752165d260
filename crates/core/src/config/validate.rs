use std::collections::HashSet;

use super::{types::Config, AuthMethod, ConfigError};

/// Validate configuration
///
/// Serde already enforces shape; this catches combinations that parse
/// fine but cannot run.
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.server.port == 0 {
        return Err(invalid("server.port cannot be 0"));
    }

    if config.auth.method == AuthMethod::ApiKey
        && config.auth.api_key.as_deref().unwrap_or("").is_empty()
    {
        return Err(invalid("auth.api_key must be set when auth.method = \"api_key\""));
    }

    if config.quota.threshold == 0 {
        return Err(invalid("quota.threshold must be greater than 0"));
    }
    if config.quota.window_hours == 0 {
        return Err(invalid("quota.window_hours must be greater than 0"));
    }

    if config.scheduler.max_concurrent_sessions == 0 {
        return Err(invalid("scheduler.max_concurrent_sessions must be at least 1"));
    }
    if let Some(percent) = config.scheduler.standby_at_percent {
        if percent == 0 || percent >= 100 {
            return Err(invalid("scheduler.standby_at_percent must be between 1 and 99"));
        }
    }

    let transfer = &config.transfer;
    if transfer.command.trim().is_empty() {
        return Err(invalid("transfer.command cannot be empty"));
    }
    if transfer.transfers == 0 {
        return Err(invalid("transfer.transfers must be at least 1"));
    }
    if transfer.stall_timeout_secs * 1000 <= transfer.stall_poll_interval_ms {
        return Err(invalid(
            "transfer.stall_timeout_secs must be longer than transfer.stall_poll_interval_ms",
        ));
    }
    if let Some(ref pattern) = transfer.progress_pattern {
        regex_lite::Regex::new(pattern).map_err(|e| {
            invalid(&format!("transfer.progress_pattern does not compile: {}", e))
        })?;
    }
    if let Some(ref ssh) = transfer.ssh {
        if ssh.host.trim().is_empty() {
            return Err(invalid("transfer.ssh.host cannot be empty"));
        }
    }

    if config.directory.provision_max_attempts == 0 {
        return Err(invalid("directory.provision_max_attempts must be at least 1"));
    }

    let mut seen = HashSet::new();
    for domain in &config.domains {
        if domain.name.trim().is_empty() {
            return Err(invalid("domains[].name cannot be empty"));
        }
        if !seen.insert(domain.name.as_str()) {
            return Err(invalid(&format!("duplicate domain '{}'", domain.name)));
        }
        if domain.admin.trim().is_empty() {
            return Err(invalid(&format!("domain '{}' has no admin", domain.name)));
        }
        if domain.group.trim().is_empty() {
            return Err(invalid(&format!("domain '{}' has no group", domain.name)));
        }
        if domain.pool_size_limit == 0 {
            return Err(invalid(&format!(
                "domain '{}' pool_size_limit must be at least 1",
                domain.name
            )));
        }
    }

    Ok(())
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::ValidationError(message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{load_config_from_str, DomainProfile};
    use crate::transfer::SshConfig;
    use tokio_test::{assert_err, assert_ok};

    fn base_config() -> Config {
        load_config_from_str(
            r#"
[auth]
method = "none"

[[domains]]
name = "example.com"
admin = "admin@example.com"
group = "uploaders@example.com"
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_validate_valid_config() {
        assert_ok!(validate_config(&base_config()));
    }

    #[test]
    fn test_validate_port_zero_fails() {
        let mut config = base_config();
        config.server.port = 0;
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_validate_api_key_required() {
        let mut config = base_config();
        config.auth.method = AuthMethod::ApiKey;
        config.auth.api_key = None;
        assert_err!(validate_config(&config));

        config.auth.api_key = Some("key".to_string());
        assert_ok!(validate_config(&config));
    }

    #[test]
    fn test_validate_duplicate_domain() {
        let mut config = base_config();
        config.domains.push(DomainProfile::new(
            "example.com",
            "other@example.com",
            "g@example.com",
        ));
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("duplicate domain"));
    }

    #[test]
    fn test_validate_zero_threshold() {
        let mut config = base_config();
        config.quota.threshold = 0;
        assert_err!(validate_config(&config));
    }

    #[test]
    fn test_validate_stall_timeout_shorter_than_poll() {
        let mut config = base_config();
        config.transfer.stall_timeout_secs = 1;
        config.transfer.stall_poll_interval_ms = 5000;
        assert_err!(validate_config(&config));
    }

    #[test]
    fn test_validate_bad_progress_pattern() {
        let mut config = base_config();
        config.transfer.progress_pattern = Some("Transferred:(".to_string());
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("progress_pattern"));
    }

    #[test]
    fn test_validate_empty_ssh_host() {
        let mut config = base_config();
        config.transfer.ssh = Some(SshConfig {
            host: " ".to_string(),
            ..SshConfig::default()
        });
        assert_err!(validate_config(&config));
    }

    #[test]
    fn test_validate_zero_concurrency() {
        let mut config = base_config();
        config.scheduler.max_concurrent_sessions = 0;
        assert_err!(validate_config(&config));
    }

    #[test]
    fn test_validate_standby_percent_bounds() {
        for (percent, ok) in [(0, false), (1, true), (90, true), (99, true), (100, false)] {
            let mut config = base_config();
            config.scheduler.standby_at_percent = Some(percent);
            assert_eq!(validate_config(&config).is_ok(), ok, "{}", percent);
        }
    }
}
