//! Command-line construction for the transfer tool, optionally over ssh.

use std::path::PathBuf;

use super::config::{SshConfig, SshMode, TransferConfig};
use super::traits::SessionRequest;

/// Program plus arguments, ready for `tokio::process::Command`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl TransferCommand {
    /// Shell-quoted rendering for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.to_string_lossy().to_string())
            .chain(self.args.iter().cloned())
            .map(|arg| shell_quote(&arg))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Tool arguments, without the binary itself.
pub fn build_transfer_args(config: &TransferConfig, request: &SessionRequest) -> Vec<String> {
    let credentials = match (&config.ssh, &request.remote_credentials_path) {
        (Some(_), Some(remote)) => remote,
        _ => &request.credentials_path,
    };

    let mut args = vec![
        config.command.clone(),
        request.source.clone(),
        request.destination.clone(),
        format!(
            "--drive-service-account-file={}",
            credentials.display()
        ),
        format!("--drive-impersonate={}", request.identity),
        "--drive-stop-on-upload-limit".to_string(),
        format!("--transfers={}", config.transfers),
        format!("--drive-chunk-size={}", config.chunk_size),
        format!("--stats={}", config.stats_interval),
        "--verbose".to_string(),
    ];

    args.extend(config.extra_flags.iter().cloned());
    if request.dry_run {
        args.push("--dry-run".to_string());
    }
    args
}

/// Full command for a session, wrapped in ssh when configured.
pub fn build_command(config: &TransferConfig, request: &SessionRequest) -> TransferCommand {
    let local = TransferCommand {
        program: config.binary.clone(),
        args: build_transfer_args(config, request),
    };

    match config.ssh {
        Some(ref ssh) => wrap_ssh(ssh, &local),
        None => local,
    }
}

fn wrap_ssh(ssh: &SshConfig, inner: &TransferCommand) -> TransferCommand {
    let mut args = Vec::new();

    match ssh.mode {
        SshMode::Alias => args.push(ssh.host.clone()),
        SshMode::Explicit => {
            if let Some(ref key) = ssh.key_path {
                args.push("-i".to_string());
                args.push(key.to_string_lossy().to_string());
            }
            let target = match ssh.user {
                Some(ref user) if !user.is_empty() => format!("{}@{}", user, ssh.host),
                _ => ssh.host.clone(),
            };
            args.push(target);
        }
    }

    // ssh joins its trailing arguments into one remote shell command.
    args.push(inner.display());

    TransferCommand {
        program: PathBuf::from("ssh"),
        args,
    }
}

/// POSIX single-quote `arg` unless it is made only of safe characters.
pub fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "@%+=:,./-_".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(dry_run: bool) -> SessionRequest {
        SessionRequest {
            job_id: "job-1".to_string(),
            source: "/srv/media".to_string(),
            destination: "gdrive:Backup".to_string(),
            identity: "ada.turing.00ff@example.com".to_string(),
            credentials_path: PathBuf::from("/keys/master.json"),
            remote_credentials_path: Some(PathBuf::from("/home/sync/keys/master.json")),
            dry_run,
        }
    }

    #[test]
    fn test_build_transfer_args() {
        let config = TransferConfig::default();
        let args = build_transfer_args(&config, &request(false));

        assert_eq!(
            args,
            vec![
                "copy",
                "/srv/media",
                "gdrive:Backup",
                "--drive-service-account-file=/keys/master.json",
                "--drive-impersonate=ada.turing.00ff@example.com",
                "--drive-stop-on-upload-limit",
                "--transfers=8",
                "--drive-chunk-size=128M",
                "--stats=1s",
                "--verbose",
            ]
        );
    }

    #[test]
    fn test_extra_flags_then_dry_run() {
        let mut config = TransferConfig::default();
        config.extra_flags = vec!["--fast-list".to_string(), "--checkers=16".to_string()];
        let args = build_transfer_args(&config, &request(true));

        let tail: Vec<&str> = args[args.len() - 3..].iter().map(String::as_str).collect();
        assert_eq!(tail, vec!["--fast-list", "--checkers=16", "--dry-run"]);
    }

    #[test]
    fn test_local_command_uses_binary() {
        let config = TransferConfig::default().with_binary("/opt/rclone");
        let command = build_command(&config, &request(false));
        assert_eq!(command.program, PathBuf::from("/opt/rclone"));
        assert_eq!(command.args[0], "copy");
    }

    #[test]
    fn test_ssh_explicit_wrapping() {
        let config = TransferConfig::default().with_ssh(SshConfig {
            mode: SshMode::Explicit,
            host: "seedbox.example.net".to_string(),
            user: Some("sync".to_string()),
            key_path: Some(PathBuf::from("/home/sync/.ssh/id_ed25519")),
        });
        let command = build_command(&config, &request(false));

        assert_eq!(command.program, PathBuf::from("ssh"));
        assert_eq!(command.args[0], "-i");
        assert_eq!(command.args[1], "/home/sync/.ssh/id_ed25519");
        assert_eq!(command.args[2], "sync@seedbox.example.net");
        assert!(command.args[3].starts_with("rclone copy /srv/media gdrive:Backup "));
        assert_eq!(command.args.len(), 4);
    }

    #[test]
    fn test_remote_credentials_only_over_ssh() {
        let local = build_transfer_args(&TransferConfig::default(), &request(false));
        assert!(local.contains(&"--drive-service-account-file=/keys/master.json".to_string()));

        let config = TransferConfig::default().with_ssh(SshConfig {
            host: "seedbox".to_string(),
            ..SshConfig::default()
        });
        let remote = build_transfer_args(&config, &request(false));
        assert!(remote
            .contains(&"--drive-service-account-file=/home/sync/keys/master.json".to_string()));
    }

    #[test]
    fn test_ssh_alias_ignores_user_and_key() {
        let config = TransferConfig::default().with_ssh(SshConfig {
            mode: SshMode::Alias,
            host: "seedbox".to_string(),
            user: Some("ignored".to_string()),
            key_path: Some(PathBuf::from("/ignored")),
        });
        let command = build_command(&config, &request(false));

        assert_eq!(command.args[0], "seedbox");
        assert_eq!(command.args.len(), 2);
    }

    #[test]
    fn test_remote_command_quotes_spaces() {
        let config = TransferConfig::default().with_ssh(SshConfig {
            host: "seedbox".to_string(),
            ..SshConfig::default()
        });
        let mut req = request(false);
        req.source = "/srv/My Media".to_string();
        let command = build_command(&config, &req);

        assert!(command.args[1].contains("'/srv/My Media'"));
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain-arg_1.txt"), "plain-arg_1.txt");
        assert_eq!(shell_quote("--stats=1s"), "--stats=1s");
        assert_eq!(shell_quote("two words"), "'two words'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }
}
