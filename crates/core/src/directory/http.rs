//! Directory client for an Admin-Directory style REST API.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde_json::{json, Value};
use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::{DirectoryClient, DirectoryConfig, DirectoryError};
use crate::config::DomainProfile;

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// HTTP directory client.
///
/// Bearer tokens come from the configured token command and are cached per
/// (admin, credentials) pair until `token_ttl_secs` elapses or the API
/// answers 401.
pub struct HttpDirectoryClient {
    client: Client,
    config: DirectoryConfig,
    tokens: Arc<RwLock<HashMap<String, CachedToken>>>,
}

impl HttpDirectoryClient {
    pub fn new(config: DirectoryConfig) -> Result<Self, DirectoryError> {
        let client = Client::builder()
            .timeout(config.call_timeout())
            .build()
            .map_err(|e| DirectoryError::Other(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            config,
            tokens: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    fn base_url(&self) -> &str {
        self.config.api_base.trim_end_matches('/')
    }

    fn users_url(&self) -> String {
        format!("{}/admin/directory/v1/users", self.base_url())
    }

    fn user_url(&self, handle: &str) -> String {
        format!("{}/{}", self.users_url(), urlencoding::encode(handle))
    }

    fn members_url(&self, group: &str) -> String {
        format!(
            "{}/admin/directory/v1/groups/{}/members",
            self.base_url(),
            urlencoding::encode(group)
        )
    }

    fn token_key(profile: &DomainProfile) -> String {
        format!("{}|{}", profile.admin, profile.credentials_path.display())
    }

    async fn token(&self, profile: &DomainProfile) -> Result<String, DirectoryError> {
        let key = Self::token_key(profile);

        {
            let tokens = self.tokens.read().await;
            if let Some(cached) = tokens.get(&key) {
                if cached.expires_at > Instant::now() {
                    return Ok(cached.value.clone());
                }
            }
        }

        let value = self.mint_token(profile).await?;
        let mut tokens = self.tokens.write().await;
        tokens.insert(
            key,
            CachedToken {
                value: value.clone(),
                expires_at: Instant::now() + Duration::from_secs(self.config.token_ttl_secs),
            },
        );
        Ok(value)
    }

    async fn invalidate_token(&self, profile: &DomainProfile) {
        let mut tokens = self.tokens.write().await;
        tokens.remove(&Self::token_key(profile));
    }

    async fn mint_token(&self, profile: &DomainProfile) -> Result<String, DirectoryError> {
        let args = token_command_args(&self.config.token_command, profile);
        let (program, rest) = args.split_first().ok_or_else(|| {
            DirectoryError::Auth("directory.token_command is not configured".to_string())
        })?;

        debug!(program = %program, admin = %profile.admin, "Minting directory token");

        let output = tokio::time::timeout(
            self.config.call_timeout(),
            Command::new(program).args(rest).kill_on_drop(true).output(),
        )
        .await
        .map_err(|_| DirectoryError::Timeout(self.config.call_timeout_secs))?
        .map_err(|e| DirectoryError::Auth(format!("failed to run token command: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DirectoryError::Auth(format!(
                "token command exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if token.is_empty() {
            return Err(DirectoryError::Auth(
                "token command printed no token".to_string(),
            ));
        }
        Ok(token)
    }

    /// Send an authenticated request, refreshing the token once on 401.
    async fn send(
        &self,
        profile: &DomainProfile,
        method: Method,
        url: &str,
        body: Option<Value>,
    ) -> Result<(), DirectoryError> {
        let mut refreshed = false;
        loop {
            let token = self.token(profile).await?;
            let mut request = self.client.request(method.clone(), url).bearer_auth(&token);
            if let Some(ref body) = body {
                request = request.json(body);
            }

            let response = request
                .send()
                .await
                .map_err(|e| map_transport_error(e, self.config.call_timeout_secs))?;

            let status = response.status();
            if status.is_success() {
                return Ok(());
            }

            let text = response.text().await.unwrap_or_default();
            if status == StatusCode::UNAUTHORIZED && !refreshed {
                warn!(admin = %profile.admin, "Directory token rejected, minting a new one");
                self.invalidate_token(profile).await;
                refreshed = true;
                continue;
            }

            return Err(map_status(status, &text));
        }
    }
}

/// Substitute `{credentials}` and `{admin}` in the token command.
fn token_command_args(template: &[String], profile: &DomainProfile) -> Vec<String> {
    let credentials = profile.credentials_path.display().to_string();
    template
        .iter()
        .map(|arg| {
            arg.replace("{credentials}", &credentials)
                .replace("{admin}", &profile.admin)
        })
        .collect()
}

fn map_transport_error(e: reqwest::Error, timeout_secs: u64) -> DirectoryError {
    if e.is_timeout() {
        DirectoryError::Timeout(timeout_secs)
    } else if e.is_connect() || e.is_request() {
        DirectoryError::Unavailable(e.to_string())
    } else {
        DirectoryError::Other(e.to_string())
    }
}

fn map_status(status: StatusCode, body: &str) -> DirectoryError {
    let snippet: String = body.chars().take(200).collect();
    let detail = format!("HTTP {}: {}", status.as_u16(), snippet);

    // Rate limits also come back as 403 with a reason such as
    // "rateLimitExceeded" or "userRateLimitExceeded" in the body.
    let reason = body.to_ascii_lowercase();
    if status == StatusCode::TOO_MANY_REQUESTS
        || (status == StatusCode::FORBIDDEN
            && (reason.contains("ratelimitexceeded") || reason.contains("quotaexceeded")))
    {
        return DirectoryError::RateLimited(detail);
    }

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => DirectoryError::Auth(detail),
        StatusCode::NOT_FOUND => DirectoryError::NotFound(detail),
        StatusCode::CONFLICT => DirectoryError::AlreadyExists(detail),
        s if s.is_server_error() => DirectoryError::Unavailable(detail),
        _ => DirectoryError::Other(detail),
    }
}

/// "ada.lovelace.1a2b@example.com" -> ("Ada", "Lovelace").
fn names_from_handle(handle: &str) -> (String, String) {
    let local = handle.split('@').next().unwrap_or(handle);
    let mut parts = local.split('.').filter(|p| !p.is_empty());
    let given = parts.next().map(capitalize).unwrap_or_else(|| "Transfer".to_string());
    let family = parts.next().map(capitalize).unwrap_or_else(|| "Account".to_string());
    (given, family)
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[async_trait]
impl DirectoryClient for HttpDirectoryClient {
    fn name(&self) -> &str {
        "http"
    }

    async fn create_account(
        &self,
        profile: &DomainProfile,
        handle: &str,
    ) -> Result<String, DirectoryError> {
        let (given, family) = names_from_handle(handle);
        let body = json!({
            "primaryEmail": handle,
            "name": { "givenName": given, "familyName": family },
            "password": format!("{}Aa1!", uuid::Uuid::new_v4().simple()),
            "changePasswordAtNextLogin": false,
        });

        self.send(profile, Method::POST, &self.users_url(), Some(body))
            .await?;
        Ok(handle.to_string())
    }

    async fn delete_account(
        &self,
        profile: &DomainProfile,
        handle: &str,
    ) -> Result<(), DirectoryError> {
        self.send(profile, Method::DELETE, &self.user_url(handle), None)
            .await
    }

    async fn add_member(
        &self,
        profile: &DomainProfile,
        group: &str,
        handle: &str,
    ) -> Result<(), DirectoryError> {
        let body = json!({ "email": handle, "role": "MEMBER" });
        self.send(profile, Method::POST, &self.members_url(group), Some(body))
            .await
    }

    async fn remove_member(
        &self,
        profile: &DomainProfile,
        group: &str,
        handle: &str,
    ) -> Result<(), DirectoryError> {
        let url = format!("{}/{}", self.members_url(group), urlencoding::encode(handle));
        self.send(profile, Method::DELETE, &url, None).await
    }

    async fn check_connection(&self, profile: &DomainProfile) -> Result<(), DirectoryError> {
        let url = format!(
            "{}?domain={}&maxResults=1",
            self.users_url(),
            urlencoding::encode(&profile.name)
        );
        self.send(profile, Method::GET, &url, None).await
    }
}
