use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;

use super::{Notifier, NotifyConfig, NotifyError};

/// Posts messages to a Discord or Slack incoming webhook.
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    /// `None` when no webhook URL is configured.
    pub fn from_config(config: &NotifyConfig) -> Result<Option<Self>, NotifyError> {
        match config.webhook_url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => Ok(Some(Self::new(url)?)),
            _ => Ok(None),
        }
    }

    pub fn new(url: impl Into<String>) -> Result<Self, NotifyError> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    fn is_slack(&self) -> bool {
        self.url.contains("hooks.slack.com")
    }

    fn payload(&self, message: &str) -> Value {
        let text = format!("[isync] {}", message);
        if self.is_slack() {
            json!({ "text": text })
        } else {
            json!({ "content": text })
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, message: &str) -> Result<(), NotifyError> {
        debug!(message, "Sending webhook notification");
        let response = self
            .client
            .post(&self.url)
            .json(&self.payload(message))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(NotifyError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discord_payload() {
        let notifier = WebhookNotifier::new("https://discord.com/api/webhooks/1/abc").unwrap();
        let payload = notifier.payload("job started");
        assert_eq!(payload["content"], "[isync] job started");
        assert!(payload.get("text").is_none());
    }

    #[test]
    fn test_slack_payload() {
        let notifier =
            WebhookNotifier::new("https://hooks.slack.com/services/T0/B0/xyz").unwrap();
        let payload = notifier.payload("job failed");
        assert_eq!(payload["text"], "[isync] job failed");
    }

    #[test]
    fn test_unset_or_blank_url_disables() {
        assert!(WebhookNotifier::from_config(&NotifyConfig::default())
            .unwrap()
            .is_none());
        let blank = NotifyConfig {
            webhook_url: Some("  ".to_string()),
        };
        assert!(WebhookNotifier::from_config(&blank).unwrap().is_none());
    }
}
