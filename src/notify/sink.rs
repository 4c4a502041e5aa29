use super::NotifyError;
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use std::time::Duration;
use tracing::debug;

/// Destination for human-readable alert messages
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, message: &str) -> Result<(), NotifyError>;
}

/// Posts messages to a Slack incoming webhook
pub struct SlackSink {
    client: reqwest::Client,
    webhook_url: SecretString,
}

impl std::fmt::Debug for SlackSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlackSink")
            .field("client", &"<reqwest::Client>")
            .finish_non_exhaustive()
    }
}

impl SlackSink {
    pub fn new(webhook_url: SecretString, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotifyError::Sink(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            webhook_url,
        })
    }
}

#[async_trait]
impl NotificationSink for SlackSink {
    async fn send(&self, message: &str) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(self.webhook_url.expose_secret().as_str())
            .json(&json!({ "text": message }))
            .send()
            .await
            .map_err(|e| NotifyError::Sink(format!("slack request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(NotifyError::Sink(format!(
                "slack webhook returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Logs messages when no sink is configured
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn send(&self, message: &str) -> Result<(), NotifyError> {
        debug!(message, "rate limit alert");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_slack_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_json(json!({ "text": "hello" })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let sink = SlackSink::new(SecretString::new(server.uri()), Duration::from_secs(5)).unwrap();
        sink.send("hello").await.unwrap();
    }

    #[tokio::test]
    async fn test_slack_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let sink = SlackSink::new(SecretString::new(server.uri()), Duration::from_secs(5)).unwrap();
        assert!(matches!(sink.send("hello").await, Err(NotifyError::Sink(_))));
    }
}
