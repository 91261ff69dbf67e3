use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateKind {
    Welcome,
    PasswordReset,
    OrderConfirmation,
    DownloadLinkReady,
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Failed to reach notification relay: {0}")]
    Transport(String),

    #[error("Notification relay rejected message with status {0}")]
    Rejected(u16),
}

impl From<reqwest::Error> for NotifyError {
    fn from(err: reqwest::Error) -> Self {
        NotifyError::Transport(err.to_string())
    }
}

/// Outbound messages to customers (email in production).
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(
        &self,
        recipient: &str,
        template: TemplateKind,
        payload: Value,
    ) -> Result<(), NotifyError>;
}

#[derive(Serialize)]
struct RelayMessage<'a> {
    to: &'a str,
    template: TemplateKind,
    payload: Value,
}

/// Posts messages to a mail relay as JSON.
pub struct HttpNotifier {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpNotifier {
    pub fn new(endpoint: String, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            api_key,
        }
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn send(
        &self,
        recipient: &str,
        template: TemplateKind,
        payload: Value,
    ) -> Result<(), NotifyError> {
        let mut request = self.client.post(&self.endpoint).json(&RelayMessage {
            to: recipient,
            template,
            payload,
        });
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let res = request.send().await?;
        if res.status().is_success() {
            Ok(())
        } else {
            Err(NotifyError::Rejected(res.status().as_u16()))
        }
    }
}

/// Used when no relay is configured; messages only show up in the logs.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(
        &self,
        recipient: &str,
        template: TemplateKind,
        payload: Value,
    ) -> Result<(), NotifyError> {
        tracing::info!(%recipient, ?template, %payload, "notification (log only)");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn relay_message_shape() {
        let message = RelayMessage {
            to: "reader@example.com",
            template: TemplateKind::DownloadLinkReady,
            payload: json!({"book_title": "Dune"}),
        };
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({
                "to": "reader@example.com",
                "template": "download_link_ready",
                "payload": {"book_title": "Dune"}
            })
        );
    }

    #[tokio::test]
    async fn log_notifier_always_succeeds() {
        let result = LogNotifier
            .send("reader@example.com", TemplateKind::Welcome, json!({}))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn unreachable_relay_is_a_transport_error() {
        let notifier = HttpNotifier::new("http://127.0.0.1:1/send".to_string(), None);
        let result = notifier
            .send("reader@example.com", TemplateKind::OrderConfirmation, json!({}))
            .await;
        assert!(matches!(result, Err(NotifyError::Transport(_))));
    }
}
