use anyhow::Result;
use reqwest::Client;
use serde_json::json;

/// Best-effort webhook notifier for operational events. Formatting beyond
/// a plain content message is owned by the receiving side.
pub struct WebhookNotifier {
    client: Client,
    webhook_url: String,
}

impl WebhookNotifier {
    pub fn new(webhook_url: String) -> Result<Self> {
        Ok(Self {
            client: Client::new(),
            webhook_url,
        })
    }

    pub async fn send_message(&self, content: &str) -> Result<()> {
        if self.webhook_url.is_empty() {
            tracing::debug!("log webhook not configured, skipping notification");
            return Ok(());
        }

        let payload = json!({
            "content": content,
            "username": "Signal Agent",
        });

        self.client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await?;

        tracing::debug!("webhook notification sent");
        Ok(())
    }
}
