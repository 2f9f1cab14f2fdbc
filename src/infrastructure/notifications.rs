//! Fire-and-forget Discord webhook notifier. Never blocks the caller and
//! never propagates delivery failures — a dropped notification must not stall
//! the trading loop.

use async_trait::async_trait;
use serde::Serialize;
use tracing::warn;

use crate::domain::ports::Notifier;

#[derive(Serialize)]
struct DiscordPayload<'a> {
    content: &'a str,
}

pub struct DiscordNotifier {
    webhook_url: String,
    client: reqwest::Client,
}

impl DiscordNotifier {
    pub fn new(webhook_url: String) -> Self {
        Self {
            webhook_url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Notifier for DiscordNotifier {
    async fn notify(&self, message: &str) {
        let url = self.webhook_url.clone();
        let client = self.client.clone();
        let payload = DiscordPayload { content: message }.content.to_string();
        tokio::spawn(async move {
            let result = client
                .post(&url)
                .json(&DiscordPayload { content: &payload })
                .send()
                .await;
            if let Err(e) = result {
                warn!(error = %e, "failed to deliver discord notification");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn notify_does_not_panic_on_unreachable_host() {
        let notifier = DiscordNotifier::new("http://127.0.0.1:0/webhook".to_string());
        notifier.notify("test message").await;
    }
}
