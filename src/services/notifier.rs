use crate::models::StatusChange;
use anyhow::{Context, Result};
use std::time::Duration;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 1024;
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Fan-out of committed lifecycle transitions.
#[derive(Clone)]
pub struct StatusNotifier {
    sender: broadcast::Sender<StatusChange>,
}

impl Default for StatusNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusNotifier {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.sender.subscribe()
    }

    pub fn notify(&self, change: StatusChange) {
        if change.reversal {
            tracing::warn!(
                payment_id = %change.payment_id,
                order_ref = %change.order_ref,
                "Settled payment retracted by chain reorganization"
            );
        }
        // No subscribers is fine
        let _ = self.sender.send(change);
    }
}

/// Forwards every status change to an HTTP endpoint as JSON.
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: String) -> Result<Self> {
        Self::with_timeout(url, WEBHOOK_TIMEOUT)
    }

    /// `timeout` bounds each delivery, connect included.
    pub fn with_timeout(url: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build webhook HTTP client")?;
        Ok(Self { url, client })
    }

    pub async fn deliver(&self, change: &StatusChange) -> Result<()> {
        let response = self.client.post(&self.url).json(change).send().await?;

        if response.status().is_success() {
            tracing::debug!(payment_id = %change.payment_id, "Status change delivered to webhook");
        } else {
            tracing::warn!(
                payment_id = %change.payment_id,
                status = %response.status(),
                "Webhook rejected status change"
            );
        }

        Ok(())
    }

    /// Delivers changes until the notifier is dropped. Delivery failures are
    /// logged and never affect payment state.
    pub async fn run(self, mut receiver: broadcast::Receiver<StatusChange>) {
        tracing::info!("Forwarding status changes to {}", self.url);
        loop {
            match receiver.recv().await {
                Ok(change) => {
                    if let Err(e) = self.deliver(&change).await {
                        tracing::error!(payment_id = %change.payment_id, "Webhook delivery failed: {}", e);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Webhook forwarder lagged, {} status changes skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}
