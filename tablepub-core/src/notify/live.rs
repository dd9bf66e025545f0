//! Live channel transports.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::Value;
use sha2::Sha256;
use tokio::sync::broadcast;
use tracing::debug;

use super::{LiveChannel, LiveEvent};
use crate::config::LiveConfig;
use crate::error::NotifyError;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the `sha256=<hex>` signature of a webhook body.
pub const SIGNATURE_HEADER: &str = "X-Tablepub-Signature";

/// A live event addressed to one channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveMessage {
    pub channel: String,
    pub event: String,
    pub payload: Value,
}

impl LiveMessage {
    fn new(channel_id: &str, event: &LiveEvent) -> Self {
        Self {
            channel: channel_id.to_string(),
            event: event.name().to_string(),
            payload: event.payload(),
        }
    }
}

/// In-process hub; subscribers filter messages by channel.
#[derive(Debug, Clone)]
pub struct BroadcastHub {
    tx: broadcast::Sender<LiveMessage>,
}

impl BroadcastHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LiveMessage> {
        self.tx.subscribe()
    }

    /// Send to every subscriber. Returns the number that will receive it.
    pub fn send(&self, message: LiveMessage) -> usize {
        self.tx.send(message).unwrap_or(0)
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl LiveChannel for BroadcastHub {
    async fn push(&self, channel_id: &str, event: &LiveEvent) -> Result<(), NotifyError> {
        let receivers = self.send(LiveMessage::new(channel_id, event));
        debug!(channel_id, receivers, "Live event sent to hub");
        Ok(())
    }
}

/// Posts live events to an HTTP endpoint, optionally signed.
pub struct WebhookLiveChannel {
    client: reqwest::Client,
    url: String,
    secret: Option<String>,
}

impl WebhookLiveChannel {
    pub fn new(config: &LiveConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: config.webhook_url.clone(),
            secret: config.secret.clone(),
        }
    }
}

/// HMAC-SHA256 of `body` under `secret`, hex-encoded.
pub fn sign(secret: &str, body: &[u8]) -> Result<String, NotifyError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|e| NotifyError::Live {
        channel: String::new(),
        message: format!("invalid signing key: {e}"),
    })?;
    mac.update(body);
    Ok(mac
        .finalize()
        .into_bytes()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect())
}

#[async_trait]
impl LiveChannel for WebhookLiveChannel {
    async fn push(&self, channel_id: &str, event: &LiveEvent) -> Result<(), NotifyError> {
        let failed = |message: String| NotifyError::Live {
            channel: channel_id.to_string(),
            message,
        };
        let body = serde_json::to_vec(&LiveMessage::new(channel_id, event))
            .map_err(|e| failed(e.to_string()))?;

        let mut request = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json");
        if let Some(secret) = &self.secret {
            request = request.header(SIGNATURE_HEADER, format!("sha256={}", sign(secret, &body)?));
        }

        let resp = request
            .body(body)
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(failed(format!("endpoint returned {}", resp.status())));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hub_delivers_to_subscriber() {
        let hub = BroadcastHub::default();
        let mut rx = hub.subscribe();
        hub.push(
            "chan-7",
            &LiveEvent::DatasetFailed {
                messages: vec!["nope".into()],
            },
        )
        .await
        .unwrap();
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.channel, "chan-7");
        assert_eq!(msg.event, "dataset_failed");
        assert_eq!(msg.payload, serde_json::json!(["nope"]));
    }

    #[tokio::test]
    async fn test_hub_without_subscribers_is_ok() {
        let hub = BroadcastHub::new(4);
        let result = hub
            .push("chan", &LiveEvent::DatasetFailed { messages: vec![] })
            .await;
        assert!(result.is_ok());
    }

    #[test]
    fn test_sign_known_vector() {
        // RFC 4231 test case 2.
        let sig = sign("Jefe", b"what do ya want for nothing?").unwrap();
        assert_eq!(
            sig,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }
}
