//! Social announcements posted to a webhook.

use async_trait::async_trait;
use serde_json::json;

use super::{announcement_text, Announcer};
use crate::config::AnnounceConfig;
use crate::dataset::Dataset;
use crate::error::NotifyError;

pub struct WebhookAnnouncer {
    client: reqwest::Client,
    url: String,
}

impl WebhookAnnouncer {
    pub fn new(config: &AnnounceConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: config.webhook_url.clone(),
        }
    }
}

#[async_trait]
impl Announcer for WebhookAnnouncer {
    async fn announce(&self, dataset: &Dataset) -> Result<(), NotifyError> {
        let body = json!({
            "text": announcement_text(dataset),
            "url": dataset.gh_pages_url(),
            "dataset_id": dataset.id,
        });
        let resp = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| NotifyError::Announce {
                message: e.to_string(),
            })?;
        if !resp.status().is_success() {
            return Err(NotifyError::Announce {
                message: format!("endpoint returned {}", resp.status()),
            });
        }
        Ok(())
    }
}
