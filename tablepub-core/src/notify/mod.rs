//! Outcome delivery: live channel pushes, success emails and announcements.
//!
//! The [`Notifier`] fans out to whichever collaborators are configured. Live
//! pushes are fire-and-forget. Email and announcement failures are logged and
//! do not undo a completed publish.

mod announce;
mod email;
mod live;

pub use announce::WebhookAnnouncer;
pub use email::SmtpMailer;
pub use live::{BroadcastHub, LiveMessage, WebhookLiveChannel};

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::dataset::Dataset;
use crate::error::NotifyError;

/// An event pushed to a live channel.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveEvent {
    /// Carries the dataset's serialized representation.
    DatasetCreated { dataset: Value },
    DatasetFailed { messages: Vec<String> },
}

impl LiveEvent {
    pub fn created(dataset: &Dataset) -> Self {
        let dataset = serde_json::to_value(dataset).unwrap_or_else(|e| {
            warn!(dataset_id = %dataset.id, error = %e, "Dataset did not serialize");
            Value::Null
        });
        LiveEvent::DatasetCreated { dataset }
    }

    pub fn name(&self) -> &'static str {
        match self {
            LiveEvent::DatasetCreated { .. } => "dataset_created",
            LiveEvent::DatasetFailed { .. } => "dataset_failed",
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            LiveEvent::DatasetCreated { dataset } => dataset.clone(),
            LiveEvent::DatasetFailed { messages } => serde_json::json!(messages),
        }
    }
}

/// Push destination for live events, addressed by channel id.
#[async_trait]
pub trait LiveChannel: Send + Sync {
    async fn push(&self, channel_id: &str, event: &LiveEvent) -> Result<(), NotifyError>;
}

/// Sends the "your dataset is published" email.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_success(&self, dataset: &Dataset) -> Result<(), NotifyError>;
}

/// Announces a newly published dataset on social media.
#[async_trait]
pub trait Announcer: Send + Sync {
    async fn announce(&self, dataset: &Dataset) -> Result<(), NotifyError>;
}

/// Fan-out over the configured notification collaborators.
#[derive(Clone)]
pub struct Notifier {
    live: Arc<dyn LiveChannel>,
    mailer: Option<Arc<dyn Mailer>>,
    announcer: Option<Arc<dyn Announcer>>,
}

impl Notifier {
    pub fn new(live: Arc<dyn LiveChannel>) -> Self {
        Self {
            live,
            mailer: None,
            announcer: None,
        }
    }

    pub fn with_mailer(mut self, mailer: Arc<dyn Mailer>) -> Self {
        self.mailer = Some(mailer);
        self
    }

    pub fn with_announcer(mut self, announcer: Arc<dyn Announcer>) -> Self {
        self.announcer = Some(announcer);
        self
    }

    /// Push `event` to `channel_id`. Delivery failures are logged only.
    pub async fn broadcast(&self, channel_id: &str, event: LiveEvent) {
        debug!(channel_id, event = event.name(), "Broadcasting live event");
        if let Err(e) = self.live.push(channel_id, &event).await {
            warn!(channel_id, event = event.name(), error = %e, "Live event not delivered");
        }
    }

    pub async fn success_email(&self, dataset: &Dataset) {
        let Some(mailer) = &self.mailer else {
            debug!(dataset_id = %dataset.id, "No mailer configured");
            return;
        };
        match mailer.send_success(dataset).await {
            Ok(()) => info!(dataset_id = %dataset.id, "Success email sent"),
            Err(e) => warn!(dataset_id = %dataset.id, error = %e, "Success email failed"),
        }
    }

    /// Announce a published dataset; restricted datasets are never announced.
    pub async fn announce(&self, dataset: &Dataset) {
        if dataset.restricted() {
            debug!(dataset_id = %dataset.id, "Skipping announcement for restricted dataset");
            return;
        }
        let Some(announcer) = &self.announcer else {
            return;
        };
        match announcer.announce(dataset).await {
            Ok(()) => info!(dataset_id = %dataset.id, "Dataset announced"),
            Err(e) => warn!(dataset_id = %dataset.id, error = %e, "Announcement failed"),
        }
    }
}

/// Text of the announcement for `dataset`.
pub fn announcement_text(dataset: &Dataset) -> String {
    let who = match dataset.user.twitter_handle.as_deref() {
        Some(handle) if !handle.is_empty() => format!("@{}", handle.trim_start_matches('@')),
        _ => dataset.user.login.clone(),
    };
    format!(
        "{who} just published {}: {}",
        dataset.name(),
        dataset.gh_pages_url()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{DatasetMetadata, PublishingMethod, User};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        pushes: Mutex<Vec<(String, &'static str)>>,
        announced: Mutex<usize>,
        fail: bool,
    }

    #[async_trait]
    impl LiveChannel for Recording {
        async fn push(&self, channel_id: &str, event: &LiveEvent) -> Result<(), NotifyError> {
            self.pushes
                .lock()
                .unwrap()
                .push((channel_id.to_string(), event.name()));
            if self.fail {
                return Err(NotifyError::Live {
                    channel: channel_id.into(),
                    message: "down".into(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Announcer for Recording {
        async fn announce(&self, _dataset: &Dataset) -> Result<(), NotifyError> {
            *self.announced.lock().unwrap() += 1;
            Ok(())
        }
    }

    fn dataset(method: PublishingMethod) -> Dataset {
        Dataset::new(
            DatasetMetadata {
                name: "Cats".into(),
                publishing_method: method,
                ..Default::default()
            },
            User::new("alice"),
        )
    }

    #[test]
    fn test_event_names_and_payloads() {
        let failed = LiveEvent::DatasetFailed {
            messages: vec!["bad".into()],
        };
        assert_eq!(failed.name(), "dataset_failed");
        assert_eq!(failed.payload(), serde_json::json!(["bad"]));

        let created = LiveEvent::created(&dataset(PublishingMethod::GithubPublic));
        assert_eq!(created.name(), "dataset_created");
        assert_eq!(created.payload()["name"], "Cats");
    }

    #[tokio::test]
    async fn test_broadcast_swallows_delivery_failure() {
        let live = Arc::new(Recording {
            fail: true,
            ..Default::default()
        });
        let notifier = Notifier::new(live.clone());
        notifier
            .broadcast("chan-1", LiveEvent::DatasetFailed { messages: vec![] })
            .await;
        assert_eq!(live.pushes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_announce_skips_restricted() {
        let rec = Arc::new(Recording::default());
        let notifier = Notifier::new(rec.clone()).with_announcer(rec.clone());
        notifier.announce(&dataset(PublishingMethod::GithubPrivate)).await;
        assert_eq!(*rec.announced.lock().unwrap(), 0);
        notifier.announce(&dataset(PublishingMethod::GithubPublic)).await;
        assert_eq!(*rec.announced.lock().unwrap(), 1);
    }

    #[test]
    fn test_announcement_text() {
        let mut ds = dataset(PublishingMethod::GithubPublic);
        assert_eq!(
            announcement_text(&ds),
            "alice just published Cats: http://alice.github.io/cats"
        );
        ds.user.twitter_handle = Some("@alice_t".into());
        assert!(announcement_text(&ds).starts_with("@alice_t just published"));
    }
}
