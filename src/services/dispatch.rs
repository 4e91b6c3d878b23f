use crate::config::Config;
use crate::domain::ReleaseId;
use crate::models::{DeliveryOutcome, Release};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub release_id: ReleaseId,
    pub channel: String,
    pub outcome: DeliveryOutcome,
}

impl DeliveryReport {
    #[must_use]
    pub fn delivered(release_id: ReleaseId, channel: &str) -> Self {
        Self {
            release_id,
            channel: channel.to_string(),
            outcome: DeliveryOutcome::Delivered,
        }
    }

    #[must_use]
    pub fn failed(release_id: ReleaseId, channel: &str, detail: impl Into<String>) -> Self {
        Self {
            release_id,
            channel: channel.to_string(),
            outcome: DeliveryOutcome::Failed(detail.into()),
        }
    }
}

/// A failure that prevented the whole batch from being handed over.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("channel unreachable: {0}")]
    Unreachable(String),

    #[error("channel rejected batch with status {status}")]
    Rejected { status: u16 },
}

/// Outbound notification channel.
///
/// Implementations report an outcome per release they attempted. A release
/// missing from the returned reports is treated as failed by the scheduler,
/// and deliveries already on record are filtered out before `dispatch` is
/// called, so an adapter never has to deduplicate itself.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    fn channel(&self) -> &str;

    async fn dispatch(&self, releases: &[Release]) -> Result<Vec<DeliveryReport>, DispatchError>;
}

/// Writes each release as a structured log line.
#[derive(Debug, Default)]
pub struct LogDispatcher;

#[async_trait]
impl NotificationDispatcher for LogDispatcher {
    fn channel(&self) -> &str {
        "log"
    }

    async fn dispatch(&self, releases: &[Release]) -> Result<Vec<DeliveryReport>, DispatchError> {
        Ok(releases
            .iter()
            .map(|release| {
                info!(
                    event = "release_announced",
                    release_id = %release.id,
                    work = %release.work_title,
                    kind = %release.kind,
                    label = %release.label,
                    channel = %release.channel,
                    date = %release.date,
                    "{}",
                    release.headline()
                );
                DeliveryReport::delivered(release.id, self.channel())
            })
            .collect())
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    count: usize,
    releases: Vec<WebhookRelease<'a>>,
}

#[derive(Serialize)]
struct WebhookRelease<'a> {
    #[serde(flatten)]
    release: &'a Release,
    headline: String,
}

/// Posts the batch as one JSON document. The endpoint either accepts the
/// whole batch or the whole batch fails.
pub struct WebhookDispatcher {
    client: Client,
    url: String,
}

impl WebhookDispatcher {
    #[must_use]
    pub fn new(url: &str, user_agent: &str, timeout: Duration) -> Self {
        Self {
            client: Client::builder()
                .user_agent(user_agent)
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| Client::new()),
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl NotificationDispatcher for WebhookDispatcher {
    fn channel(&self) -> &str {
        "webhook"
    }

    async fn dispatch(&self, releases: &[Release]) -> Result<Vec<DeliveryReport>, DispatchError> {
        let payload = WebhookPayload {
            count: releases.len(),
            releases: releases
                .iter()
                .map(|release| WebhookRelease {
                    release,
                    headline: release.headline(),
                })
                .collect(),
        };

        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| DispatchError::Unreachable(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(DispatchError::Unreachable(format!("status {status}")));
        }
        if !status.is_success() {
            return Err(DispatchError::Rejected {
                status: status.as_u16(),
            });
        }

        Ok(releases
            .iter()
            .map(|r| DeliveryReport::delivered(r.id, self.channel()))
            .collect())
    }
}

/// One dispatcher per configured channel, in configured order.
pub fn build_dispatchers(config: &Config) -> anyhow::Result<Vec<Arc<dyn NotificationDispatcher>>> {
    let mut dispatchers: Vec<Arc<dyn NotificationDispatcher>> = Vec::new();
    for channel in &config.notifications.channels {
        match channel.as_str() {
            "log" => dispatchers.push(Arc::new(LogDispatcher)),
            "webhook" => {
                let Some(url) = config.notifications.webhook_url.as_deref() else {
                    anyhow::bail!("notifications.webhook_url is required for the webhook channel");
                };
                dispatchers.push(Arc::new(WebhookDispatcher::new(
                    url,
                    &config.collection.user_agent,
                    Duration::from_secs(30),
                )));
            }
            other => anyhow::bail!("Unknown notification channel '{other}'"),
        }
    }
    Ok(dispatchers)
}
