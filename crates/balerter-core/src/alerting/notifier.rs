//! Notification dispatch to channels

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use tracing::{debug, error, info, warn};

use super::channels::{LogChannel, WebhookChannel};
use crate::config::ChannelsConfig;
use crate::error::{Error, Result};
use crate::models::{Level, Message, Options};

/// A notification sink
#[async_trait]
pub trait Channel: Send + Sync {
    /// Unique channel name
    fn name(&self) -> &str;

    /// Excluded from the default channel set; reachable only by name
    fn ignore(&self) -> bool {
        false
    }

    /// Deliver one message
    async fn send(&self, message: &Message) -> std::result::Result<(), NotificationError>;
}

/// Result of sending a notification
#[derive(Debug, Clone)]
pub struct NotificationResult {
    /// Channel the notification was sent to
    pub channel: String,
    /// Whether the channel accepted it
    pub success: bool,
    /// Failure description when `success` is false
    pub error: Option<String>,
    /// Time the send started
    pub sent_at: DateTime<Utc>,
}

/// Notification errors
#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    /// Request failed or the endpoint rejected it
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Channel could not be built from its configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Resolves target channels and fans out sends
pub struct Dispatcher {
    channels: Vec<Arc<dyn Channel>>,
}

impl Dispatcher {
    /// Create a dispatcher over the given channels
    pub fn new(channels: Vec<Arc<dyn Channel>>) -> Result<Self> {
        let mut seen = HashSet::new();
        for channel in &channels {
            if !seen.insert(channel.name().to_string()) {
                return Err(Error::config(format!(
                    "duplicate channel name '{}'",
                    channel.name()
                )));
            }
        }
        Ok(Self { channels })
    }

    /// Build every channel declared in configuration
    pub fn from_config(config: &ChannelsConfig) -> Result<Self> {
        let mut channels: Vec<Arc<dyn Channel>> = Vec::new();

        for log in &config.log {
            channels.push(Arc::new(LogChannel::new(log)));
        }
        for webhook in &config.webhook {
            let channel = WebhookChannel::new(webhook).map_err(|e| {
                Error::config(format!("channel '{}': {}", webhook.name, e))
            })?;
            channels.push(Arc::new(channel));
        }

        let dispatcher = Self::new(channels)?;
        info!(channels = ?dispatcher.channel_names(), "Notification channels initialized");
        Ok(dispatcher)
    }

    /// Names of every configured channel
    pub fn channel_names(&self) -> Vec<&str> {
        self.channels.iter().map(|c| c.name()).collect()
    }

    fn resolve(&self, alert_name: &str, requested: &[String]) -> Vec<Arc<dyn Channel>> {
        if requested.is_empty() {
            return self
                .channels
                .iter()
                .filter(|c| !c.ignore())
                .cloned()
                .collect();
        }

        let mut seen = HashSet::new();
        let mut resolved = Vec::with_capacity(requested.len());
        for name in requested {
            if !seen.insert(name.as_str()) {
                continue;
            }
            match self.channels.iter().find(|c| c.name() == name) {
                Some(channel) => resolved.push(channel.clone()),
                None => warn!(alert = %alert_name, channel = %name, "Channel not found, skipping"),
            }
        }
        resolved
    }

    /// Send a notification for an alert to the channels selected by `options`.
    ///
    /// Fails only when no channel could be resolved; individual channel
    /// failures are logged and reported in the returned results.
    pub async fn send(
        &self,
        level: Level,
        alert_name: &str,
        text: &str,
        options: &Options,
    ) -> Result<Vec<NotificationResult>> {
        let channels = self.resolve(alert_name, &options.channels);
        if channels.is_empty() {
            error!(alert = %alert_name, "No channels resolved for notification");
            return Err(Error::NoChannels);
        }

        let message = Message {
            level,
            alert_name: alert_name.to_string(),
            text: text.to_string(),
            fields: options.fields.clone(),
            image: options.image.clone(),
        };

        let sends = channels.iter().map(|channel| {
            let message = &message;
            async move {
                let sent_at = Utc::now();
                let result = channel.send(message).await;

                match &result {
                    Ok(()) => debug!(alert = %alert_name, channel = %channel.name(), "Notification sent"),
                    Err(e) => error!(
                        alert = %alert_name,
                        channel = %channel.name(),
                        error = %e,
                        "Error sending notification"
                    ),
                }

                NotificationResult {
                    channel: channel.name().to_string(),
                    success: result.is_ok(),
                    error: result.err().map(|e| e.to_string()),
                    sent_at,
                }
            }
        });

        Ok(join_all(sends).await)
    }
}
