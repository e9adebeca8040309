//! Built-in notification channels

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;
use serde::Serialize;
use tracing::{error, info, warn};

use super::notifier::{Channel, NotificationError};
use crate::config::{LogChannelConfig, WebhookChannelConfig};
use crate::models::{Level, Message};

/// Channel writing notifications to the process log
pub struct LogChannel {
    name: String,
    ignore: bool,
}

impl LogChannel {
    /// Create a log channel from its configuration
    pub fn new(config: &LogChannelConfig) -> Self {
        Self {
            name: config.name.clone(),
            ignore: config.ignore,
        }
    }
}

#[async_trait]
impl Channel for LogChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn ignore(&self) -> bool {
        self.ignore
    }

    async fn send(&self, message: &Message) -> Result<(), NotificationError> {
        match message.level {
            Level::Success => info!(
                channel = %self.name,
                alert = %message.alert_name,
                fields = ?message.fields,
                "{}", message.text
            ),
            Level::Warn => warn!(
                channel = %self.name,
                alert = %message.alert_name,
                fields = ?message.fields,
                "{}", message.text
            ),
            Level::Error => error!(
                channel = %self.name,
                alert = %message.alert_name,
                fields = ?message.fields,
                "{}", message.text
            ),
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    alert_name: &'a str,
    level: Level,
    level_num: i64,
    text: &'a str,
    fields: &'a BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<&'a str>,
    sent_at: DateTime<Utc>,
}

/// Channel posting a JSON payload to an HTTP endpoint
pub struct WebhookChannel {
    name: String,
    url: String,
    ignore: bool,
    client: Client,
}

impl WebhookChannel {
    /// Create a webhook channel with its own HTTP client
    pub fn new(config: &WebhookChannelConfig) -> Result<Self, NotificationError> {
        let mut headers = HeaderMap::new();
        for (key, value) in &config.headers {
            let name = HeaderName::from_bytes(key.as_bytes()).map_err(|e| {
                NotificationError::ConfigError(format!("invalid header name '{key}': {e}"))
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| {
                NotificationError::ConfigError(format!("invalid value for header '{key}': {e}"))
            })?;
            headers.insert(name, value);
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| NotificationError::ConfigError(e.to_string()))?;

        Ok(Self {
            name: config.name.clone(),
            url: config.url.clone(),
            ignore: config.ignore,
            client,
        })
    }
}

#[async_trait]
impl Channel for WebhookChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn ignore(&self) -> bool {
        self.ignore
    }

    async fn send(&self, message: &Message) -> Result<(), NotificationError> {
        let payload = WebhookPayload {
            alert_name: &message.alert_name,
            level: message.level,
            level_num: message.level.code(),
            text: &message.text,
            fields: &message.fields,
            image: message.image.as_deref(),
            sent_at: Utc::now(),
        };

        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| NotificationError::HttpError(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(NotificationError::HttpError(format!(
                "Webhook returned {}: {}",
                status, body
            )));
        }

        info!(channel = %self.name, alert = %message.alert_name, "Webhook notification sent");
        Ok(())
    }
}
