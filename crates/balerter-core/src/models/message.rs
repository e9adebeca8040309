//! Notification message delivered to channels

use std::collections::BTreeMap;

use serde::Serialize;

use super::alert::Level;

/// A notification rendered for a single channel send
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    /// Alert level at the time of the notification
    pub level: Level,
    /// Name of the alert
    pub alert_name: String,
    /// Human-readable text supplied by the caller
    pub text: String,
    /// Extra key/value pairs
    pub fields: BTreeMap<String, String>,
    /// Optional image URL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl Message {
    /// Build a message without fields or image
    pub fn new(level: Level, alert_name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            level,
            alert_name: alert_name.into(),
            text: text.into(),
            fields: BTreeMap::new(),
            image: None,
        }
    }
}
