//! Per-call notification options

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Notification policy supplied with every alert update
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Explicit channel subset (empty = every default channel)
    pub channels: Vec<String>,

    /// Update state without notifying
    pub quiet: bool,

    /// Re-notify every N consecutive calls at an unchanged level
    pub repeat: Option<u64>,

    /// Alias of `repeat`
    pub resend: Option<u64>,

    /// Extra key/value pairs attached to the message
    pub fields: BTreeMap<String, String>,

    /// Image URL attached to the message
    pub image: Option<String>,

    /// Consecutive error count -> channels to escalate to
    pub escalate: BTreeMap<i64, Vec<String>>,
}

impl Options {
    /// Reject inconsistent option combinations
    pub fn validate(&self) -> Result<()> {
        if self.repeat.is_some() && self.resend.is_some() {
            return Err(Error::validation(
                "options 'repeat' and 'resend' are aliases and cannot both be set",
            ));
        }
        Ok(())
    }

    /// Effective reminder interval, 0 when reminders are off
    pub fn repeat_interval(&self) -> u64 {
        self.repeat.or(self.resend).unwrap_or(0)
    }

    /// Options targeting only the given channels
    pub fn for_channels(channels: Vec<String>) -> Self {
        Self {
            channels,
            ..Self::default()
        }
    }
}
