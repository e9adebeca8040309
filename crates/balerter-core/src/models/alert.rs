//! Alert data models

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};

use crate::error::{Error, Result};

/// Count of a freshly created alert
pub const INITIAL_COUNT: i64 = 1;

/// Count right after a level transition
pub const TRANSITION_COUNT: i64 = 0;

/// Alert severity level
///
/// Levels carry no ordering: a change is detected by inequality only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    /// Condition is healthy
    Success,
    /// Condition is degraded
    #[serde(alias = "warning")]
    Warn,
    /// Condition is failing
    Error,
}

impl Level {
    /// All levels, in code order
    pub const ALL: [Level; 3] = [Level::Success, Level::Warn, Level::Error];

    /// Numeric code used in storage and metrics
    pub fn code(self) -> i64 {
        match self {
            Level::Success => 1,
            Level::Warn => 2,
            Level::Error => 3,
        }
    }

    /// Display token
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Success => "success",
            Level::Warn => "warn",
            Level::Error => "error",
        }
    }

    /// Parse a comma separated list of level tokens, ignoring empty items
    pub fn parse_list(s: &str) -> Result<Vec<Level>> {
        s.split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::parse)
            .collect()
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Level {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "success" => Ok(Level::Success),
            "warn" | "warning" => Ok(Level::Warn),
            "error" => Ok(Level::Error),
            other => Err(Error::BadLevel(other.to_string())),
        }
    }
}

impl TryFrom<i64> for Level {
    type Error = Error;

    fn try_from(code: i64) -> Result<Self> {
        match code {
            1 => Ok(Level::Success),
            2 => Ok(Level::Warn),
            3 => Ok(Level::Error),
            other => Err(Error::BadLevel(other.to_string())),
        }
    }
}

/// Display text for a raw level code read from storage
pub fn level_name(code: i64) -> Result<&'static str> {
    Level::try_from(code).map(Level::as_str)
}

/// One monitored condition: its level and how long it has been there
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    name: String,
    level: Level,
    count: i64,
    last_change: DateTime<Utc>,
    start: DateTime<Utc>,
}

impl Alert {
    /// Create an alert seen for the first time
    pub fn new(name: impl Into<String>, level: Level, now: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            level,
            count: INITIAL_COUNT,
            last_change: now,
            start: now,
        }
    }

    /// Rebuild an alert from stored fields
    pub fn from_parts(
        name: impl Into<String>,
        level: Level,
        count: i64,
        last_change: DateTime<Utc>,
        start: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            level,
            count,
            last_change,
            start,
        }
    }

    /// Record another observation at `level`; returns whether the level changed
    pub fn apply(&mut self, level: Level, now: DateTime<Utc>) -> bool {
        self.last_change = now;

        if self.level == level {
            self.count += 1;
            return false;
        }

        self.level = level;
        self.count = TRANSITION_COUNT;
        true
    }

    /// Alert name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current level
    pub fn level(&self) -> Level {
        self.level
    }

    /// Consecutive observations at the current level
    pub fn count(&self) -> i64 {
        self.count
    }

    /// Time of the most recent update
    pub fn last_change(&self) -> DateTime<Utc> {
        self.last_change
    }

    /// Time the alert was first created
    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    /// Compact representation for list responses
    pub fn summary(&self) -> AlertSummary {
        AlertSummary {
            name: self.name.clone(),
            level: self.level,
            count: self.count,
            last_change: self.last_change,
            start: self.start,
        }
    }
}

impl Serialize for Alert {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Alert", 6)?;
        state.serialize_field("name", &self.name)?;
        state.serialize_field("level", self.level.as_str())?;
        state.serialize_field("level_num", &self.level.code())?;
        state.serialize_field("count", &self.count)?;
        state.serialize_field("last_change", &self.last_change)?;
        state.serialize_field("start", &self.start)?;
        state.end()
    }
}

/// Alert row for list endpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertSummary {
    /// Alert name
    pub name: String,
    /// Current level
    pub level: Level,
    /// Consecutive observations at the current level
    pub count: i64,
    /// Time of the most recent update
    pub last_change: DateTime<Utc>,
    /// Time the alert was first created
    pub start: DateTime<Utc>,
}
