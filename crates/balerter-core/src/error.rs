//! Error types for Balerter

use std::time::Duration;

use thiserror::Error;

/// Result type alias using Balerter's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for Balerter operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unknown level token or code
    #[error("bad level value: {0}")]
    BadLevel(String),

    /// Not found error
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of the missing thing
        entity: String,
        /// Key it was looked up by
        id: String,
    },

    /// KV insert for a key that is already stored
    #[error("key already exists: {0}")]
    KeyExists(String),

    /// Storage call exceeded its deadline
    #[error("storage operation timed out after {0:?}")]
    Timeout(Duration),

    /// Notification could not be routed to any channel
    #[error("no channels to send notification")]
    NoChannels,

    /// Malformed binary alert blob
    #[error("Decode error: {0}")]
    Decode(String),

    /// Error wrapped with the operation that produced it
    #[error("{context}: {source}")]
    Context {
        /// Operation that failed
        context: String,
        /// Underlying error
        #[source]
        source: Box<Error>,
    },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Create a not found error
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Wrap this error with the operation that failed
    #[must_use]
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping any context wrappers
    pub fn root(&self) -> &Error {
        match self {
            Self::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether the error was caused by caller input rather than a backend failure
    pub fn is_validation(&self) -> bool {
        matches!(
            self.root(),
            Self::Validation(_) | Self::BadLevel(_)
        )
    }
}
