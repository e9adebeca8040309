//! # Balerter
//!
//! Alert engine of a scriptable monitoring agent.
//!
//! Scripts and API callers report condition changes as alert updates; the
//! engine tracks each alert's level state machine in pluggable storage and
//! decides when to notify which channels.
//!
//! ## Architecture
//!
//! - **Models**: the alert entity, levels, notification options
//! - **Storage**: memory and SQL (SQLite, Postgres) backends with KV and alert sub-stores
//! - **Alerting**: manager policy (dedup, repeat, escalation) and channel dispatch
//! - **API**: REST API for reading alert state and Prometheus metrics
//!
//! ## Quick Start
//!
//! ```bash
//! # Start the HTTP API
//! balerter serve --config balerter.yml
//!
//! # Record an observation
//! balerter alerts update svc error --text "service down"
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod alerting;
pub mod api;
pub mod config;
pub mod error;
pub mod models;
pub mod storage;

pub use config::Config;
pub use error::{Error, Result};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::alerting::{AlertManager, Channel, Dispatcher, MetricsSink};
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::models::*;
    pub use crate::storage::{AlertStorage, CoreStorage, KvStorage, StorageRegistry};
}
