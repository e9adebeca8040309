//! Alerting for Balerter
//!
//! Provides the alert manager policy, notification channels and their dispatch,
//! and alert level metrics.

mod channels;
mod manager;
mod metrics;
mod notifier;

pub use channels::{LogChannel, WebhookChannel};
pub use manager::AlertManager;
pub use metrics::{MetricsSink, NoopSink, PrometheusSink, ALERT_STATUS_METRIC};
pub use notifier::{Channel, Dispatcher, NotificationError, NotificationResult};
