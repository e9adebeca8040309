//! Alert level metrics

use crate::models::Level;

/// Gauge holding the numeric level of every alert
pub const ALERT_STATUS_METRIC: &str = "balerter_alert_status";

/// Receives alert level changes for export
pub trait MetricsSink: Send + Sync {
    /// Record the current level of an alert
    fn set_alert_level(&self, name: &str, level: Level);
}

/// Sink writing through the `metrics` facade (exported by the Prometheus recorder)
#[derive(Debug, Default, Clone, Copy)]
pub struct PrometheusSink;

impl PrometheusSink {
    /// Register metric descriptions with the installed recorder
    pub fn describe() {
        metrics::describe_gauge!(
            ALERT_STATUS_METRIC,
            "Current alert level (1 = success, 2 = warn, 3 = error)"
        );
    }
}

impl MetricsSink for PrometheusSink {
    #[allow(clippy::cast_precision_loss)]
    fn set_alert_level(&self, name: &str, level: Level) {
        metrics::gauge!(ALERT_STATUS_METRIC, "alert" => name.to_string()).set(level.code() as f64);
    }
}

/// Sink that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn set_alert_level(&self, _name: &str, _level: Level) {}
}
