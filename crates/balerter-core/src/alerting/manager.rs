//! Alert manager
//!
//! Applies the notification policy on top of the storage state machine:
//! escalation at error level, transition dedup, and periodic reminders.

use std::sync::Arc;

use tracing::{debug, error, instrument};

use super::metrics::MetricsSink;
use super::notifier::Dispatcher;
use crate::error::{Error, Result};
use crate::models::{Alert, Level, Options};
use crate::storage::CoreStorage;

/// Orchestrates alert updates, metrics and notifications
pub struct AlertManager {
    storage: Arc<dyn CoreStorage>,
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<dyn MetricsSink>,
}

impl AlertManager {
    /// Create a manager over one storage instance
    pub fn new(
        storage: Arc<dyn CoreStorage>,
        dispatcher: Arc<Dispatcher>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            storage,
            dispatcher,
            metrics,
        }
    }

    /// Name of the backing storage instance
    pub fn storage_name(&self) -> &str {
        self.storage.name()
    }

    /// Record an observation of `name` at `level` and notify per `options`.
    ///
    /// Returns the stored alert and whether its level changed. Notification
    /// failures are logged and never fail the call.
    #[instrument(skip(self, text, options), fields(storage = %self.storage.name()))]
    pub async fn update(
        &self,
        name: &str,
        level: Level,
        text: &str,
        options: &Options,
    ) -> Result<(Alert, bool)> {
        if name.trim().is_empty() {
            return Err(Error::validation("alert name must not be empty"));
        }
        options.validate()?;

        let (alert, changed) = self
            .storage
            .alert()
            .update(name, level)
            .await
            .map_err(|e| e.context(format!("update alert '{name}'")))?;

        self.metrics.set_alert_level(name, alert.level());

        if alert.level() == Level::Error {
            self.escalate(&alert, text, options).await;
        }

        if options.quiet {
            debug!(alert = %name, count = alert.count(), "Quiet update, notification skipped");
        } else if should_notify(&alert, changed, options.repeat_interval()) {
            self.dispatch(alert.level(), name, text, options).await;
        }

        Ok((alert, changed))
    }

    async fn escalate(&self, alert: &Alert, text: &str, options: &Options) {
        let Some(channels) = options.escalate.get(&alert.count()) else {
            return;
        };
        if channels.is_empty() {
            return;
        }

        debug!(alert = %alert.name(), count = alert.count(), channels = ?channels, "Escalating alert");
        let escalation = Options {
            channels: channels.clone(),
            ..options.clone()
        };
        self.dispatch(alert.level(), alert.name(), text, &escalation)
            .await;
    }

    async fn dispatch(&self, level: Level, name: &str, text: &str, options: &Options) {
        if let Err(e) = self.dispatcher.send(level, name, text, options).await {
            error!(alert = %name, error = %e, "Error dispatching notification");
        }
    }

    /// Read one alert; `Ok(None)` when it does not exist
    pub async fn get(&self, name: &str) -> Result<Option<Alert>> {
        self.storage
            .alert()
            .get(name)
            .await
            .map_err(|e| e.context(format!("get alert '{name}'")))
    }

    /// Alerts filtered by exact names (none = any) and levels (none = any)
    pub async fn list(&self, names: &[String], levels: &[Level]) -> Result<Vec<Alert>> {
        let alerts = self
            .storage
            .alert()
            .index(levels)
            .await
            .map_err(|e| e.context("list alerts"))?;

        if names.is_empty() {
            return Ok(alerts);
        }
        Ok(alerts
            .into_iter()
            .filter(|a| names.iter().any(|n| n == a.name()))
            .collect())
    }

    /// Shorthand for [`AlertManager::update`] at [`Level::Success`]
    pub async fn success(&self, name: &str, text: &str, options: &Options) -> Result<(Alert, bool)> {
        self.update(name, Level::Success, text, options).await
    }

    /// Shorthand for [`AlertManager::update`] at [`Level::Warn`]
    pub async fn warn(&self, name: &str, text: &str, options: &Options) -> Result<(Alert, bool)> {
        self.update(name, Level::Warn, text, options).await
    }

    /// Shorthand for [`AlertManager::update`] at [`Level::Error`]
    pub async fn error(&self, name: &str, text: &str, options: &Options) -> Result<(Alert, bool)> {
        self.update(name, Level::Error, text, options).await
    }
}

/// Primary notification rule: every transition, plus every `repeat`-th call
fn should_notify(alert: &Alert, changed: bool, repeat: u64) -> bool {
    if changed {
        return true;
    }
    match i64::try_from(repeat) {
        Ok(repeat) if repeat > 0 => alert.count() % repeat == 0,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerting::metrics::NoopSink;
    use crate::alerting::notifier::testing::RecordingChannel;
    use crate::alerting::notifier::Channel;
    use crate::storage::{AlertStorage, KvStorage, MemoryStorage};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rstest::rstest;
    use std::collections::BTreeMap;

    struct Fixture {
        manager: AlertManager,
        slack: Arc<RecordingChannel>,
        pager: Arc<RecordingChannel>,
    }

    fn fixture() -> Fixture {
        let slack = RecordingChannel::new("slack");
        let pager = RecordingChannel::ignored("pager");
        let dispatcher = Dispatcher::new(vec![
            slack.clone() as Arc<dyn Channel>,
            pager.clone() as Arc<dyn Channel>,
        ])
        .unwrap();

        Fixture {
            manager: AlertManager::new(
                Arc::new(MemoryStorage::new("memory")),
                Arc::new(dispatcher),
                Arc::new(NoopSink),
            ),
            slack,
            pager,
        }
    }

    #[tokio::test]
    async fn test_repeat_reminders() {
        let f = fixture();
        let options = Options {
            repeat: Some(2),
            ..Options::default()
        };

        let mut sends = Vec::new();
        for expected_count in 1..=4 {
            let (alert, _) = f
                .manager
                .update("svcA", Level::Error, "down", &options)
                .await
                .unwrap();
            assert_eq!(alert.count(), expected_count);
            assert_eq!(alert.level(), Level::Error);
            sends.push(f.slack.count());
        }

        assert_eq!(sends, vec![1, 2, 2, 3]);
    }

    #[tokio::test]
    async fn test_warn_then_success() {
        let f = fixture();

        let (_, changed) = f
            .manager
            .update("svcB", Level::Warn, "x", &Options::default())
            .await
            .unwrap();
        assert!(changed);
        let after_warn = f.slack.count();

        let (alert, changed) = f
            .manager
            .update("svcB", Level::Success, "ok", &Options::default())
            .await
            .unwrap();

        assert!(changed);
        assert_eq!(alert.count(), crate::models::TRANSITION_COUNT);
        assert_eq!(f.slack.count() - after_warn, 1);
        assert_eq!(f.slack.sent.lock().last().unwrap().level, Level::Success);
    }

    #[tokio::test]
    async fn test_steady_state_sends_once() {
        let f = fixture();
        for _ in 0..5 {
            f.manager
                .error("svc", "down", &Options::default())
                .await
                .unwrap();
        }
        assert_eq!(f.slack.count(), 1);
    }

    #[tokio::test]
    async fn test_new_success_alert_is_silent() {
        let f = fixture();
        let (alert, changed) = f
            .manager
            .success("svc", "ok", &Options::default())
            .await
            .unwrap();
        assert!(!changed);
        assert_eq!(alert.count(), crate::models::INITIAL_COUNT);
        assert_eq!(f.slack.count(), 0);
    }

    #[rstest]
    #[case(None)]
    #[case(Some(1))]
    #[tokio::test]
    async fn test_quiet_suppresses_sends(#[case] repeat: Option<u64>) {
        let f = fixture();
        let options = Options {
            quiet: true,
            repeat,
            ..Options::default()
        };

        for level in [Level::Error, Level::Error, Level::Success, Level::Warn] {
            f.manager.update("svc", level, "t", &options).await.unwrap();
        }

        assert_eq!(f.slack.count(), 0);
        let alert = f.manager.get("svc").await.unwrap().unwrap();
        assert_eq!(alert.level(), Level::Warn);
        assert_eq!(alert.count(), crate::models::TRANSITION_COUNT);
    }

    #[tokio::test]
    async fn test_escalation_only_at_error_and_matching_count() {
        let f = fixture();
        let options = Options {
            quiet: true,
            escalate: BTreeMap::from([
                (2, vec!["pager".to_string()]),
                (3, vec![]),
            ]),
            ..Options::default()
        };

        // warn observations never escalate
        f.manager.warn("svc", "t", &options).await.unwrap();
        f.manager.warn("svc", "t", &options).await.unwrap();
        assert_eq!(f.pager.count(), 0);

        // error: count resets to 0, then 1, 2, 3
        for _ in 0..4 {
            f.manager.error("svc", "t", &options).await.unwrap();
        }

        assert_eq!(f.pager.count(), 1);
        assert_eq!(f.slack.count(), 0);
        assert_eq!(f.pager.sent.lock()[0].level, Level::Error);
    }

    #[tokio::test]
    async fn test_escalation_and_primary_in_same_call() {
        let f = fixture();
        let options = Options {
            escalate: BTreeMap::from([(1, vec!["pager".to_string()])]),
            ..Options::default()
        };

        f.manager.error("svc", "down", &options).await.unwrap();

        assert_eq!(f.pager.count(), 1);
        assert_eq!(f.slack.count(), 1);
    }

    #[tokio::test]
    async fn test_repeat_and_resend_rejected() {
        let f = fixture();
        let options = Options {
            repeat: Some(2),
            resend: Some(2),
            ..Options::default()
        };

        let err = f
            .manager
            .error("svc", "down", &options)
            .await
            .unwrap_err();

        assert!(err.is_validation());
        assert!(f.manager.get("svc").await.unwrap().is_none());
    }

    #[rstest]
    #[case("")]
    #[case("   ")]
    #[tokio::test]
    async fn test_empty_name_rejected(#[case] name: &str) {
        let f = fixture();
        let err = f
            .manager
            .error(name, "down", &Options::default())
            .await
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_channel_failure_does_not_fail_update() {
        let broken = RecordingChannel::failing("broken");
        let dispatcher = Dispatcher::new(vec![broken.clone() as Arc<dyn Channel>]).unwrap();
        let manager = AlertManager::new(
            Arc::new(MemoryStorage::new("memory")),
            Arc::new(dispatcher),
            Arc::new(NoopSink),
        );

        let (alert, changed) = manager
            .error("svc", "down", &Options::default())
            .await
            .unwrap();

        assert!(changed);
        assert_eq!(alert.level(), Level::Error);
        assert_eq!(broken.count(), 1);
    }

    #[tokio::test]
    async fn test_unresolved_channels_do_not_fail_update() {
        let f = fixture();
        let options = Options::for_channels(vec!["missing".to_string()]);

        let (_, changed) = f.manager.error("svc", "down", &options).await.unwrap();

        assert!(changed);
        assert_eq!(f.slack.count(), 0);
    }

    #[derive(Default)]
    struct RecordingSink {
        levels: Mutex<Vec<(String, Level)>>,
    }

    impl MetricsSink for RecordingSink {
        fn set_alert_level(&self, name: &str, level: Level) {
            self.levels.lock().push((name.to_string(), level));
        }
    }

    #[tokio::test]
    async fn test_metrics_record_resulting_level() {
        let sink = Arc::new(RecordingSink::default());
        let manager = AlertManager::new(
            Arc::new(MemoryStorage::new("memory")),
            Arc::new(Dispatcher::new(vec![]).unwrap()),
            sink.clone(),
        );

        manager.warn("a", "t", &Options::default()).await.unwrap();
        manager.error("a", "t", &Options::default()).await.unwrap();

        assert_eq!(
            *sink.levels.lock(),
            vec![("a".to_string(), Level::Warn), ("a".to_string(), Level::Error)]
        );
    }

    struct BrokenStorage;

    #[async_trait]
    impl AlertStorage for BrokenStorage {
        async fn update(&self, _name: &str, _level: Level) -> Result<(Alert, bool)> {
            Err(Error::internal("disk on fire"))
        }

        async fn get(&self, _name: &str) -> Result<Option<Alert>> {
            Err(Error::internal("disk on fire"))
        }

        async fn index(&self, _levels: &[Level]) -> Result<Vec<Alert>> {
            Err(Error::internal("disk on fire"))
        }
    }

    #[async_trait]
    impl CoreStorage for BrokenStorage {
        fn name(&self) -> &str {
            "broken"
        }

        fn kv(&self) -> &dyn KvStorage {
            unimplemented!("not used by the manager")
        }

        fn alert(&self) -> &dyn AlertStorage {
            self
        }

        async fn stop(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_storage_failure_propagates_with_context() {
        let slack = RecordingChannel::new("slack");
        let manager = AlertManager::new(
            Arc::new(BrokenStorage),
            Arc::new(Dispatcher::new(vec![slack.clone() as Arc<dyn Channel>]).unwrap()),
            Arc::new(NoopSink),
        );

        let err = manager
            .error("svc", "down", &Options::default())
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "update alert 'svc': Internal error: disk on fire");
        assert!(matches!(err.root(), Error::Internal(_)));
        assert_eq!(slack.count(), 0);
        assert!(manager.get("svc").await.is_err());
    }

    #[tokio::test]
    async fn test_list_filters_names_and_levels() {
        let f = fixture();
        let quiet = Options {
            quiet: true,
            ..Options::default()
        };
        f.manager.error("a", "t", &quiet).await.unwrap();
        f.manager.warn("b", "t", &quiet).await.unwrap();
        f.manager.error("c", "t", &quiet).await.unwrap();

        let errors = f.manager.list(&[], &[Level::Error]).await.unwrap();
        assert_eq!(errors.iter().map(Alert::name).collect::<Vec<_>>(), vec!["a", "c"]);

        let named = f
            .manager
            .list(&["b".to_string(), "c".to_string()], &[])
            .await
            .unwrap();
        assert_eq!(named.iter().map(Alert::name).collect::<Vec<_>>(), vec!["b", "c"]);

        assert_eq!(f.manager.storage_name(), "memory");
    }
}
