//! Usage alerts
//!
//! Limiters report every grant and denial's usage ratio to a [`Notifier`].
//! The [`ThresholdNotifier`] turns those into at most one alert per
//! configured threshold per quota window, across all replicas.

pub mod sink;

use crate::actor::{Actor, Feature};
use crate::lock::{LockError, Mutex, MutexOptions, SharedLockBackend};
use crate::store::{SharedStore, StoreError};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info};

pub use self::sink::{LogSink, NotificationSink, SlackSink};

/// Notification errors
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("alert state: {0}")]
    Store(#[from] StoreError),

    #[error("alert lock: {0}")]
    Lock(#[from] LockError),

    #[error("notification sink: {0}")]
    Sink(String),
}

/// Receives usage reports from limiters
#[async_trait]
pub trait Notifier: Send + Sync {
    /// `usage_ratio` is usage over limit; `ttl` is the remaining quota window.
    async fn notify(&self, actor: &Actor, feature: Feature, usage_ratio: f64, ttl: Duration);
}

/// Ascending alert thresholds, in percent, per actor source name
#[derive(Debug, Clone, Default)]
pub struct Thresholds {
    by_source: HashMap<String, Vec<u32>>,
}

impl Thresholds {
    pub fn new(by_source: HashMap<String, Vec<u32>>) -> Self {
        let by_source = by_source
            .into_iter()
            .map(|(source, mut thresholds)| {
                thresholds.sort_unstable();
                thresholds.dedup();
                (source, thresholds)
            })
            .collect();
        Self { by_source }
    }

    pub fn get(&self, source: &str) -> &[u32] {
        self.by_source.get(source).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// The largest threshold, in percent, not exceeding `usage_ratio`.
///
/// Compared as ratios: `usage_ratio * 100.0` rounds 0.29 down to just
/// under 29.
pub fn bucket(thresholds: &[u32], usage_ratio: f64) -> Option<u32> {
    thresholds
        .iter()
        .rev()
        .find(|t| f64::from(**t) / 100.0 <= usage_ratio)
        .copied()
}

/// Render a duration as e.g. `3h 20m`
pub fn humanize(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (days, hours, minutes) = (secs / 86_400, (secs % 86_400) / 3600, (secs % 3600) / 60);
    match (days, hours, minutes) {
        (0, 0, 0) => format!("{}s", secs),
        (0, 0, m) => format!("{}m", m),
        (0, h, m) => format!("{}h {}m", h, m),
        (d, h, _) => format!("{}d {}h", d, h),
    }
}

/// Sends one alert per crossed threshold per actor, feature and quota window.
///
/// Deduplication state lives in the shared store under
/// `<feature>:alert:<actor>` and expires with the quota window. A short-lived
/// lock per actor and feature keeps concurrent reports from racing on it.
pub struct ThresholdNotifier {
    store: SharedStore,
    locks: SharedLockBackend,
    thresholds: Thresholds,
    sink: Arc<dyn NotificationSink>,
    lock_ttl: Duration,
}

impl ThresholdNotifier {
    pub fn new(
        store: SharedStore,
        locks: SharedLockBackend,
        thresholds: Thresholds,
        sink: Arc<dyn NotificationSink>,
        lock_ttl: Duration,
    ) -> Self {
        Self {
            store,
            locks,
            thresholds,
            sink,
            lock_ttl,
        }
    }

    pub fn bucket_key(feature: Feature, actor_id: &str) -> String {
        format!("{}:alert:{}", feature, actor_id)
    }

    pub fn lock_key(feature: Feature, actor_id: &str) -> String {
        format!("{}:alert:lock:{}", feature, actor_id)
    }

    /// Handle one usage report. Returns whether an alert was dispatched.
    pub async fn try_notify(
        &self,
        actor: &Actor,
        feature: Feature,
        usage_ratio: f64,
        ttl: Duration,
    ) -> Result<bool, NotifyError> {
        if actor.id.is_empty() {
            return Ok(false);
        }
        let thresholds = self.thresholds.get(actor.source_name());
        let bucket = match bucket(thresholds, usage_ratio) {
            Some(bucket) => bucket,
            None => return Ok(false),
        };

        let mut lock = Mutex::new(
            Self::lock_key(feature, &actor.id),
            self.locks.clone(),
            MutexOptions {
                expiry: self.lock_ttl,
                tries: 1,
                retry_delay: Duration::ZERO,
            },
        );
        match lock.try_lock().await {
            Ok(()) => {}
            Err(e) if e.is_contention() => {
                debug!(actor = %actor.id, %feature, "alert already being handled");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        }

        let result = self.alert_locked(actor, feature, bucket, ttl).await;
        if let Err(e) = lock.unlock().await {
            debug!(actor = %actor.id, %feature, error = %e, "failed to release alert lock");
        }
        result
    }

    async fn alert_locked(
        &self,
        actor: &Actor,
        feature: Feature,
        bucket: u32,
        ttl: Duration,
    ) -> Result<bool, NotifyError> {
        let key = Self::bucket_key(feature, &actor.id);
        let last_alerted = self.store.get_int(&key).await?;
        if i64::from(bucket) <= last_alerted {
            return Ok(false);
        }

        let message = alert_message(actor, feature, bucket, ttl);
        match self.sink.send(&message).await {
            Ok(()) => info!(actor = %actor.id, %feature, bucket, "sent rate limit alert"),
            Err(e) => error!(actor = %actor.id, %feature, bucket, error = %e, "failed to send rate limit alert"),
        }
        crate::metrics::record_alert(feature, bucket);

        // Recorded even if dispatch failed, expiring with the quota window
        let ttl_secs = (ttl.as_secs() as i64).max(1);
        self.store.set_ex(&key, i64::from(bucket), ttl_secs).await?;
        Ok(true)
    }
}

#[async_trait]
impl Notifier for ThresholdNotifier {
    async fn notify(&self, actor: &Actor, feature: Feature, usage_ratio: f64, ttl: Duration) {
        if let Err(e) = self.try_notify(actor, feature, usage_ratio, ttl).await {
            error!(actor = %actor.id, %feature, error = %e, "failed to handle rate limit alert");
        }
    }
}

fn alert_message(actor: &Actor, feature: Feature, bucket: u32, ttl: Duration) -> String {
    let who = match &actor.name {
        Some(name) => format!("{} ({})", name, actor.id),
        None => actor.id.clone(),
    };
    let resets_at = Utc::now() + chrono::Duration::seconds(ttl.as_secs() as i64);
    format!(
        "{} actor {} has exceeded {}% of its rate limit for {}. The limit resets in {} ({}).",
        actor.source_name(),
        who,
        bucket,
        feature,
        humanize(ttl),
        resets_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{Source, SourceError};
    use crate::store::{CounterStore, MemoryStore};
    use secrecy::SecretString;

    #[derive(Default)]
    struct RecordingSink {
        messages: std::sync::Mutex<Vec<String>>,
        fail: bool,
    }

    impl RecordingSink {
        fn count(&self) -> usize {
            self.messages.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn send(&self, message: &str) -> Result<(), NotifyError> {
            self.messages.lock().unwrap().push(message.to_string());
            if self.fail {
                return Err(NotifyError::Sink("unavailable".to_string()));
            }
            Ok(())
        }
    }

    struct NamedSource;

    #[async_trait]
    impl Source for NamedSource {
        fn name(&self) -> &str {
            "subscription"
        }

        async fn get(&self, _token: &str) -> Result<Actor, SourceError> {
            Err(SourceError::NotFromSource {
                reason: "test".to_string(),
            })
        }
    }

    fn actor() -> Actor {
        Actor {
            id: "sub-1".to_string(),
            key: SecretString::new("gw_token".to_string()),
            name: Some("Acme".to_string()),
            access_enabled: true,
            rate_limits: HashMap::new(),
            last_updated: None,
            source: Some(Arc::new(NamedSource)),
        }
    }

    fn notifier(store: &Arc<MemoryStore>, sink: Arc<RecordingSink>) -> ThresholdNotifier {
        let mut thresholds = HashMap::new();
        thresholds.insert("subscription".to_string(), vec![90, 50, 80]);
        ThresholdNotifier::new(
            store.clone(),
            store.clone(),
            Thresholds::new(thresholds),
            sink,
            Duration::from_secs(30),
        )
    }

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn test_bucket() {
        let thresholds = [50, 80, 90];
        assert_eq!(bucket(&thresholds, 0.499), None);
        assert_eq!(bucket(&thresholds, 0.5), Some(50));
        assert_eq!(bucket(&thresholds, 0.85), Some(80));
        assert_eq!(bucket(&thresholds, 1.0), Some(90));
        assert_eq!(bucket(&[], 1.0), None);
    }

    #[test]
    fn test_bucket_at_exact_percentages() {
        let thresholds = [29, 57];
        assert_eq!(bucket(&thresholds, 29.0 / 100.0), Some(29));
        assert_eq!(bucket(&thresholds, 58.0 / 200.0), Some(29));
        assert_eq!(bucket(&thresholds, 57.0 / 100.0), Some(57));
        assert_eq!(bucket(&thresholds, 28.0 / 100.0), None);
    }

    #[tokio::test]
    async fn test_alerts_when_usage_lands_on_threshold() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(RecordingSink::default());
        let mut thresholds = HashMap::new();
        thresholds.insert("subscription".to_string(), vec![29, 57]);
        let n = ThresholdNotifier::new(
            store.clone(),
            store.clone(),
            Thresholds::new(thresholds),
            sink.clone(),
            Duration::from_secs(30),
        );

        assert!(n.try_notify(&actor(), Feature::ChatCompletions, 29.0 / 100.0, HOUR).await.unwrap());
        let key = ThresholdNotifier::bucket_key(Feature::ChatCompletions, "sub-1");
        assert_eq!(store.get_int(&key).await.unwrap(), 29);
        assert!(sink.messages.lock().unwrap()[0].contains("29%"));
    }

    #[test]
    fn test_humanize() {
        assert_eq!(humanize(Duration::from_secs(42)), "42s");
        assert_eq!(humanize(Duration::from_secs(600)), "10m");
        assert_eq!(humanize(Duration::from_secs(3 * 3600 + 20 * 60)), "3h 20m");
        assert_eq!(humanize(Duration::from_secs(2 * 86_400 + 3600)), "2d 1h");
    }

    #[tokio::test]
    async fn test_one_alert_per_bucket() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(RecordingSink::default());
        let n = notifier(&store, sink.clone());
        let actor = actor();

        assert!(n.try_notify(&actor, Feature::ChatCompletions, 0.55, HOUR).await.unwrap());
        assert_eq!(sink.count(), 1);

        assert!(!n.try_notify(&actor, Feature::ChatCompletions, 0.60, HOUR).await.unwrap());
        assert_eq!(sink.count(), 1);

        assert!(n.try_notify(&actor, Feature::ChatCompletions, 0.85, HOUR).await.unwrap());
        assert_eq!(sink.count(), 2);

        let key = ThresholdNotifier::bucket_key(Feature::ChatCompletions, "sub-1");
        assert_eq!(store.get_int(&key).await.unwrap(), 80);
        assert_eq!(store.ttl(&key).await.unwrap(), 3600);

        let message = sink.messages.lock().unwrap()[1].clone();
        assert!(message.contains("Acme (sub-1)"));
        assert!(message.contains("80%"));
        assert!(message.contains("chat_completions"));
        assert!(message.contains("1h 0m"));
    }

    #[tokio::test]
    async fn test_below_thresholds_and_unknown_source() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(RecordingSink::default());
        let n = notifier(&store, sink.clone());

        assert!(!n.try_notify(&actor(), Feature::Embeddings, 0.3, HOUR).await.unwrap());

        let mut anonymous = actor();
        anonymous.source = None;
        assert!(!n.try_notify(&anonymous, Feature::Embeddings, 1.0, HOUR).await.unwrap());

        assert_eq!(sink.count(), 0);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_features_are_independent() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(RecordingSink::default());
        let n = notifier(&store, sink.clone());

        n.notify(&actor(), Feature::ChatCompletions, 0.95, HOUR).await;
        n.notify(&actor(), Feature::CodeCompletions, 0.95, HOUR).await;
        assert_eq!(sink.count(), 2);
    }

    #[tokio::test]
    async fn test_contended_lock_is_silent() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(RecordingSink::default());
        let n = notifier(&store, sink.clone());

        let mut held = Mutex::new(
            ThresholdNotifier::lock_key(Feature::ChatCompletions, "sub-1"),
            store.clone(),
            MutexOptions::default(),
        );
        held.try_lock().await.unwrap();

        assert!(!n.try_notify(&actor(), Feature::ChatCompletions, 0.95, HOUR).await.unwrap());
        assert_eq!(sink.count(), 0);

        held.unlock().await.unwrap();
        assert!(n.try_notify(&actor(), Feature::ChatCompletions, 0.95, HOUR).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_dispatch_still_records_bucket() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(RecordingSink {
            fail: true,
            ..Default::default()
        });
        let n = notifier(&store, sink.clone());

        assert!(n.try_notify(&actor(), Feature::ChatCompletions, 0.9, HOUR).await.unwrap());
        assert!(!n.try_notify(&actor(), Feature::ChatCompletions, 0.95, HOUR).await.unwrap());
        assert_eq!(sink.count(), 1);
    }
}
