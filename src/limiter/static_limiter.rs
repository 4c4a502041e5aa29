use super::{
    spawn_detached, system_now, Commit, LimitError, Limiter, NowFn, RateLimitAlerter, Usage,
};
use crate::store::{SharedStore, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, warn};

/// Fixed-size, fixed-interval quota over a counter store key.
///
/// The counter lives at `identifier` in the (usually prefixed) store and
/// expires with the quota window. The window starts at the first committed
/// usage.
#[derive(Clone)]
pub struct StaticLimiter {
    /// Name used in logs and metrics
    limiter_name: &'static str,
    /// Counter key, typically the actor ID
    identifier: String,
    store: SharedStore,
    /// Maximum units per interval
    limit: i64,
    interval: Duration,
    /// Rewrite the key's TTL down to `interval` when it is longer, correcting
    /// drift from a previous longer-interval configuration
    update_rate_limit_ttl: bool,
    now: NowFn,
    alerter: Option<RateLimitAlerter>,
}

impl std::fmt::Debug for StaticLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticLimiter")
            .field("limiter_name", &self.limiter_name)
            .field("identifier", &self.identifier)
            .field("limit", &self.limit)
            .field("interval", &self.interval)
            .field("update_rate_limit_ttl", &self.update_rate_limit_ttl)
            .finish()
    }
}

impl StaticLimiter {
    pub fn new(
        limiter_name: &'static str,
        identifier: impl Into<String>,
        store: SharedStore,
        limit: i64,
        interval: Duration,
    ) -> Self {
        Self {
            limiter_name,
            identifier: identifier.into(),
            store,
            limit,
            interval,
            update_rate_limit_ttl: false,
            now: system_now(),
            alerter: None,
        }
    }

    pub fn with_update_rate_limit_ttl(mut self, update: bool) -> Self {
        self.update_rate_limit_ttl = update;
        self
    }

    pub fn with_alerter(mut self, alerter: RateLimitAlerter) -> Self {
        self.alerter = Some(alerter);
        self
    }

    pub fn with_clock(mut self, now: NowFn) -> Self {
        self.now = now;
        self
    }

    pub fn limit(&self) -> i64 {
        self.limit
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    fn has_access(&self) -> bool {
        !self.identifier.is_empty() && self.limit > 0 && !self.interval.is_zero()
    }

    fn interval_secs(&self) -> i64 {
        // Sub-second intervals still need a positive TTL
        (self.interval.as_secs() as i64).max(1)
    }

    fn alert(&self, usage_ratio: f64, ttl: Duration) {
        if let Some(alerter) = &self.alerter {
            spawn_detached(alerter(usage_ratio, ttl));
        }
    }

    /// Increment the counter and fix up its expiry.
    async fn record(self, amount: i64) -> Result<(), LimitError> {
        let incremented_to = self
            .store
            .incrby(&self.identifier, amount)
            .await
            .map_err(LimitError::store("failed to increment rate limit counter"))?;

        // Not atomic with the increment above; see module docs.
        let interval_secs = self.interval_secs();
        let mut ttl_secs = self
            .store
            .ttl(&self.identifier)
            .await
            .map_err(LimitError::store("failed to get TTL for rate limit counter"))?;

        if ttl_secs < 0 || (self.update_rate_limit_ttl && ttl_secs > interval_secs) {
            self.store
                .expire(&self.identifier, interval_secs)
                .await
                .map_err(LimitError::store("failed to set expiry for rate limit counter"))?;
            ttl_secs = interval_secs;
        }

        debug!(
            limiter = self.limiter_name,
            identifier = %self.identifier,
            usage = incremented_to,
            limit = self.limit,
            ttl_secs,
            "committed rate limit usage"
        );

        self.alert(
            incremented_to as f64 / self.limit as f64,
            Duration::from_secs(ttl_secs as u64),
        );
        Ok(())
    }

    /// When a denied caller may retry.
    ///
    /// A commit that failed between its increment and its expiry leaves the
    /// counter without a TTL, which would deny the actor forever. Such a
    /// counter gets the interval expiry `record` would have given it.
    async fn denied_until(&self) -> Result<DateTime<Utc>, LimitError> {
        let ttl_secs = self
            .store
            .ttl(&self.identifier)
            .await
            .map_err(LimitError::store("failed to get TTL for rate limit counter"))?;
        if ttl_secs == -1 {
            warn!(
                limiter = self.limiter_name,
                identifier = %self.identifier,
                "rate limit counter has no expiry, restoring it"
            );
            self.store
                .expire(&self.identifier, self.interval_secs())
                .await
                .map_err(LimitError::store("failed to set expiry for rate limit counter"))?;
        }

        retry_after_with_ttl(&self.store, &self.now, &self.identifier)
            .await
            .map_err(LimitError::store("failed to get TTL for rate limit counter"))
    }
}

/// When the counter at `key` resets, from its remaining TTL.
///
/// Keys without a TTL yield `now`.
pub async fn retry_after_with_ttl(
    store: &SharedStore,
    now: &NowFn,
    key: &str,
) -> Result<DateTime<Utc>, StoreError> {
    let ttl = store.ttl(key).await?.max(0);
    Ok(now() + chrono::Duration::seconds(ttl))
}

#[async_trait]
impl Limiter for StaticLimiter {
    async fn try_acquire(&self) -> Result<Commit, LimitError> {
        if !self.has_access() {
            crate::metrics::record_limiter_decision(self.limiter_name, "no_access");
            return Err(LimitError::NoAccess);
        }

        let current_usage = self
            .store
            .get_int(&self.identifier)
            .await
            .map_err(LimitError::store("failed to read rate limit counter"))?;

        if current_usage >= self.limit {
            let retry_after = self.denied_until().await?;

            warn!(
                limiter = self.limiter_name,
                identifier = %self.identifier,
                usage = current_usage,
                limit = self.limit,
                "rate limit exceeded"
            );
            crate::metrics::record_limiter_decision(self.limiter_name, "rate_limited");

            let remaining = (retry_after - (self.now)()).to_std().unwrap_or_default();
            self.alert(1.0, remaining);

            return Err(LimitError::RateLimitExceeded {
                limit: self.limit,
                retry_after,
            });
        }

        crate::metrics::record_limiter_decision(self.limiter_name, "granted");
        let limiter = self.clone();
        Ok(Commit::new(move |amount| limiter.record(amount)))
    }

    async fn usage(&self) -> Result<Usage, LimitError> {
        if !self.has_access() {
            return Err(LimitError::NoAccess);
        }

        let count = self
            .store
            .get_int(&self.identifier)
            .await
            .map_err(LimitError::store("failed to read rate limit counter"))?;
        let expires_at = retry_after_with_ttl(&self.store, &self.now, &self.identifier)
            .await
            .map_err(LimitError::store("failed to get TTL for rate limit counter"))?;

        Ok(Usage { count, expires_at })
    }
}
