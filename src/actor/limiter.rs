use super::{Actor, Feature};
use crate::limiter::{
    system_now, Commit, LimitError, Limiter, NowFn, RateLimitAlerter, StaticLimiter, Usage,
};
use crate::notify::Notifier;
use crate::store::{PrefixedStore, SharedStore};
use async_trait::async_trait;
use futures::FutureExt;
use std::sync::Arc;
use tracing::{debug, error};

/// Options shared by every limiter built for an actor
#[derive(Clone)]
pub struct LimiterOptions {
    /// Rewrite interval counter TTLs longer than the configured interval
    pub update_rate_limit_ttl: bool,
    pub now: NowFn,
}

impl Default for LimiterOptions {
    fn default() -> Self {
        Self {
            update_rate_limit_ttl: true,
            now: system_now(),
        }
    }
}

impl Actor {
    /// Build the limiter enforcing this actor's quota for `feature`.
    ///
    /// The chain is concurrency sub-quota, then the self-healing wrapper, then
    /// the interval quota. Both quotas must grant for a request to proceed.
    pub fn limiter(
        &self,
        feature: Feature,
        store: SharedStore,
        notifier: Option<Arc<dyn Notifier>>,
        options: &LimiterOptions,
    ) -> Result<Arc<dyn Limiter>, LimitError> {
        let rate_limit = match self.rate_limits.get(&feature) {
            Some(rate_limit) if self.access_enabled && rate_limit.is_valid() => rate_limit.clone(),
            _ => {
                // Access may have been granted since this actor was cached
                self.refresh_in_background();
                return Err(LimitError::NoAccess);
            }
        };

        let mut interval_limiter = StaticLimiter::new(
            "actor.rate_limit",
            self.id.clone(),
            Arc::new(PrefixedStore::new(format!("{}:", feature), store.clone())),
            rate_limit.limit,
            rate_limit.interval,
        )
        .with_update_rate_limit_ttl(options.update_rate_limit_ttl)
        .with_clock(options.now.clone());

        if let Some(notifier) = notifier {
            let actor = Arc::new(self.clone());
            let alerter: RateLimitAlerter = Arc::new(move |usage_ratio, ttl| {
                let notifier = notifier.clone();
                let actor = actor.clone();
                async move { notifier.notify(&actor, feature, usage_ratio, ttl).await }.boxed()
            });
            interval_limiter = interval_limiter.with_alerter(alerter);
        }

        let concurrent = StaticLimiter::new(
            "actor.concurrency",
            self.id.clone(),
            Arc::new(PrefixedStore::new(format!("concurrent:{}:", feature), store)),
            rate_limit.concurrent_requests,
            rate_limit.concurrent_requests_interval,
        )
        .with_update_rate_limit_ttl(true)
        .with_clock(options.now.clone());

        Ok(Arc::new(ConcurrencyLimiter {
            feature,
            concurrent,
            next: Arc::new(UpdateOnErrorLimiter {
                actor: self.clone(),
                next: Arc::new(interval_limiter),
            }),
        }))
    }
}

/// Enforces an in-flight sub-quota before delegating to the next limiter.
///
/// Grants are counted immediately against a short rolling window, so the
/// count approximates the number of requests currently in flight.
pub struct ConcurrencyLimiter {
    feature: Feature,
    concurrent: StaticLimiter,
    next: Arc<dyn Limiter>,
}

impl ConcurrencyLimiter {
    pub fn new(feature: Feature, concurrent: StaticLimiter, next: Arc<dyn Limiter>) -> Self {
        Self {
            feature,
            concurrent,
            next,
        }
    }
}

#[async_trait]
impl Limiter for ConcurrencyLimiter {
    async fn try_acquire(&self) -> Result<Commit, LimitError> {
        let commit = match self.concurrent.try_acquire().await {
            Ok(commit) => commit,
            Err(LimitError::RateLimitExceeded { limit, retry_after }) => {
                return Err(LimitError::ConcurrencyLimitExceeded {
                    feature: self.feature,
                    limit,
                    retry_after,
                });
            }
            Err(e) => return Err(e),
        };

        if let Err(e) = commit.commit(1).await {
            error!(
                feature = %self.feature,
                identifier = %self.concurrent.identifier(),
                error = %e,
                "failed to commit concurrency limit consumption"
            );
        }

        self.next.try_acquire().await
    }

    async fn usage(&self) -> Result<Usage, LimitError> {
        self.next.usage().await
    }
}

/// Triggers an actor refresh when the wrapped limiter denies for reasons that
/// stale entitlements could explain. The original error is returned as is.
pub struct UpdateOnErrorLimiter {
    actor: Actor,
    next: Arc<dyn Limiter>,
}

impl UpdateOnErrorLimiter {
    pub fn new(actor: Actor, next: Arc<dyn Limiter>) -> Self {
        Self { actor, next }
    }
}

#[async_trait]
impl Limiter for UpdateOnErrorLimiter {
    async fn try_acquire(&self) -> Result<Commit, LimitError> {
        let result = self.next.try_acquire().await;
        if matches!(
            result,
            Err(LimitError::NoAccess | LimitError::RateLimitExceeded { .. })
        ) {
            debug!(actor = %self.actor.id, "limiter denied access, refreshing actor");
            self.actor.refresh_in_background();
        }
        result
    }

    async fn usage(&self) -> Result<Usage, LimitError> {
        self.next.usage().await
    }
}
