//! Quota limiting
//!
//! A [`Limiter`] decides whether a request may proceed. Granting access does
//! not consume quota by itself: [`Limiter::try_acquire`] hands back a
//! [`Commit`] which the caller invokes once the upstream call has actually
//! succeeded, so failed upstream calls never count against an actor.
//!
//! Counting is done against a shared [`CounterStore`](crate::store::CounterStore).
//! The read-check and the increment are separate store operations, so
//! concurrent requests close to a boundary can be slightly over-admitted but
//! never under-admitted.

pub mod errors;
pub mod static_limiter;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Instrument, Span};

pub use errors::LimitError;
pub use static_limiter::{retry_after_with_ttl, StaticLimiter};

/// Current usage of a limiter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Usage {
    /// Units consumed in the current quota window
    pub count: i64,
    /// When the current quota window resets
    pub expires_at: DateTime<Utc>,
}

/// Admission control for a single actor and feature
#[async_trait]
pub trait Limiter: Send + Sync {
    /// Check whether a request may proceed.
    ///
    /// On success the returned [`Commit`] must be invoked to record usage;
    /// dropping it leaves the counters untouched.
    async fn try_acquire(&self) -> Result<Commit, LimitError>;

    /// Report current usage.
    async fn usage(&self) -> Result<Usage, LimitError>;
}

/// Callback invoked with the usage ratio and the quota window's remaining TTL
/// after every grant and denial.
pub type RateLimitAlerter = Arc<dyn Fn(f64, Duration) -> BoxFuture<'static, ()> + Send + Sync>;

/// Source of the current time, swappable in tests
pub type NowFn = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Wall clock
pub fn system_now() -> NowFn {
    Arc::new(Utc::now)
}

/// Run `fut` on a detached task that keeps the current span but not the
/// caller's cancellation.
pub(crate) fn spawn_detached<F>(fut: F) -> tokio::task::JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(fut.instrument(Span::current()))
}

type CommitFn = Box<dyn FnOnce(i64) -> BoxFuture<'static, Result<(), LimitError>> + Send>;

/// Deferred usage recording for a granted request
pub struct Commit {
    run: CommitFn,
}

impl std::fmt::Debug for Commit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Commit").finish_non_exhaustive()
    }
}

impl Commit {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: FnOnce(i64) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), LimitError>> + Send + 'static,
    {
        Self {
            run: Box::new(move |amount| Box::pin(f(amount))),
        }
    }

    /// A commit that records nothing
    pub fn noop() -> Self {
        Self::new(|_| async { Ok(()) })
    }

    /// Record `amount` units of usage.
    ///
    /// The store writes run on a detached task: if the caller is cancelled
    /// (for example the client disconnected after the upstream call finished)
    /// the accounting still completes. Errors are returned for logging only;
    /// the request they belong to has already been served.
    pub async fn commit(self, amount: i64) -> Result<(), LimitError> {
        let fut = (self.run)(amount);
        let result = match spawn_detached(fut).await {
            Ok(result) => result,
            Err(e) => Err(LimitError::Internal(format!("commit task failed: {}", e))),
        };
        if result.is_err() {
            crate::metrics::record_commit_error();
        }
        result
    }
}
