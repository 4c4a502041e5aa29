//! Actors and the sources that resolve them
//!
//! An [`Actor`] is the identity a request is admitted and counted against. It
//! is produced by a [`Source`] from the request's credential, carries the
//! actor's per-[`Feature`] quotas, and builds the composed limiter for a
//! feature via [`Actor::limiter`].

pub mod anonymous;
pub mod limiter;
pub mod sources;
pub mod subscription;
pub mod worker;

use crate::config::{ConcurrencyConfig, RateLimitConfig};
use crate::limiter::spawn_detached;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

pub use self::limiter::{ConcurrencyLimiter, LimiterOptions, UpdateOnErrorLimiter};
pub use self::sources::{Sources, SyncOutcome};
pub use self::worker::{SyncWorker, WorkerState};

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// A capability rate limited independently of the others
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    ChatCompletions,
    CodeCompletions,
    Embeddings,
}

impl Feature {
    pub const ALL: [Feature; 3] = [
        Feature::ChatCompletions,
        Feature::CodeCompletions,
        Feature::Embeddings,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::ChatCompletions => "chat_completions",
            Feature::CodeCompletions => "code_completions",
            Feature::Embeddings => "embeddings",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-feature quota
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimit {
    /// Models the quota applies to; empty means no access
    pub allowed_models: Vec<String>,
    pub limit: i64,
    pub interval: Duration,
    /// Requests allowed within one concurrency interval
    pub concurrent_requests: i64,
    pub concurrent_requests_interval: Duration,
}

impl RateLimit {
    /// Derive the concurrency sub-quota as a percentage of the limit scaled to
    /// a 24h-equivalent rate. Never less than one request.
    pub fn with_percentage_concurrency(
        limit: i64,
        interval: Duration,
        allowed_models: Vec<String>,
        concurrency: &ConcurrencyConfig,
    ) -> Self {
        let concurrent_requests = if interval.is_zero() || limit <= 0 {
            1
        } else {
            let daily = limit as f64 * (DAY.as_secs_f64() / interval.as_secs_f64());
            ((concurrency.percentage * daily).ceil() as i64).max(1)
        };

        Self {
            allowed_models,
            limit,
            interval,
            concurrent_requests,
            concurrent_requests_interval: concurrency.interval(),
        }
    }

    pub fn from_config(config: &RateLimitConfig, concurrency: &ConcurrencyConfig) -> Self {
        Self::with_percentage_concurrency(
            config.limit,
            config.interval(),
            config.allowed_models.clone(),
            concurrency,
        )
    }

    pub fn is_valid(&self) -> bool {
        !self.interval.is_zero() && self.limit > 0 && !self.allowed_models.is_empty()
    }
}

/// Source errors
#[derive(Error, Debug)]
pub enum SourceError {
    /// The credential does not belong to this source; the registry tries the next one
    #[error("token not from source: {reason}")]
    NotFromSource { reason: String },

    /// A terminal error tagged with the source that produced it
    #[error("{name}: {error}")]
    FromSource {
        name: String,
        #[source]
        error: Box<SourceError>,
    },

    /// The credential belongs to this source but is not valid
    #[error("access denied: {0}")]
    Denied(String),

    /// The actor was refreshed too recently to be refreshed again
    #[error("actor was updated recently")]
    RecentlyUpdated,

    /// The source of truth could not be reached or answered unexpectedly
    #[error("upstream error: {0}")]
    Upstream(String),
}

impl SourceError {
    pub fn is_not_from_source(&self) -> bool {
        matches!(self, SourceError::NotFromSource { .. })
    }

    /// The innermost error, skipping source tags
    pub fn root(&self) -> &SourceError {
        match self {
            SourceError::FromSource { error, .. } => error.root(),
            other => other,
        }
    }
}

/// Resolves credentials into actors
#[async_trait]
pub trait Source: Send + Sync {
    fn name(&self) -> &str;

    /// Resolve `token`. Return [`SourceError::NotFromSource`] for credentials
    /// owned by another source.
    async fn get(&self, token: &str) -> Result<Actor, SourceError>;

    /// Refresh `actor` from the source of truth.
    async fn update(&self, _actor: &mut Actor) -> Result<(), SourceError> {
        Ok(())
    }

    /// Full synchronisation support, if any
    fn syncer(&self) -> Option<&dyn SourceSyncer> {
        None
    }
}

/// Sources able to refresh all of their cached state at once
#[async_trait]
pub trait SourceSyncer: Send + Sync {
    /// Refresh everything; returns the number of items seen.
    async fn sync(&self) -> Result<usize, SourceError>;
}

/// A resolved caller
#[derive(Clone)]
pub struct Actor {
    /// Stable rate limit partition key; empty means no access
    pub id: String,
    /// Raw credential. Never log this.
    pub key: SecretString,
    pub name: Option<String>,
    pub access_enabled: bool,
    pub rate_limits: HashMap<Feature, RateLimit>,
    /// Last refresh from the source of truth
    pub last_updated: Option<DateTime<Utc>>,
    /// Source that resolved this actor, attached by [`Sources::get`]
    pub source: Option<Arc<dyn Source>>,
}

impl fmt::Debug for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Actor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("access_enabled", &self.access_enabled)
            .field("rate_limits", &self.rate_limits)
            .field("last_updated", &self.last_updated)
            .field("source", &self.source_name())
            .finish_non_exhaustive()
    }
}

impl Actor {
    pub fn source_name(&self) -> &str {
        self.source.as_ref().map(|s| s.name()).unwrap_or("unknown")
    }

    /// Refresh this actor through its source.
    pub async fn update(&mut self) -> Result<(), SourceError> {
        match self.source.clone() {
            Some(source) => source.update(self).await,
            None => Ok(()),
        }
    }

    /// Refresh a copy of this actor on a detached task so the next request
    /// sees fresh entitlements. The source refreshes its own cache.
    pub(crate) fn refresh_in_background(&self) {
        if self.source.is_none() {
            return;
        }
        let mut actor = self.clone();
        spawn_detached(async move {
            match actor.update().await {
                Ok(()) => debug!(actor = %actor.id, "refreshed actor after denial"),
                Err(SourceError::RecentlyUpdated) => {
                    debug!(actor = %actor.id, "skipped actor refresh, updated recently")
                }
                Err(e) => warn!(actor = %actor.id, error = %e, "failed to refresh actor"),
            }
        });
    }
}
