//! Counter store
//!
//! Quota and alert state lives in an external, TTL-capable key/value store
//! shared by every gateway replica. This module defines the contract the rest
//! of the crate consumes, plus two implementations:
//!
//! - [`RedisStore`]: the production backend, shared across replicas
//! - [`MemoryStore`]: an in-process backend for single-replica deployments and tests
//!
//! [`PrefixedStore`] scopes a store's key namespace without changing semantics,
//! which is how quota keys are separated per feature and per concurrency vs.
//! interval purpose.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// Counter store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("value at key {key} is not an integer")]
    NotAnInteger { key: String },

    #[error("store backend error: {0}")]
    Backend(String),
}

/// TTL-capable key/value counter store.
///
/// TTL values are whole seconds. A negative TTL means the key is absent or
/// carries no expiry, following Redis `TTL` conventions (`-2` absent, `-1` no expiry).
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment the integer at `key` by `amount`, creating it at 0 first if absent.
    async fn incrby(&self, key: &str, amount: i64) -> Result<i64, StoreError>;

    /// Read the integer at `key`; absent keys read as 0.
    async fn get_int(&self, key: &str) -> Result<i64, StoreError>;

    /// Remaining time to live in seconds, negative if absent or without expiry.
    async fn ttl(&self, key: &str) -> Result<i64, StoreError>;

    /// Set the time to live of an existing key.
    async fn expire(&self, key: &str, ttl_secs: i64) -> Result<(), StoreError>;

    /// Overwrite `key` with `value` and the given time to live.
    async fn set_ex(&self, key: &str, value: i64, ttl_secs: i64) -> Result<(), StoreError>;

    /// Delete `key`.
    async fn del(&self, key: &str) -> Result<(), StoreError>;
}

/// Shared handle to a counter store
pub type SharedStore = Arc<dyn CounterStore>;

/// Decorator that prepends a fixed prefix to every key.
///
/// Prefixed stores compose: wrapping a prefixed store prepends the outer prefix
/// after the inner one has been applied, so `PrefixedStore::new("a:", PrefixedStore::new("b:", s))`
/// writes `b:a:key` to `s`.
#[derive(Clone)]
pub struct PrefixedStore {
    prefix: String,
    inner: SharedStore,
}

impl PrefixedStore {
    pub fn new(prefix: impl Into<String>, inner: SharedStore) -> Self {
        Self {
            prefix: prefix.into(),
            inner,
        }
    }

    /// The prefix this store applies
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

#[async_trait]
impl CounterStore for PrefixedStore {
    async fn incrby(&self, key: &str, amount: i64) -> Result<i64, StoreError> {
        self.inner.incrby(&self.key(key), amount).await
    }

    async fn get_int(&self, key: &str) -> Result<i64, StoreError> {
        self.inner.get_int(&self.key(key)).await
    }

    async fn ttl(&self, key: &str) -> Result<i64, StoreError> {
        self.inner.ttl(&self.key(key)).await
    }

    async fn expire(&self, key: &str, ttl_secs: i64) -> Result<(), StoreError> {
        self.inner.expire(&self.key(key), ttl_secs).await
    }

    async fn set_ex(&self, key: &str, value: i64, ttl_secs: i64) -> Result<(), StoreError> {
        self.inner.set_ex(&self.key(key), value, ttl_secs).await
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.inner.del(&self.key(key)).await
    }
}
