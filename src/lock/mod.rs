//! Distributed locks
//!
//! An owner-fenced mutex on top of a shared key/value backend. Every
//! [`Mutex`] holds a random owner token; only the holder of that token may
//! extend or release the lock, and locks expire on their own so a crashed
//! holder cannot block others for longer than the configured expiry.
//!
//! Used for sync leadership ([`crate::actor::SyncWorker`]) and alert
//! deduplication ([`crate::notify::ThresholdNotifier`]).

pub mod redis;
pub mod scripts;

use crate::store::StoreError;
use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

/// Lock errors
#[derive(Error, Debug)]
pub enum LockError {
    /// Another owner holds the lock
    #[error("lock {name} is already taken")]
    Taken { name: String },

    /// The lock was acquired but its validity ran out before the operation completed
    #[error("lock {name} expired before it could be used")]
    Expired { name: String },

    /// Extend or release attempted without holding the lock
    #[error("lock {name} is not held by this owner")]
    NotHeld { name: String },

    #[error("lock store error: {0}")]
    Store(#[from] StoreError),
}

impl LockError {
    /// Contention outcomes are expected in a fleet and are not failures
    pub fn is_contention(&self) -> bool {
        matches!(self, LockError::Taken { .. } | LockError::Expired { .. })
    }
}

/// Atomic primitives a lock backend must provide
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Set `key` to `token` with `ttl` only if `key` does not exist.
    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Reset the expiry of `key` to `ttl` only if it currently holds `token`.
    async fn extend_if_owner(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Delete `key` only if it currently holds `token`.
    async fn delete_if_owner(&self, key: &str, token: &str) -> Result<bool, StoreError>;
}

/// Shared handle to a lock backend
pub type SharedLockBackend = Arc<dyn LockBackend>;

/// Mutex options
#[derive(Debug, Clone)]
pub struct MutexOptions {
    /// How long the lock stays valid after acquire or extend
    pub expiry: Duration,
    /// Number of acquisition attempts before giving up
    pub tries: u32,
    /// Base delay between acquisition attempts, jittered up to 2x
    pub retry_delay: Duration,
}

impl Default for MutexOptions {
    fn default() -> Self {
        Self {
            expiry: Duration::from_secs(8),
            tries: 32,
            retry_delay: Duration::from_millis(50),
        }
    }
}

/// Owner-fenced distributed mutex
pub struct Mutex {
    name: String,
    token: String,
    options: MutexOptions,
    backend: SharedLockBackend,
    /// Local belief of when our hold expires; `None` when not held
    until: Option<Instant>,
}

impl std::fmt::Debug for Mutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutex")
            .field("name", &self.name)
            .field("options", &self.options)
            .field("until", &self.until)
            .finish()
    }
}

impl Mutex {
    pub fn new(name: impl Into<String>, backend: SharedLockBackend, options: MutexOptions) -> Self {
        Self {
            name: name.into(),
            token: Uuid::new_v4().to_string(),
            options,
            backend,
            until: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// When this owner's hold expires, or `None` if it does not hold the lock.
    ///
    /// This is local bookkeeping: a returned instant in the past means the hold
    /// has lapsed and another owner may have taken over.
    pub fn until(&self) -> Option<Instant> {
        self.until
    }

    /// Whether this owner holds the lock and the hold has not lapsed
    pub fn is_held(&self) -> bool {
        matches!(self.until, Some(until) if until > Instant::now())
    }

    /// Acquire the lock, retrying up to the configured number of tries.
    pub async fn lock(&mut self) -> Result<(), LockError> {
        let tries = self.options.tries.max(1);
        for attempt in 0..tries {
            if attempt > 0 {
                tokio::time::sleep(self.jittered_delay()).await;
            }
            match self.try_lock().await {
                Ok(()) => return Ok(()),
                Err(LockError::Taken { .. }) => {
                    debug!(lock = %self.name, attempt, "lock taken, retrying");
                }
                Err(e) => return Err(e),
            }
        }
        Err(LockError::Taken {
            name: self.name.clone(),
        })
    }

    /// Single acquisition attempt.
    pub async fn try_lock(&mut self) -> Result<(), LockError> {
        let start = Instant::now();
        let acquired = self
            .backend
            .set_if_absent(&self.name, &self.token, self.options.expiry)
            .await?;
        if !acquired {
            return Err(LockError::Taken {
                name: self.name.clone(),
            });
        }

        let until = start + self.options.expiry;
        if until <= Instant::now() {
            // The backend round trip outlived the lock validity
            self.until = None;
            return Err(LockError::Expired {
                name: self.name.clone(),
            });
        }
        self.until = Some(until);
        debug!(lock = %self.name, "lock acquired");
        Ok(())
    }

    /// Reset the lock's expiry. Only succeeds for the current holder.
    pub async fn extend(&mut self) -> Result<(), LockError> {
        let start = Instant::now();
        let extended = self
            .backend
            .extend_if_owner(&self.name, &self.token, self.options.expiry)
            .await?;
        if !extended {
            self.until = None;
            return Err(LockError::NotHeld {
                name: self.name.clone(),
            });
        }
        self.until = Some(start + self.options.expiry);
        Ok(())
    }

    /// Release the lock. Only succeeds for the current holder.
    pub async fn unlock(&mut self) -> Result<(), LockError> {
        let released = self
            .backend
            .delete_if_owner(&self.name, &self.token)
            .await;
        self.until = None;
        if !released? {
            return Err(LockError::NotHeld {
                name: self.name.clone(),
            });
        }
        debug!(lock = %self.name, "lock released");
        Ok(())
    }

    fn jittered_delay(&self) -> Duration {
        let base = self.options.retry_delay;
        if base.is_zero() {
            return base;
        }
        let extra = rand::thread_rng().gen_range(0..=base.as_millis() as u64);
        base + Duration::from_millis(extra)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn mutex(backend: &Arc<MemoryStore>, tries: u32) -> Mutex {
        Mutex::new(
            "test-lock",
            backend.clone(),
            MutexOptions {
                expiry: Duration::from_secs(10),
                tries,
                retry_delay: Duration::from_millis(1),
            },
        )
    }

    #[tokio::test]
    async fn test_only_one_holder() {
        let backend = Arc::new(MemoryStore::new());
        let mut a = mutex(&backend, 1);
        let mut b = mutex(&backend, 3);

        a.lock().await.unwrap();
        assert!(a.is_held());

        let err = b.lock().await.unwrap_err();
        assert!(err.is_contention());
        assert!(b.until().is_none());

        // Only the holder may extend or release
        assert!(matches!(b.extend().await, Err(LockError::NotHeld { .. })));
        assert!(matches!(b.unlock().await, Err(LockError::NotHeld { .. })));
        assert!(a.extend().await.is_ok());

        a.unlock().await.unwrap();
        assert!(!a.is_held());
        b.lock().await.unwrap();
        assert!(b.is_held());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lapsed_hold_cannot_be_extended() {
        let backend = Arc::new(MemoryStore::new());
        let mut a = mutex(&backend, 1);
        let mut b = mutex(&backend, 1);

        a.lock().await.unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!a.is_held());
        assert!(a.until().is_some());

        b.lock().await.unwrap();
        assert!(matches!(a.extend().await, Err(LockError::NotHeld { .. })));
        assert!(a.until().is_none());
        assert!(b.is_held());
    }

    #[test]
    fn test_contention_classification() {
        let name = "x".to_string();
        assert!(LockError::Taken { name: name.clone() }.is_contention());
        assert!(LockError::Expired { name: name.clone() }.is_contention());
        assert!(!LockError::NotHeld { name }.is_contention());
    }
}
