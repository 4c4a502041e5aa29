use super::{CounterStore, StoreError};
use crate::lock::LockBackend;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// In-process counter store and lock backend.
///
/// Expiry is evaluated lazily against [`tokio::time::Instant`], so tests running
/// with a paused clock can advance time deterministically. A single
/// `MemoryStore` shared between several limiters or lock holders behaves like a
/// shared Redis instance would.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<DashMap<String, Entry>>,
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Int(i64),
    Token(String),
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys (for testing/monitoring)
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop the entry at `key` if it has expired, returning whether it is live.
    fn purge_expired(&self, key: &str, now: Instant) -> bool {
        self.entries.remove_if(key, |_, e| e.is_expired(now));
        self.entries.contains_key(key)
    }
}

/// Seconds remaining, rounded to the nearest second like Redis `TTL` does.
fn remaining_secs(expires_at: Instant, now: Instant) -> i64 {
    let remaining = expires_at.saturating_duration_since(now);
    ((remaining.as_millis() + 500) / 1000) as i64
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn incrby(&self, key: &str, amount: i64) -> Result<i64, StoreError> {
        let now = Instant::now();
        self.purge_expired(key, now);

        let mut entry = self.entries.entry(key.to_string()).or_insert(Entry {
            value: Value::Int(0),
            expires_at: None,
        });
        match &mut entry.value {
            Value::Int(v) => {
                *v += amount;
                Ok(*v)
            }
            Value::Token(_) => Err(StoreError::NotAnInteger {
                key: key.to_string(),
            }),
        }
    }

    async fn get_int(&self, key: &str) -> Result<i64, StoreError> {
        if !self.purge_expired(key, Instant::now()) {
            return Ok(0);
        }
        match self.entries.get(key).map(|e| e.value.clone()) {
            Some(Value::Int(v)) => Ok(v),
            Some(Value::Token(_)) => Err(StoreError::NotAnInteger {
                key: key.to_string(),
            }),
            None => Ok(0),
        }
    }

    async fn ttl(&self, key: &str) -> Result<i64, StoreError> {
        let now = Instant::now();
        if !self.purge_expired(key, now) {
            return Ok(-2);
        }
        Ok(match self.entries.get(key).and_then(|e| e.expires_at) {
            Some(at) => remaining_secs(at, now),
            None => -1,
        })
    }

    async fn expire(&self, key: &str, ttl_secs: i64) -> Result<(), StoreError> {
        let now = Instant::now();
        if !self.purge_expired(key, now) {
            return Ok(());
        }
        if ttl_secs <= 0 {
            self.entries.remove(key);
            return Ok(());
        }
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.expires_at = Some(now + Duration::from_secs(ttl_secs as u64));
        }
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: i64, ttl_secs: i64) -> Result<(), StoreError> {
        if ttl_secs <= 0 {
            return Err(StoreError::Backend(format!(
                "invalid expire time {} for key {}",
                ttl_secs, key
            )));
        }
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Int(value),
                expires_at: Some(Instant::now() + Duration::from_secs(ttl_secs as u64)),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }
}

#[async_trait]
impl LockBackend for MemoryStore {
    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        self.purge_expired(key, now);

        match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(_) => Ok(false),
            MapEntry::Vacant(slot) => {
                slot.insert(Entry {
                    value: Value::Token(token.to_string()),
                    expires_at: Some(now + ttl),
                });
                Ok(true)
            }
        }
    }

    async fn extend_if_owner(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        self.purge_expired(key, now);

        match self.entries.get_mut(key) {
            Some(mut entry) if entry.value == Value::Token(token.to_string()) => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_if_owner(&self, key: &str, token: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        self.purge_expired(key, now);

        let owned = Value::Token(token.to_string());
        Ok(self.entries.remove_if(key, |_, e| e.value == owned).is_some())
    }
}
