use super::scripts::{EXTEND_SCRIPT, RELEASE_SCRIPT};
use super::LockBackend;
use crate::store::{RedisStore, StoreError};
use async_trait::async_trait;
use redis::Script;
use std::time::Duration;

fn millis(ttl: Duration) -> u64 {
    ttl.as_millis().max(1) as u64
}

#[async_trait]
impl LockBackend for RedisStore {
    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.connection();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn extend_if_owner(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.connection();
        let extended: i64 = Script::new(EXTEND_SCRIPT)
            .key(key)
            .arg(token)
            .arg(millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(extended == 1)
    }

    async fn delete_if_owner(&self, key: &str, token: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection();
        let released: i64 = Script::new(RELEASE_SCRIPT)
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(released == 1)
    }
}

#[cfg(test)]
mod tests {
    use crate::lock::{LockError, Mutex, MutexOptions};
    use crate::store::RedisStore;
    use std::sync::Arc;
    use std::time::Duration;

    // Note: requires a running Redis instance. Run with: cargo test -- --ignored

    #[tokio::test]
    #[ignore]
    async fn test_redis_mutex_fencing() {
        let store = Arc::new(
            RedisStore::connect("redis://127.0.0.1:6379")
                .await
                .expect("Failed to connect to Redis"),
        );
        let name = format!("test-lock-{}", rand::random::<u32>());
        let options = MutexOptions {
            expiry: Duration::from_secs(5),
            tries: 1,
            retry_delay: Duration::from_millis(10),
        };

        let mut a = Mutex::new(name.clone(), store.clone(), options.clone());
        let mut b = Mutex::new(name, store, options);

        a.lock().await.unwrap();
        assert!(matches!(b.lock().await, Err(LockError::Taken { .. })));
        assert!(matches!(b.unlock().await, Err(LockError::NotHeld { .. })));
        a.extend().await.unwrap();
        a.unlock().await.unwrap();
        b.lock().await.unwrap();
        b.unlock().await.unwrap();
    }
}
