use async_trait::async_trait;
use redis::{Script, aio::ConnectionManager};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::LockManager;
use crate::registry::redis::classify;
use crate::registry::store::StoreError;

const RELEASE_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
";

/// Leases as `SET NX PX` keys. Release is compare-and-delete on the owner.
#[derive(Clone)]
pub struct RedisLockManager {
    conn: ConnectionManager,
    namespace: Arc<str>,
    release: Arc<Script>,
}

impl fmt::Debug for RedisLockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisLockManager")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl RedisLockManager {
    #[must_use]
    pub fn new(conn: ConnectionManager, namespace: &str) -> Self {
        Self {
            conn,
            namespace: Arc::from(namespace),
            release: Arc::new(Script::new(RELEASE_SCRIPT)),
        }
    }

    fn lock_key(&self, key: &str) -> String {
        format!("{}:lock:{key}", self.namespace)
    }
}

#[async_trait]
impl LockManager for RedisLockManager {
    async fn try_acquire(&self, key: &str, owner: &str, lease: Duration) -> Result<bool, StoreError> {
        let lease_ms = u64::try_from(lease.as_millis()).unwrap_or(u64::MAX).max(1);
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.lock_key(key))
            .arg(owner)
            .arg("NX")
            .arg("PX")
            .arg(lease_ms)
            .query_async(&mut conn)
            .await
            .map_err(|err| classify(err, "failed to acquire ticket lock"))?;
        Ok(reply.is_some())
    }

    async fn release(&self, key: &str, owner: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let released: i64 = self
            .release
            .key(self.lock_key(key))
            .arg(owner)
            .invoke_async(&mut conn)
            .await
            .map_err(|err| classify(err, "failed to release ticket lock"))?;
        Ok(released == 1)
    }
}
