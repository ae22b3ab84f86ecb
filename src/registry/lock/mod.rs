//! Leased locks for read-modify-write cycles across nodes.
//!
//! Locks are leases: a holder that dies simply lets the lease run out. Release
//! only succeeds for the owner token that acquired the lease, so a holder whose
//! lease expired cannot release someone else's lock.

pub mod memory;
pub mod postgres;
#[cfg(feature = "redis")]
pub mod redis;

use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

use super::retry::backoff_delay;
use super::store::StoreError;
use crate::error::{Result, TicketError};

pub use memory::MemoryLockManager;
pub use postgres::PostgresLockManager;
#[cfg(feature = "redis")]
pub use self::redis::RedisLockManager;

#[async_trait]
pub trait LockManager: Send + Sync + Debug {
    /// Take the lease on `key` for `lease` if it is free or expired.
    async fn try_acquire(&self, key: &str, owner: &str, lease: Duration) -> Result<bool, StoreError>;

    /// Give the lease back if `owner` still holds it.
    async fn release(&self, key: &str, owner: &str) -> Result<bool, StoreError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockConfig {
    lease: Duration,
    wait_timeout: Duration,
    poll_base: Duration,
    poll_max: Duration,
}

impl LockConfig {
    /// Default config: 5s lease, wait up to 3s, poll 10ms->200ms with jitter.
    #[must_use]
    pub fn new() -> Self {
        Self {
            lease: Duration::from_secs(5),
            wait_timeout: Duration::from_secs(3),
            poll_base: Duration::from_millis(10),
            poll_max: Duration::from_millis(200),
        }
    }

    #[must_use]
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    #[must_use]
    pub fn with_wait_timeout(mut self, wait_timeout: Duration) -> Self {
        self.wait_timeout = wait_timeout;
        self
    }

    #[must_use]
    pub fn lease(&self) -> Duration {
        self.lease
    }

    #[must_use]
    pub fn wait_timeout(&self) -> Duration {
        self.wait_timeout
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Acquires ticket locks with bounded waiting.
#[derive(Clone, Debug)]
pub struct TicketLocks {
    manager: Arc<dyn LockManager>,
    config: LockConfig,
    node: Arc<str>,
}

impl TicketLocks {
    #[must_use]
    pub fn new(manager: Arc<dyn LockManager>, config: LockConfig, node: &str) -> Self {
        Self {
            manager,
            config,
            node: Arc::from(node),
        }
    }

    /// Wait for the lock on `key` up to the configured timeout.
    ///
    /// # Errors
    ///
    /// `Contention` when the lock stays taken, `Registry` when the lock
    /// backend fails.
    pub async fn acquire(&self, key: &str) -> Result<LockGuard> {
        let owner = format!("{}:{}", self.node, ulid::Ulid::new());
        let deadline = Instant::now() + self.config.wait_timeout;
        let mut attempt = 1;
        loop {
            let acquired = self
                .manager
                .try_acquire(key, &owner, self.config.lease)
                .await
                .map_err(|err| TicketError::Registry(anyhow::Error::new(err)))?;
            if acquired {
                debug!(lock_key = key, owner = %owner, "ticket lock acquired");
                return Ok(LockGuard {
                    manager: Arc::clone(&self.manager),
                    key: key.to_string(),
                    owner,
                    released: false,
                });
            }
            let delay = backoff_delay(attempt, self.config.poll_base, self.config.poll_max);
            if Instant::now() + delay > deadline {
                return Err(TicketError::Contention(key.to_string()));
            }
            sleep(delay).await;
            attempt += 1;
        }
    }
}

/// Held lease. Call [`release`](Self::release) when done; a guard dropped
/// without it releases in the background, and the lease covers the rest.
#[derive(Debug)]
pub struct LockGuard {
    manager: Arc<dyn LockManager>,
    key: String,
    owner: String,
    released: bool,
}

impl LockGuard {
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// # Errors
    ///
    /// Returns the lock backend error; the lease still expires on its own.
    pub async fn release(mut self) -> Result<(), StoreError> {
        self.released = true;
        let released = self.manager.release(&self.key, &self.owner).await?;
        if !released {
            warn!(lock_key = %self.key, "lock lease expired before release");
        }
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let manager = Arc::clone(&self.manager);
            let key = std::mem::take(&mut self.key);
            let owner = std::mem::take(&mut self.owner);
            handle.spawn(async move {
                if let Err(err) = manager.release(&key, &owner).await {
                    warn!(lock_key = %key, "failed to release dropped lock: {err}");
                }
            });
        }
    }
}
