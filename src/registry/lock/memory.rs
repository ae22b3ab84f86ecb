use async_trait::async_trait;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

use super::LockManager;
use crate::registry::store::StoreError;

#[derive(Debug)]
struct Lease {
    owner: String,
    expires_at: Instant,
}

/// Process-local leases, for single node deployments and tests.
#[derive(Debug, Default)]
pub struct MemoryLockManager {
    leases: DashMap<String, Lease>,
}

impl MemoryLockManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockManager for MemoryLockManager {
    async fn try_acquire(&self, key: &str, owner: &str, lease: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut entry = self.leases.entry(key.to_string()).or_insert_with(|| Lease {
            owner: String::new(),
            expires_at: now,
        });
        if entry.expires_at > now && entry.owner != owner {
            return Ok(false);
        }
        entry.owner = owner.to_string();
        entry.expires_at = now + lease;
        Ok(true)
    }

    async fn release(&self, key: &str, owner: &str) -> Result<bool, StoreError> {
        Ok(self
            .leases
            .remove_if(key, |_, lease| lease.owner == owner)
            .is_some())
    }
}
