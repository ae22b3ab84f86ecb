use std::sync::Arc;
use tracing::warn;

use super::TicketRegistry;
use super::lock::{LockConfig, LockManager, TicketLocks};
use crate::error::Result;
use crate::ticket::{Ticket, TicketKind};

/// Registry decorator that serializes read-modify-write cycles on one ticket
/// behind a leased lock. The version check still runs underneath, so a writer
/// that bypasses the lock cannot silently overwrite a locked update.
#[derive(Clone, Debug)]
pub struct LockingTicketRegistry {
    registry: TicketRegistry,
    locks: TicketLocks,
}

impl LockingTicketRegistry {
    #[must_use]
    pub fn new(registry: TicketRegistry, manager: Arc<dyn LockManager>, config: LockConfig, node: &str) -> Self {
        Self {
            registry,
            locks: TicketLocks::new(manager, config, node),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &TicketRegistry {
        &self.registry
    }

    /// Lock `id`, read it, apply `mutate`, write it back, unlock.
    ///
    /// # Errors
    ///
    /// `Contention` when the lock cannot be taken in time, plus any error from
    /// the read, the mutation or the write.
    pub async fn with_lock<T, F>(&self, id: &str, expected: TicketKind, mutate: F) -> Result<(Ticket, T)>
    where
        F: FnOnce(&mut Ticket) -> Result<T> + Send,
        T: Send,
    {
        // Lock names follow storage ids so plaintext ids never reach the
        // lock backend of an encrypted registry.
        let guard = self.locks.acquire(&self.registry.storage_id(id)).await?;
        let result = async {
            let mut ticket = self.registry.get_ticket(id, expected).await?;
            let output = mutate(&mut ticket)?;
            let updated = self.registry.update_ticket(&ticket).await?;
            Ok((updated, output))
        }
        .await;
        if let Err(err) = guard.release().await {
            warn!(ticket_id = id, "failed to release ticket lock: {err}");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::TicketError;
    use crate::registry::{MemoryTicketStore, TicketCipher, cipher::KEY_LENGTH, lock::MemoryLockManager};
    use crate::ticket::{Authentication, ExpirationPolicy, TicketGrantingTicket, TicketState};
    use chrono::Utc;
    use std::time::Duration;

    fn locking() -> LockingTicketRegistry {
        let registry = TicketRegistry::new(
            Arc::new(MemoryTicketStore::new()),
            Arc::new(ManualClock::new(Utc::now())),
        );
        LockingTicketRegistry::new(
            registry,
            Arc::new(MemoryLockManager::new()),
            LockConfig::new().with_wait_timeout(Duration::from_secs(5)),
            "node-a",
        )
    }

    async fn seed(locking: &LockingTicketRegistry) {
        let now = locking.registry().clock().now();
        let ticket = Ticket::TicketGranting(TicketGrantingTicket::new(
            TicketState::new("TGT-1-a", ExpirationPolicy::NeverExpires, now),
            Authentication::new("casuser", now),
        ));
        assert!(locking.registry().add_ticket(&ticket).await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_locked_updates_are_not_lost() {
        let locking = locking();
        seed(&locking).await;

        let mut tasks = Vec::new();
        for i in 0..16 {
            let locking = locking.clone();
            tasks.push(tokio::spawn(async move {
                let now = locking.registry().clock().now();
                locking
                    .with_lock("TGT-1-a", TicketKind::TicketGranting, move |ticket| {
                        ticket.record_use(now)?;
                        if let Some(tgt) = ticket.as_ticket_granting_mut() {
                            tgt.record_service(
                                format!("ST-{i}-a"),
                                crate::ticket::Service::new("https://app.example.org"),
                            );
                        }
                        Ok(())
                    })
                    .await
            }));
        }
        for task in tasks {
            assert!(matches!(task.await, Ok(Ok(_))));
        }

        let stored = locking
            .registry()
            .get_ticket("TGT-1-a", TicketKind::TicketGranting)
            .await;
        assert!(stored.is_ok_and(|t| {
            t.count_of_uses() == 16
                && t.version() == 16
                && t.as_ticket_granting().is_some_and(|tgt| tgt.services().len() == 16)
        }));
    }

    #[tokio::test]
    async fn failed_mutation_releases_lock() {
        let locking = locking();
        seed(&locking).await;

        let failed: Result<(Ticket, ())> = locking
            .with_lock("TGT-1-a", TicketKind::TicketGranting, |ticket| {
                Err(TicketError::NotFound(ticket.id().to_string()))
            })
            .await;
        assert!(failed.is_err());

        let next = locking
            .with_lock("TGT-1-a", TicketKind::TicketGranting, |_| Ok(()))
            .await;
        assert!(next.is_ok());
    }

    #[tokio::test]
    async fn encrypted_registry_locks_by_digest() {
        let Ok(cipher) = TicketCipher::new(&[5; KEY_LENGTH]) else {
            panic!("valid key rejected");
        };
        let registry = TicketRegistry::new(
            Arc::new(MemoryTicketStore::new()),
            Arc::new(ManualClock::new(Utc::now())),
        )
        .with_cipher(cipher);
        let manager: Arc<dyn LockManager> = Arc::new(MemoryLockManager::new());
        let config = LockConfig::new().with_wait_timeout(Duration::from_millis(50));
        let locking = LockingTicketRegistry::new(registry, Arc::clone(&manager), config, "node-a");
        seed(&locking).await;

        let other = TicketLocks::new(manager, config, "node-b");
        let Ok(plain) = other.acquire("TGT-1-a").await else {
            panic!("plain id lock unavailable");
        };
        let unaffected = locking
            .with_lock("TGT-1-a", TicketKind::TicketGranting, |_| Ok(()))
            .await;
        assert!(unaffected.is_ok());
        assert!(plain.release().await.is_ok());

        let digest = locking.registry().storage_id("TGT-1-a").into_owned();
        let Ok(held) = other.acquire(&digest).await else {
            panic!("digest lock unavailable");
        };
        let blocked = locking
            .with_lock("TGT-1-a", TicketKind::TicketGranting, |_| Ok(()))
            .await;
        assert!(matches!(blocked, Err(TicketError::Contention(_))));
        assert!(held.release().await.is_ok());
    }
}
