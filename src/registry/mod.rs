//! Ticket registry.
//!
//! [`TicketRegistry`] is the only way to reach stored tickets. It adds to any
//! [`TicketStore`]:
//!
//! - **Lazy expiration**: reads evaluate the ticket's policy against the
//!   registry clock; an expired ticket is reported as not found and queued
//!   for deletion.
//! - **Kind checks**: typed lookups refuse tickets of the wrong kind.
//! - **Optimistic concurrency**: updates are compare-and-swap on the ticket
//!   version, so two nodes can never both win a read-modify-write.
//! - **Cascade delete**: removing a root removes everything issued under it,
//!   children first.
//! - **Bounded retries**: transient backend failures are retried with
//!   backoff and a per-attempt timeout. A write whose retry conflicts with
//!   itself is checked against the stored copy, so an attempt that landed
//!   before timing out is not reported as a failure.
//! - **Encryption**: with a [`TicketCipher`], stores only ever see digested
//!   ids and sealed tickets.

pub mod cipher;
pub mod cleaner;
pub mod lock;
pub mod locking;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;
pub mod retry;
pub mod postgres;
pub mod store;

use anyhow::anyhow;
use serde::Serialize;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{Result, TicketError};
use crate::ticket::{Ticket, TicketKind};

pub use cipher::TicketCipher;
pub use cleaner::{CleanerConfig, CleanupReport, RegistryCleaner, spawn_cleaner};
pub use lock::{LockConfig, LockGuard, LockManager, TicketLocks};
pub use locking::LockingTicketRegistry;
pub use memory::MemoryTicketStore;
pub use retry::RetryPolicy;
pub use store::{ScanPage, StoreError, TicketStore};

/// Page size used when scanning the whole store.
pub const SCAN_PAGE_SIZE: usize = 500;

/// Compare-and-swap attempts in [`TicketRegistry::update_with`]. Each lost
/// attempt means another writer won, so this bounds the number of concurrent
/// writers a single update can outlast.
pub const UPDATE_ATTEMPTS: u32 = 64;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub backend: &'static str,
    pub total: usize,
    pub expired: usize,
    pub by_kind: BTreeMap<TicketKind, usize>,
}

#[derive(Clone, Debug)]
pub struct TicketRegistry {
    store: Arc<dyn TicketStore>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    cipher: Option<TicketCipher>,
}

impl TicketRegistry {
    #[must_use]
    pub fn new(store: Arc<dyn TicketStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            retry: RetryPolicy::default(),
            cipher: None,
        }
    }

    /// Encrypt tickets before they reach the store. Every node sharing the
    /// store must use the same key.
    #[must_use]
    pub fn with_cipher(mut self, cipher: TicketCipher) -> Self {
        self.cipher = Some(cipher);
        self
    }

    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry.normalize();
        self
    }

    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    #[must_use]
    pub fn backend(&self) -> &'static str {
        self.store.name()
    }

    /// Key the store knows `id` by: the id itself, or its digest when the
    /// registry encrypts.
    #[must_use]
    pub fn storage_id<'a>(&self, id: &'a str) -> Cow<'a, str> {
        match &self.cipher {
            Some(cipher) => Cow::Owned(cipher.digest_id(id)),
            None => Cow::Borrowed(id),
        }
    }

    fn seal<'a>(&self, ticket: &'a Ticket) -> Result<Cow<'a, Ticket>> {
        match &self.cipher {
            Some(cipher) => cipher
                .encode(ticket)
                .map(Cow::Owned)
                .map_err(|err| into_ticket_error(err, ticket.id())),
            None => Ok(Cow::Borrowed(ticket)),
        }
    }

    fn open(&self, stored: Ticket) -> Result<Ticket, StoreError> {
        match &self.cipher {
            Some(cipher) => cipher.decode(&stored),
            None => Ok(stored),
        }
    }

    /// Persist a new ticket.
    ///
    /// # Errors
    ///
    /// `AlreadyExists` when the id is taken, `Registry` when the backend
    /// keeps failing.
    pub async fn add_ticket(&self, ticket: &Ticket) -> Result<()> {
        let sealed = self.seal(ticket)?;
        let store = &self.store;
        let (result, retried) = self
            .retry
            .run_write("insert", || store.insert(sealed.as_ref()))
            .await;
        if let Err(err) = result {
            // An earlier attempt may have stored it before timing out.
            let own_write = retried
                && matches!(err, StoreError::Duplicate(_))
                && self.load(ticket.id()).await?.as_ref() == Some(ticket);
            if !own_write {
                return Err(into_ticket_error(err, ticket.id()));
            }
            debug!(ticket_id = ticket.id(), "insert retry found its own write");
        }
        debug!(
            ticket_id = ticket.id(),
            kind = %ticket.kind(),
            backend = self.backend(),
            "ticket added"
        );
        Ok(())
    }

    /// Fetch a live ticket of the expected kind.
    ///
    /// # Errors
    ///
    /// `NotFound` when absent or expired, `UnexpectedKind` when the stored
    /// ticket is of another kind.
    pub async fn get_ticket(&self, id: &str, expected: TicketKind) -> Result<Ticket> {
        let ticket = self.find_ticket(id).await?;
        if ticket.kind() != expected {
            return Err(TicketError::UnexpectedKind {
                id: id.to_string(),
                expected,
                actual: ticket.kind(),
            });
        }
        Ok(ticket)
    }

    /// Fetch a live ticket of any kind.
    ///
    /// # Errors
    ///
    /// `NotFound` when absent or expired.
    pub async fn find_ticket(&self, id: &str) -> Result<Ticket> {
        let Some(ticket) = self.load(id).await? else {
            return Err(TicketError::NotFound(id.to_string()));
        };
        if ticket.is_expired(self.clock.now()) {
            debug!(ticket_id = id, "ticket expired on read, scheduling removal");
            self.schedule_delete(id);
            return Err(TicketError::NotFound(id.to_string()));
        }
        Ok(ticket)
    }

    async fn load(&self, id: &str) -> Result<Option<Ticket>> {
        let key = self.storage_id(id);
        let store = &self.store;
        self.retry
            .run("load", || store.load(&key))
            .await
            .and_then(|stored| stored.map(|ticket| self.open(ticket)).transpose())
            .map_err(|err| into_ticket_error(err, id))
    }

    /// Whether `id` is stored at all, expired or not.
    ///
    /// # Errors
    ///
    /// `Registry` when the backend keeps failing.
    pub async fn contains(&self, id: &str) -> Result<bool> {
        Ok(self.load(id).await?.is_some())
    }

    fn schedule_delete(&self, id: &str) {
        let registry = self.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            if let Err(err) = registry.delete_ticket(&id).await {
                warn!(ticket_id = %id, "failed to remove expired ticket: {err}");
            }
        });
    }

    /// Write back a modified ticket. The ticket must carry the version it was
    /// read with; the returned copy carries the new version.
    ///
    /// # Errors
    ///
    /// `Contention` when another writer updated the ticket first or it was
    /// deleted in between.
    pub async fn update_ticket(&self, ticket: &Ticket) -> Result<Ticket> {
        let expected = ticket.version();
        let mut next = ticket.clone();
        next.state_mut().set_version(expected.wrapping_add(1));
        let sealed = self.seal(&next)?;

        let store = &self.store;
        let (result, retried) = self
            .retry
            .run_write("compare_and_swap", || {
                store.compare_and_swap(sealed.as_ref(), expected)
            })
            .await;
        let swapped = result.map_err(|err| into_ticket_error(err, ticket.id()))?;
        if swapped {
            return Ok(next);
        }
        // A retried swap loses to its own earlier attempt when that attempt
        // landed; the stored copy then already is `next`.
        if retried && self.load(ticket.id()).await?.as_ref() == Some(&next) {
            debug!(ticket_id = ticket.id(), "update retry found its own write");
            return Ok(next);
        }
        Err(TicketError::Contention(ticket.id().to_string()))
    }

    /// Read-modify-write with optimistic retries. `mutate` may run several
    /// times and must only touch the ticket it is given.
    ///
    /// # Errors
    ///
    /// Errors from `mutate` abort without writing. `Contention` when the
    /// ticket keeps changing under us.
    pub async fn update_with<T, F>(&self, id: &str, expected: TicketKind, mut mutate: F) -> Result<(Ticket, T)>
    where
        F: FnMut(&mut Ticket) -> Result<T> + Send,
        T: Send,
    {
        for attempt in 1..=UPDATE_ATTEMPTS {
            let mut ticket = self.get_ticket(id, expected).await?;
            let output = mutate(&mut ticket)?;
            match self.update_ticket(&ticket).await {
                Ok(updated) => return Ok((updated, output)),
                Err(TicketError::Contention(_)) => {
                    debug!(ticket_id = id, attempt, "ticket update lost a race, retrying");
                    tokio::task::yield_now().await;
                }
                Err(err) => return Err(err),
            }
        }
        Err(TicketError::Contention(id.to_string()))
    }

    /// Delete a ticket and, for roots, everything issued under it. Children
    /// go first so a crash midway leaves the root in place for another try.
    /// Returns whether the ticket itself existed.
    ///
    /// # Errors
    ///
    /// `Registry` when the backend keeps failing. Already removed tickets are
    /// not an error.
    pub async fn delete_ticket(&self, id: &str) -> Result<bool> {
        let key = self.storage_id(id);
        let store = &self.store;
        let descendants = self
            .retry
            .run("descendants", || store.descendants(&key))
            .await
            .map_err(|err| into_ticket_error(err, id))?;

        for child in descendants.iter().rev() {
            self.remove(child).await?;
        }
        let existed = self.remove(&key).await?;
        if existed || !descendants.is_empty() {
            debug!(
                ticket_id = id,
                cascaded = descendants.len(),
                "ticket deleted"
            );
        }
        Ok(existed)
    }

    /// Remove by storage id.
    async fn remove(&self, key: &str) -> Result<bool> {
        let store = &self.store;
        self.retry
            .run("remove", || store.remove(key))
            .await
            .map_err(|err| into_ticket_error(err, key))
    }

    /// Every stored ticket matching `predicate`, expired ones included. This
    /// is the cleaner's and reporting path; validation must use
    /// [`get_ticket`](Self::get_ticket).
    ///
    /// # Errors
    ///
    /// `Registry` when the backend keeps failing.
    pub async fn get_tickets<P>(&self, predicate: P) -> Result<Vec<Ticket>>
    where
        P: Fn(&Ticket) -> bool + Send + Sync,
    {
        let mut matched = Vec::new();
        let mut cursor = None;
        let store = &self.store;
        loop {
            let page = self
                .retry
                .run("scan", || store.scan(cursor.clone(), SCAN_PAGE_SIZE))
                .await
                .map_err(|err| into_ticket_error(err, "*"))?;
            for stored in page.tickets {
                let ticket = self
                    .open(stored)
                    .map_err(|err| into_ticket_error(err, "*"))?;
                if predicate(&ticket) {
                    matched.push(ticket);
                }
            }
            match page.next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(matched)
    }

    /// # Errors
    ///
    /// `Registry` when the backend keeps failing.
    pub async fn expired_tickets(&self) -> Result<Vec<Ticket>> {
        let now = self.clock.now();
        self.get_tickets(move |ticket| ticket.is_expired(now)).await
    }

    /// # Errors
    ///
    /// `Registry` when the backend keeps failing.
    pub async fn count_tickets(&self) -> Result<usize> {
        let store = &self.store;
        self.retry
            .run("count", || store.count())
            .await
            .map_err(|err| into_ticket_error(err, "*"))
    }

    /// Live and expired counts per kind.
    ///
    /// # Errors
    ///
    /// `Registry` when the backend keeps failing.
    pub async fn stats(&self) -> Result<RegistryStats> {
        let now = self.clock.now();
        let tickets = self.get_tickets(|_| true).await?;
        let mut stats = RegistryStats {
            backend: self.backend(),
            total: tickets.len(),
            ..RegistryStats::default()
        };
        for ticket in &tickets {
            *stats.by_kind.entry(ticket.kind()).or_default() += 1;
            if ticket.is_expired(now) {
                stats.expired += 1;
            }
        }
        Ok(stats)
    }

    /// Remove every ticket. Returns the number removed.
    ///
    /// # Errors
    ///
    /// `Registry` when the backend keeps failing.
    pub async fn delete_all(&self) -> Result<usize> {
        let store = &self.store;
        let removed = self
            .retry
            .run("clear", || store.clear())
            .await
            .map_err(|err| into_ticket_error(err, "*"))?;
        info!(removed, backend = self.backend(), "ticket registry cleared");
        Ok(removed)
    }
}

fn into_ticket_error(err: StoreError, id: &str) -> TicketError {
    match err {
        StoreError::Duplicate(id) => TicketError::AlreadyExists(id),
        StoreError::Corrupt(err) => TicketError::Serialization(err),
        StoreError::Transient(err) | StoreError::Permanent(err) => {
            TicketError::Registry(err.context(format!("ticket {id}")))
        }
    }
}

/// Backend named in configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    Memory,
    Postgres,
    Redis,
}

impl std::str::FromStr for Backend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "redis" => Ok(Self::Redis),
            other => Err(anyhow!("unknown registry backend: {other}")),
        }
    }
}
