//! Storage backend contract.
//!
//! A `TicketStore` is a dumb keyed store with three extra guarantees: inserts
//! never overwrite, updates are compare-and-swap on the ticket version, and the
//! store maintains a parent to children index for cascade deletes. Expiration,
//! retries and kind checks live in [`TicketRegistry`](super::TicketRegistry).

use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::fmt::Debug;
use thiserror::Error;

use crate::ticket::Ticket;

/// Depth limit for descendant walks. Real chains are TGT -> PGT -> PT plus a
/// few nested proxies.
pub const MAX_CASCADE_DEPTH: usize = 16;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("ticket {0} already exists")]
    Duplicate(String),
    /// Worth retrying: connection resets, pool timeouts, serialization
    /// conflicts.
    #[error("transient backend failure: {0:#}")]
    Transient(#[source] anyhow::Error),
    #[error("backend failure: {0:#}")]
    Permanent(#[source] anyhow::Error),
    #[error("stored ticket could not be decoded: {0}")]
    Corrupt(#[from] serde_json::Error),
}

impl StoreError {
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// One page of a full scan. `next` is an opaque cursor, `None` when done.
#[derive(Debug, Default)]
pub struct ScanPage {
    pub tickets: Vec<Ticket>,
    pub next: Option<String>,
}

#[async_trait]
pub trait TicketStore: Send + Sync + Debug {
    /// Short backend name for logs and stats.
    fn name(&self) -> &'static str;

    /// Store a new ticket and index it under its parent.
    ///
    /// # Errors
    ///
    /// `StoreError::Duplicate` when the id is taken.
    async fn insert(&self, ticket: &Ticket) -> Result<(), StoreError>;

    async fn load(&self, id: &str) -> Result<Option<Ticket>, StoreError>;

    /// Replace the stored ticket only if its version is still
    /// `expected_version`. `ticket` already carries the new version. Returns
    /// `false` on a version mismatch or when the ticket is gone.
    async fn compare_and_swap(&self, ticket: &Ticket, expected_version: u64)
    -> Result<bool, StoreError>;

    /// Remove one ticket (no cascade). Returns whether it existed.
    async fn remove(&self, id: &str) -> Result<bool, StoreError>;

    /// Direct children of `id` from the parent index.
    async fn children(&self, id: &str) -> Result<Vec<String>, StoreError>;

    /// All transitive children of `id`, parents before their children.
    async fn descendants(&self, id: &str) -> Result<Vec<String>, StoreError> {
        let mut seen = HashSet::from([id.to_string()]);
        let mut ordered = Vec::new();
        let mut queue = VecDeque::from([(id.to_string(), 0_usize)]);
        while let Some((current, depth)) = queue.pop_front() {
            if depth >= MAX_CASCADE_DEPTH {
                continue;
            }
            for child in self.children(&current).await? {
                if seen.insert(child.clone()) {
                    ordered.push(child.clone());
                    queue.push_back((child, depth + 1));
                }
            }
        }
        Ok(ordered)
    }

    /// Page through every stored ticket. Pages must not hold backend locks
    /// between calls.
    async fn scan(&self, cursor: Option<String>, limit: usize) -> Result<ScanPage, StoreError>;

    async fn count(&self) -> Result<usize, StoreError>;

    /// Remove every ticket, returning how many were removed.
    async fn clear(&self) -> Result<usize, StoreError>;
}
