use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeSet;

use super::store::{ScanPage, StoreError, TicketStore};
use crate::ticket::Ticket;

/// Process-local store for single node deployments and tests.
///
/// Tickets live in a sharded map; the parent index is a second map of id sets.
/// No guard on one map is ever held while touching the other.
#[derive(Debug, Default)]
pub struct MemoryTicketStore {
    tickets: DashMap<String, Ticket>,
    children: DashMap<String, BTreeSet<String>>,
}

impl MemoryTicketStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TicketStore for MemoryTicketStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn insert(&self, ticket: &Ticket) -> Result<(), StoreError> {
        match self.tickets.entry(ticket.id().to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(StoreError::Duplicate(ticket.id().to_string()));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(ticket.clone());
            }
        }
        if let Some(parent) = ticket.parent_id() {
            self.children
                .entry(parent.to_string())
                .or_default()
                .insert(ticket.id().to_string());
        }
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<Ticket>, StoreError> {
        Ok(self.tickets.get(id).map(|entry| entry.value().clone()))
    }

    async fn compare_and_swap(
        &self,
        ticket: &Ticket,
        expected_version: u64,
    ) -> Result<bool, StoreError> {
        let Some(mut entry) = self.tickets.get_mut(ticket.id()) else {
            return Ok(false);
        };
        if entry.version() != expected_version {
            return Ok(false);
        }
        *entry = ticket.clone();
        Ok(true)
    }

    async fn remove(&self, id: &str) -> Result<bool, StoreError> {
        let Some((_, removed)) = self.tickets.remove(id) else {
            return Ok(false);
        };
        if let Some(parent) = removed.parent_id()
            && let Some(mut siblings) = self.children.get_mut(parent)
        {
            siblings.remove(id);
        }
        self.children.remove(id);
        Ok(true)
    }

    async fn children(&self, id: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .children
            .get(id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    /// The whole map fits one page; the cursor is ignored.
    async fn scan(&self, _cursor: Option<String>, _limit: usize) -> Result<ScanPage, StoreError> {
        Ok(ScanPage {
            tickets: self
                .tickets
                .iter()
                .map(|entry| entry.value().clone())
                .collect(),
            next: None,
        })
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.tickets.len())
    }

    async fn clear(&self) -> Result<usize, StoreError> {
        let removed = self.tickets.len();
        self.tickets.clear();
        self.children.clear();
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ticket::{
        Authentication, ExpirationPolicy, Service, ServiceTicket, TicketGrantingTicket,
        TicketState,
    };
    use chrono::Utc;

    fn tgt(id: &str) -> Ticket {
        let now = Utc::now();
        Ticket::TicketGranting(TicketGrantingTicket::new(
            TicketState::new(id, ExpirationPolicy::NeverExpires, now),
            Authentication::new("casuser", now),
        ))
    }

    fn st(id: &str, parent: &str) -> Ticket {
        Ticket::Service(ServiceTicket::new(
            TicketState::new(id, ExpirationPolicy::NeverExpires, Utc::now()),
            parent,
            Service::new("https://app.example.org"),
            false,
        ))
    }

    #[tokio::test]
    async fn insert_refuses_duplicates() {
        let store = MemoryTicketStore::new();
        assert!(store.insert(&tgt("TGT-1-a")).await.is_ok());
        assert!(matches!(
            store.insert(&tgt("TGT-1-a")).await,
            Err(StoreError::Duplicate(_))
        ));
        assert_eq!(store.count().await.ok(), Some(1));
    }

    #[tokio::test]
    async fn compare_and_swap_checks_version() {
        let store = MemoryTicketStore::new();
        let ticket = tgt("TGT-1-a");
        assert!(store.insert(&ticket).await.is_ok());

        let mut next = ticket.clone();
        next.state_mut().set_version(1);
        assert_eq!(store.compare_and_swap(&next, 0).await.ok(), Some(true));
        // Second writer still holding version 0 loses.
        assert_eq!(store.compare_and_swap(&next, 0).await.ok(), Some(false));

        let missing = tgt("TGT-2-b");
        assert_eq!(store.compare_and_swap(&missing, 0).await.ok(), Some(false));
    }

    #[tokio::test]
    async fn remove_maintains_parent_index() {
        let store = MemoryTicketStore::new();
        assert!(store.insert(&tgt("TGT-1-a")).await.is_ok());
        assert!(store.insert(&st("ST-1-a", "TGT-1-a")).await.is_ok());
        assert!(store.insert(&st("ST-2-a", "TGT-1-a")).await.is_ok());

        assert_eq!(store.children("TGT-1-a").await.ok().map(|c| c.len()), Some(2));
        assert_eq!(store.remove("ST-1-a").await.ok(), Some(true));
        assert_eq!(
            store.children("TGT-1-a").await.ok(),
            Some(vec!["ST-2-a".to_string()])
        );
        assert_eq!(store.remove("ST-1-a").await.ok(), Some(false));
    }

    #[tokio::test]
    async fn descendants_walk_the_tree() {
        let store = MemoryTicketStore::new();
        assert!(store.insert(&tgt("TGT-1-a")).await.is_ok());
        assert!(store.insert(&st("ST-1-a", "TGT-1-a")).await.is_ok());
        assert!(store.insert(&st("ST-2-a", "ST-1-a")).await.is_ok());

        let descendants = store.descendants("TGT-1-a").await;
        assert_eq!(
            descendants.ok(),
            Some(vec!["ST-1-a".to_string(), "ST-2-a".to_string()])
        );
    }

    #[tokio::test]
    async fn clear_reports_removed_count() {
        let store = MemoryTicketStore::new();
        for i in 0..5 {
            assert!(store.insert(&tgt(&format!("TGT-{i}-a"))).await.is_ok());
        }
        assert_eq!(store.clear().await.ok(), Some(5));
        assert_eq!(store.count().await.ok(), Some(0));
        assert!(store.scan(None, 10).await.is_ok_and(|page| page.tickets.is_empty()));
    }
}
