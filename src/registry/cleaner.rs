//! Background sweep of expired tickets, and of tickets left behind when
//! their parent disappeared without a cascade.
//!
//! Several nodes may sweep the same backend at once. Deletes are idempotent,
//! so a node that finds a ticket already gone simply does not count it. When
//! the cleaner is given [`TicketLocks`], a sweep first takes the
//! [`CLEANER_LOCK_KEY`] lease and a node that cannot get it skips the round.

use serde::Serialize;
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::TicketRegistry;
use super::lock::TicketLocks;
use crate::clock::Clock;
use crate::error::{Result, TicketError};
use crate::ticket::Ticket;

pub const CLEANER_LOCK_KEY: &str = "registry-cleaner";

#[derive(Clone, Copy, Debug)]
pub struct CleanerConfig {
    enabled: bool,
    start_delay: Duration,
    interval: Duration,
}

impl CleanerConfig {
    /// Default cleaner config: enabled, first sweep after 20s, then every 120s.
    #[must_use]
    pub fn new() -> Self {
        Self {
            enabled: true,
            start_delay: Duration::from_secs(20),
            interval: Duration::from_secs(120),
        }
    }

    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    #[must_use]
    pub fn with_start_delay(mut self, start_delay: Duration) -> Self {
        self.start_delay = start_delay;
        self
    }

    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    #[must_use]
    pub fn normalize(self) -> Self {
        let interval = if self.interval.is_zero() {
            Duration::from_secs(1)
        } else {
            self.interval
        };
        Self { interval, ..self }
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    #[must_use]
    pub fn start_delay(&self) -> Duration {
        self.start_delay
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of one sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Expired tickets seen by the scan.
    pub expired: usize,
    /// Live tickets whose parent is no longer stored.
    pub orphaned: usize,
    /// Tickets this sweep actually removed. Lower than `expired` when another
    /// node or a cascade got there first.
    pub removed: usize,
    /// Deletes that failed and will be retried on the next sweep.
    pub failed: usize,
    /// Another node held the cleaner lease, nothing was scanned.
    pub skipped: bool,
}

#[derive(Clone, Debug)]
pub struct RegistryCleaner {
    registry: TicketRegistry,
    locks: Option<TicketLocks>,
}

impl RegistryCleaner {
    #[must_use]
    pub fn new(registry: TicketRegistry) -> Self {
        Self {
            registry,
            locks: None,
        }
    }

    /// Sweep only while holding the cluster-wide cleaner lease.
    #[must_use]
    pub fn with_locks(mut self, locks: TicketLocks) -> Self {
        self.locks = Some(locks);
        self
    }

    /// Delete every ticket that is expired right now.
    ///
    /// # Errors
    ///
    /// Fails only when the scan itself fails. Individual delete failures are
    /// logged and counted in [`CleanupReport::failed`].
    pub async fn run_once(&self) -> Result<CleanupReport> {
        let guard = match &self.locks {
            Some(locks) => match locks.acquire(CLEANER_LOCK_KEY).await {
                Ok(guard) => Some(guard),
                Err(TicketError::Contention(_)) => {
                    debug!("cleaner lease held by another node, skipping sweep");
                    return Ok(CleanupReport {
                        skipped: true,
                        ..CleanupReport::default()
                    });
                }
                Err(err) => return Err(err),
            },
            None => None,
        };

        let report = self.sweep().await;

        if let Some(guard) = guard
            && let Err(err) = guard.release().await
        {
            warn!("failed to release cleaner lease: {err}");
        }
        report
    }

    async fn sweep(&self) -> Result<CleanupReport> {
        let now = self.registry.clock().now();
        let tickets = self.registry.get_tickets(|_| true).await?;
        let (expired, live): (Vec<&Ticket>, Vec<&Ticket>) =
            tickets.iter().partition(|ticket| ticket.is_expired(now));
        let scanned: HashSet<&str> = tickets.iter().map(Ticket::id).collect();

        // Children of an expired parent go with its cascade.
        let mut orphans = Vec::new();
        for ticket in live {
            let Some(parent) = ticket.parent_id() else {
                continue;
            };
            if scanned.contains(parent) || self.registry.contains(parent).await? {
                continue;
            }
            debug!(ticket_id = ticket.id(), parent, "ticket outlived its parent");
            orphans.push(ticket);
        }

        let mut report = CleanupReport {
            expired: expired.len(),
            orphaned: orphans.len(),
            ..CleanupReport::default()
        };
        for ticket in expired.iter().chain(&orphans) {
            match self.registry.delete_ticket(ticket.id()).await {
                Ok(true) => report.removed += 1,
                Ok(false) => debug!(ticket_id = ticket.id(), "ticket already removed"),
                Err(err) => {
                    report.failed += 1;
                    warn!(ticket_id = ticket.id(), "failed to remove ticket: {err}");
                }
            }
        }

        if report.expired + report.orphaned > 0 {
            info!(
                expired = report.expired,
                orphaned = report.orphaned,
                removed = report.removed,
                failed = report.failed,
                backend = self.registry.backend(),
                "registry cleanup finished"
            );
        }
        Ok(report)
    }
}

/// Spawn the recurring sweep. Returns `None` when the cleaner is disabled.
pub fn spawn_cleaner(
    cleaner: RegistryCleaner,
    config: CleanerConfig,
) -> Option<tokio::task::JoinHandle<()>> {
    let config = config.normalize();
    if !config.enabled() {
        info!("registry cleaner disabled");
        return None;
    }

    Some(tokio::spawn(async move {
        sleep(config.start_delay()).await;
        loop {
            if let Err(err) = cleaner.run_once().await {
                error!("registry cleanup failed: {err}");
            }
            sleep(config.interval()).await;
        }
    }))
}
