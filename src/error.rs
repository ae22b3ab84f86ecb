//! Error taxonomy for ticket creation, lookup and registry access.
//!
//! Callers are expected to fail closed: anything other than `Ok` means the
//! ticket must be treated as invalid. Only [`TicketError::Contention`] is
//! retried automatically; [`TicketError::Throttled`] tells the caller when to
//! come back.

use std::time::Duration;
use thiserror::Error;

use crate::ticket::TicketKind;

/// Reasons the factory refuses to mint a ticket.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CreationError {
    #[error("authentication does not satisfy the policy for service {service}: {reason}")]
    UnsatisfiedAuthenticationPolicy { service: String, reason: String },
    #[error("cannot create a ticket from parent {parent:?} with service {service:?}")]
    InvalidContext {
        parent: Option<TicketKind>,
        service: Option<String>,
    },
    #[error("proxy-granting ticket was already issued from {0}")]
    ProxyAlreadyGranted(String),
    #[error("failed to generate ticket id: {0}")]
    IdGeneration(String),
}

#[derive(Debug, Error)]
pub enum TicketError {
    #[error(transparent)]
    Creation(#[from] CreationError),
    #[error("ticket {0} not found")]
    NotFound(String),
    #[error("ticket {id} is a {actual} but a {expected} was expected")]
    UnexpectedKind {
        id: String,
        expected: TicketKind,
        actual: TicketKind,
    },
    #[error("ticket {0} already exists")]
    AlreadyExists(String),
    #[error("ticket {0} is being modified concurrently")]
    Contention(String),
    #[error("ticket {id} is throttled, retry after {retry_after:?}")]
    Throttled { id: String, retry_after: Duration },
    #[error("ticket {id} was not issued for service {service}")]
    ServiceMismatch { id: String, service: String },
    #[error("ticket registry failure: {0:#}")]
    Registry(#[source] anyhow::Error),
    #[error("failed to serialize ticket: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TicketError {
    /// Whether the whole use-case may be attempted again.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Contention(_))
    }
}

pub type Result<T, E = TicketError> = std::result::Result<T, E>;
