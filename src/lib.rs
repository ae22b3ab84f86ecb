//! # Tessera (CAS ticket lifecycle and registry)
//!
//! `tessera` owns the ticket side of a CAS single-sign-on deployment: it mints,
//! stores, validates and revokes the short-lived tickets that represent an SSO
//! session and the service grants issued from it.
//!
//! ## Tickets
//!
//! - **TGT** (ticket-granting ticket): root of an SSO session.
//! - **ST** (service ticket): single-use proof of SSO for one service.
//! - **PGT** (proxy-granting ticket): lets a service act on behalf of the user.
//! - **PT** (proxy ticket): service ticket minted from a PGT.
//! - **TST** (transient session ticket): key/value bag that survives one redirect.
//!
//! Every ticket carries an [`ExpirationPolicy`](ticket::ExpirationPolicy) that is
//! persisted with it, so all nodes agree on expiration without a central clock.
//!
//! ## Registry
//!
//! [`TicketRegistry`](registry::TicketRegistry) wraps a pluggable
//! [`TicketStore`](registry::TicketStore) (in-memory, `PostgreSQL`, Redis) and is the
//! only path to stored tickets. Every read applies the expiration check, so an
//! expired ticket is never handed back even before the cleaner removes it.
//! Updates are compare-and-swap on a per-ticket version; clustered deployments
//! can additionally guard read-modify-write cycles with a leased lock.
//!
//! ## Logout
//!
//! Deleting a TGT cascades through the registry's parent/child index, so every
//! service and proxy ticket issued under the session becomes unresolvable.

pub mod api;
pub mod cli;
pub mod clock;
pub mod error;
pub mod registry;
pub mod service;
pub mod ticket;

pub use error::{CreationError, TicketError};

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_commit_hash_format() {
        if GIT_COMMIT_HASH == "unknown" {
            // Acceptable in non-git build environments
            return;
        }
        assert!(
            GIT_COMMIT_HASH.chars().all(|c| c.is_ascii_hexdigit()),
            "GIT_COMMIT_HASH should be a hex string, got: {GIT_COMMIT_HASH}"
        );
        assert!(
            GIT_COMMIT_HASH.len() >= 7,
            "GIT_COMMIT_HASH should be at least 7 characters long, got: {GIT_COMMIT_HASH}"
        );
    }
}
