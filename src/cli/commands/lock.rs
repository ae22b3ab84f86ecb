use clap::{Arg, ArgMatches, Command};
use std::time::Duration;

use super::validator_duration;
use crate::registry::LockConfig;

pub const ARG_LOCKING: &str = "locking";
pub const ARG_LOCK_LEASE: &str = "lock-lease";
pub const ARG_LOCK_WAIT: &str = "lock-wait-timeout";

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_LOCKING)
                .long(ARG_LOCKING)
                .help("Guard ticket updates with a leased lock in the registry backend")
                .env("TESSERA_LOCKING")
                .default_value("false")
                .value_parser(clap::value_parser!(bool)),
        )
        .arg(
            Arg::new(ARG_LOCK_LEASE)
                .long(ARG_LOCK_LEASE)
                .help("Lock lease; a crashed holder's lock expires after it")
                .env("TESSERA_LOCK_LEASE")
                .default_value("PT5S")
                .value_parser(validator_duration()),
        )
        .arg(
            Arg::new(ARG_LOCK_WAIT)
                .long(ARG_LOCK_WAIT)
                .help("How long to wait for a held lock before reporting contention")
                .env("TESSERA_LOCK_WAIT_TIMEOUT")
                .default_value("PT3S")
                .value_parser(validator_duration()),
        )
}

/// `None` when locking is off.
#[must_use]
pub fn config(matches: &ArgMatches) -> Option<LockConfig> {
    if !matches.get_one::<bool>(ARG_LOCKING).copied().unwrap_or(false) {
        return None;
    }
    let defaults = LockConfig::default();
    Some(
        LockConfig::new()
            .with_lease(
                matches
                    .get_one::<Duration>(ARG_LOCK_LEASE)
                    .copied()
                    .unwrap_or(defaults.lease()),
            )
            .with_wait_timeout(
                matches
                    .get_one::<Duration>(ARG_LOCK_WAIT)
                    .copied()
                    .unwrap_or(defaults.wait_timeout()),
            ),
    )
}
