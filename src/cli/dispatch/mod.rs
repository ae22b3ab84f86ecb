//! Maps validated CLI arguments to an action.

use crate::cli::actions::{Action, cleanup, server};
use crate::cli::commands::{CMD_CLEANUP, CMD_SERVER, cleaner, lock, policy, registry};
use anyhow::{Result, anyhow};

/// Map validated CLI matches to an action.
///
/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let registry = registry::Options::parse(matches)?;

    match matches.subcommand() {
        Some((CMD_SERVER, sub)) => {
            let port = sub.get_one::<u16>("port").copied().unwrap_or(8080);
            let policies = policy::Options::parse(matches).policies();
            Ok(Action::Server(server::Args {
                port,
                registry,
                policies,
                cleaner: cleaner::config(sub),
                lock: lock::config(sub),
            }))
        }
        Some((CMD_CLEANUP, _)) => Ok(Action::Cleanup(cleanup::Args { registry })),
        Some((other, _)) => Err(anyhow!("unknown command: {other}")),
        None => Err(anyhow!("missing command")),
    }
}
