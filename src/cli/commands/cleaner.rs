use clap::{Arg, ArgMatches, Command};
use std::time::Duration;

use super::validator_duration;
use crate::registry::CleanerConfig;

pub const ARG_CLEANER_ENABLED: &str = "cleaner-enabled";
pub const ARG_CLEANER_START_DELAY: &str = "cleaner-start-delay";
pub const ARG_CLEANER_INTERVAL: &str = "cleaner-interval";

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_CLEANER_ENABLED)
                .long(ARG_CLEANER_ENABLED)
                .help("Run the background sweep of expired tickets")
                .env("TESSERA_CLEANER_ENABLED")
                .default_value("true")
                .value_parser(clap::value_parser!(bool)),
        )
        .arg(
            Arg::new(ARG_CLEANER_START_DELAY)
                .long(ARG_CLEANER_START_DELAY)
                .help("Delay before the first sweep")
                .env("TESSERA_CLEANER_START_DELAY")
                .default_value("PT20S")
                .value_parser(validator_duration()),
        )
        .arg(
            Arg::new(ARG_CLEANER_INTERVAL)
                .long(ARG_CLEANER_INTERVAL)
                .help("Time between sweeps")
                .env("TESSERA_CLEANER_INTERVAL")
                .default_value("PT2M")
                .value_parser(validator_duration()),
        )
}

#[must_use]
pub fn config(matches: &ArgMatches) -> CleanerConfig {
    let defaults = CleanerConfig::default();
    CleanerConfig::new()
        .with_enabled(
            matches
                .get_one::<bool>(ARG_CLEANER_ENABLED)
                .copied()
                .unwrap_or(defaults.enabled()),
        )
        .with_start_delay(
            matches
                .get_one::<Duration>(ARG_CLEANER_START_DELAY)
                .copied()
                .unwrap_or(defaults.start_delay()),
        )
        .with_interval(
            matches
                .get_one::<Duration>(ARG_CLEANER_INTERVAL)
                .copied()
                .unwrap_or(defaults.interval()),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_matches(args: &[&str]) -> Option<ArgMatches> {
        let mut argv = vec!["tessera", "server"];
        argv.extend_from_slice(args);
        crate::cli::commands::new()
            .try_get_matches_from(argv)
            .ok()
            .and_then(|m| m.subcommand_matches(super::super::CMD_SERVER).cloned())
    }

    #[test]
    fn defaults() {
        temp_env::with_vars_unset(
            [
                "TESSERA_CLEANER_ENABLED",
                "TESSERA_CLEANER_START_DELAY",
                "TESSERA_CLEANER_INTERVAL",
            ],
            || {
                let config = server_matches(&[]).map(|m| config(&m));
                assert!(config.is_some_and(|c| {
                    c.enabled()
                        && c.start_delay() == Duration::from_secs(20)
                        && c.interval() == Duration::from_secs(120)
                }));
            },
        );
    }

    #[test]
    fn can_be_disabled() {
        temp_env::with_var("TESSERA_CLEANER_ENABLED", Some("false"), || {
            let config = server_matches(&["--cleaner-interval", "PT30S"]).map(|m| config(&m));
            assert!(config.is_some_and(|c| !c.enabled() && c.interval() == Duration::from_secs(30)));
        });
    }
}
