use clap::{Arg, ArgMatches, Command};
use std::time::Duration;

use super::validator_duration;
use crate::ticket::policy::{
    DEFAULT_PT_NUMBER_OF_USES, DEFAULT_PT_TIME_TO_KILL, DEFAULT_ST_NUMBER_OF_USES,
    DEFAULT_ST_TIME_TO_KILL, DEFAULT_TGT_MAX_TIME_TO_LIVE, DEFAULT_TGT_TIME_TO_KILL,
    DEFAULT_TST_TIME_TO_KILL,
};
use crate::ticket::{ExpirationPolicy, PolicySet};

pub const ARG_TGT_MAX_TIME_TO_LIVE: &str = "tgt-max-time-to-live";
pub const ARG_TGT_TIME_TO_KILL: &str = "tgt-time-to-kill";
pub const ARG_TGT_REMEMBER_ME: &str = "tgt-remember-me-time-to-live";
pub const ARG_ST_NUMBER_OF_USES: &str = "st-number-of-uses";
pub const ARG_ST_TIME_TO_KILL: &str = "st-time-to-kill";
pub const ARG_PGT_MAX_TIME_TO_LIVE: &str = "pgt-max-time-to-live";
pub const ARG_PT_NUMBER_OF_USES: &str = "pt-number-of-uses";
pub const ARG_PT_TIME_TO_KILL: &str = "pt-time-to-kill";
pub const ARG_TST_TIME_TO_KILL: &str = "tst-time-to-kill";

fn duration_arg(name: &'static str, env: &'static str, help: &'static str) -> Arg {
    Arg::new(name)
        .long(name)
        .help(help)
        .env(env)
        .global(true)
        .value_parser(validator_duration())
}

fn uses_arg(name: &'static str, env: &'static str, help: &'static str) -> Arg {
    Arg::new(name)
        .long(name)
        .help(help)
        .env(env)
        .global(true)
        .value_parser(clap::value_parser!(u32).range(1..))
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            duration_arg(
                ARG_TGT_MAX_TIME_TO_LIVE,
                "TESSERA_TGT_MAX_TIME_TO_LIVE",
                "Hard lifetime of an SSO session",
            )
            .default_value("PT8H"),
        )
        .arg(
            duration_arg(
                ARG_TGT_TIME_TO_KILL,
                "TESSERA_TGT_TIME_TO_KILL",
                "Idle timeout of an SSO session",
            )
            .default_value("PT2H"),
        )
        .arg(duration_arg(
            ARG_TGT_REMEMBER_ME,
            "TESSERA_TGT_REMEMBER_ME_TIME_TO_LIVE",
            "Lifetime of \"remember me\" sessions; unset disables the long-term policy",
        ))
        .arg(
            uses_arg(
                ARG_ST_NUMBER_OF_USES,
                "TESSERA_ST_NUMBER_OF_USES",
                "Validations a service ticket allows",
            )
            .default_value("1"),
        )
        .arg(
            duration_arg(
                ARG_ST_TIME_TO_KILL,
                "TESSERA_ST_TIME_TO_KILL",
                "Service ticket lifetime since last use",
            )
            .default_value("PT10S"),
        )
        .arg(duration_arg(
            ARG_PGT_MAX_TIME_TO_LIVE,
            "TESSERA_PGT_MAX_TIME_TO_LIVE",
            "Proxy-granting ticket lifetime; unset follows the session policy",
        ))
        .arg(
            uses_arg(
                ARG_PT_NUMBER_OF_USES,
                "TESSERA_PT_NUMBER_OF_USES",
                "Validations a proxy ticket allows",
            )
            .default_value("1"),
        )
        .arg(
            duration_arg(
                ARG_PT_TIME_TO_KILL,
                "TESSERA_PT_TIME_TO_KILL",
                "Proxy ticket lifetime since last use",
            )
            .default_value("PT10S"),
        )
        .arg(
            duration_arg(
                ARG_TST_TIME_TO_KILL,
                "TESSERA_TST_TIME_TO_KILL",
                "Transient session ticket lifetime",
            )
            .default_value("PT5M"),
        )
}

#[derive(Debug)]
pub struct Options {
    pub tgt_max_time_to_live: Duration,
    pub tgt_time_to_kill: Duration,
    pub tgt_remember_me: Option<Duration>,
    pub st_number_of_uses: u32,
    pub st_time_to_kill: Duration,
    pub pgt_max_time_to_live: Option<Duration>,
    pub pt_number_of_uses: u32,
    pub pt_time_to_kill: Duration,
    pub tst_time_to_kill: Duration,
}

impl Options {
    #[must_use]
    pub fn parse(matches: &ArgMatches) -> Self {
        let duration = |name: &str| matches.get_one::<Duration>(name).copied();
        let uses = |name: &str| matches.get_one::<u32>(name).copied();
        Self {
            tgt_max_time_to_live: duration(ARG_TGT_MAX_TIME_TO_LIVE)
                .unwrap_or(DEFAULT_TGT_MAX_TIME_TO_LIVE),
            tgt_time_to_kill: duration(ARG_TGT_TIME_TO_KILL).unwrap_or(DEFAULT_TGT_TIME_TO_KILL),
            tgt_remember_me: duration(ARG_TGT_REMEMBER_ME),
            st_number_of_uses: uses(ARG_ST_NUMBER_OF_USES).unwrap_or(DEFAULT_ST_NUMBER_OF_USES),
            st_time_to_kill: duration(ARG_ST_TIME_TO_KILL).unwrap_or(DEFAULT_ST_TIME_TO_KILL),
            pgt_max_time_to_live: duration(ARG_PGT_MAX_TIME_TO_LIVE),
            pt_number_of_uses: uses(ARG_PT_NUMBER_OF_USES).unwrap_or(DEFAULT_PT_NUMBER_OF_USES),
            pt_time_to_kill: duration(ARG_PT_TIME_TO_KILL).unwrap_or(DEFAULT_PT_TIME_TO_KILL),
            tst_time_to_kill: duration(ARG_TST_TIME_TO_KILL).unwrap_or(DEFAULT_TST_TIME_TO_KILL),
        }
    }

    #[must_use]
    pub fn policies(&self) -> PolicySet {
        let session =
            ExpirationPolicy::ticket_granting(self.tgt_max_time_to_live, self.tgt_time_to_kill);
        let session = match self.tgt_remember_me {
            Some(ttl) => ExpirationPolicy::remember_me(ExpirationPolicy::timeout(ttl), session),
            None => session,
        };
        let policies = PolicySet::default()
            .with_ticket_granting(session)
            .with_service(ExpirationPolicy::multi_use(
                self.st_number_of_uses,
                self.st_time_to_kill,
            ))
            .with_proxy(ExpirationPolicy::multi_use(
                self.pt_number_of_uses,
                self.pt_time_to_kill,
            ))
            .with_transient_session(ExpirationPolicy::timeout(self.tst_time_to_kill));
        match self.pgt_max_time_to_live {
            Some(ttl) => policies.with_proxy_granting(ExpirationPolicy::timeout(ttl)),
            None => policies,
        }
    }
}
