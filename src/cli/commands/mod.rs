pub mod cleaner;
pub mod lock;
pub mod logging;
pub mod policy;
pub mod registry;

use clap::{
    Arg, ColorChoice, Command,
    builder::{
        ValueParser,
        styling::{AnsiColor, Effects, Styles},
    },
};
use std::time::Duration;

use crate::ticket::duration;

pub const CMD_SERVER: &str = "server";
pub const CMD_CLEANUP: &str = "cleanup";

/// Accepts ISO-8601 durations (`PT10S`, `P1DT2H`) or plain seconds.
#[must_use]
pub fn validator_duration() -> ValueParser {
    ValueParser::from(move |value: &str| -> std::result::Result<Duration, String> {
        duration::parse(value).map_err(|err| err.to_string())
    })
}

#[must_use]
pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    let long_version: &'static str = Box::leak(
        format!("{} - {}", env!("CARGO_PKG_VERSION"), crate::GIT_COMMIT_HASH).into_boxed_str(),
    );

    let server = Command::new(CMD_SERVER)
        .about("Run the registry cleaner and the admin API")
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .help("Admin API port")
                .default_value("8080")
                .env("TESSERA_PORT")
                .value_parser(clap::value_parser!(u16)),
        );
    let server = cleaner::with_args(server);
    let server = lock::with_args(server);

    let cleanup = Command::new(CMD_CLEANUP).about("Delete expired tickets once and exit");

    let command = Command::new("tessera")
        .about("CAS ticket lifecycle and registry")
        .version(env!("CARGO_PKG_VERSION"))
        .long_version(long_version)
        .color(ColorChoice::Auto)
        .styles(styles)
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(server)
        .subcommand(cleanup);

    let command = registry::with_args(command);
    let command = policy::with_args(command);
    logging::with_args(command)
}
