//! `-v` / `SMARTSPACE_LOG_LEVEL`.
//!
//! Each `-v` raises the level one step above `error`. The environment variable
//! takes a level name or its step number (`info` and `2` are the same).

use clap::{Arg, ArgAction, ArgMatches, Command, builder::ValueParser};
use tracing::Level;

pub const ARG_VERBOSITY: &str = "verbosity";

const LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

fn parse_log_level(value: &str) -> Result<u8, String> {
    let value = value.trim();
    if let Ok(step) = value.parse::<u8>() {
        return if step <= 5 {
            Ok(step)
        } else {
            Err(format!("log level {step} is out of range (0-5)"))
        };
    }
    LEVELS
        .iter()
        .position(|name| name.eq_ignore_ascii_case(value))
        .and_then(|step| u8::try_from(step).ok())
        .ok_or_else(|| format!("unknown log level `{value}`, expected one of {}", LEVELS.join(", ")))
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command.arg(
        Arg::new(ARG_VERBOSITY)
            .short('v')
            .long("verbose")
            .help("Raise log verbosity: -v warn, -vv info, -vvv debug, -vvvv trace (default: error)")
            .env("SMARTSPACE_LOG_LEVEL")
            .global(true)
            .action(ArgAction::Count)
            .value_parser(ValueParser::from(parse_log_level)),
    )
}

/// Level requested on the command line. `None` keeps the `error` default.
#[must_use]
pub fn verbosity_level(matches: &ArgMatches) -> Option<Level> {
    match matches.get_one::<u8>(ARG_VERBOSITY).copied().unwrap_or(0) {
        0 => None,
        1 => Some(Level::WARN),
        2 => Some(Level::INFO),
        3 => Some(Level::DEBUG),
        _ => Some(Level::TRACE),
    }
}
