use anyhow::{Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command, builder::PossibleValuesParser};

pub const ARG_MAX_LOGIN_ATTEMPTS: &str = "max-login-attempts";
pub const ARG_LOGIN_WINDOW_SECONDS: &str = "login-window-seconds";
pub const ARG_SESSION_TTL_SECONDS: &str = "session-ttl-seconds";
pub const ARG_COOKIE_SECURE: &str = "cookie-secure";
pub const ARG_RATE_LIMIT_STORE: &str = "rate-limit-store";
pub const ARG_SESSION_STORE: &str = "session-store";
pub const ARG_TRUST_PROXY_HEADERS: &str = "trust-proxy-headers";

const STORE_BACKENDS: [&str; 2] = ["postgres", "memory"];

/// Auth-related CLI options after parsing.
#[derive(Debug, Clone)]
pub struct Options {
    pub max_login_attempts: u32,
    pub login_window_seconds: u64,
    pub session_ttl_seconds: i64,
    pub cookie_secure: bool,
    pub rate_limit_store: String,
    pub session_store: String,
    pub trust_proxy_headers: bool,
}

impl Options {
    /// # Errors
    /// Returns an error if an argument with a default value is somehow absent.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        Ok(Self {
            max_login_attempts: matches
                .get_one::<u32>(ARG_MAX_LOGIN_ATTEMPTS)
                .copied()
                .context("missing required argument: --max-login-attempts")?,
            login_window_seconds: matches
                .get_one::<u64>(ARG_LOGIN_WINDOW_SECONDS)
                .copied()
                .context("missing required argument: --login-window-seconds")?,
            session_ttl_seconds: matches
                .get_one::<i64>(ARG_SESSION_TTL_SECONDS)
                .copied()
                .context("missing required argument: --session-ttl-seconds")?,
            cookie_secure: matches
                .get_one::<bool>(ARG_COOKIE_SECURE)
                .copied()
                .unwrap_or(true),
            rate_limit_store: matches
                .get_one::<String>(ARG_RATE_LIMIT_STORE)
                .cloned()
                .context("missing required argument: --rate-limit-store")?,
            session_store: matches
                .get_one::<String>(ARG_SESSION_STORE)
                .cloned()
                .context("missing required argument: --session-store")?,
            trust_proxy_headers: matches
                .get_one::<bool>(ARG_TRUST_PROXY_HEADERS)
                .copied()
                .unwrap_or(false),
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    let command = with_login_args(command);
    with_session_args(command)
}

fn with_login_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_MAX_LOGIN_ATTEMPTS)
                .long(ARG_MAX_LOGIN_ATTEMPTS)
                .help("Failed login attempts allowed per client within the window")
                .env("SMARTSPACE_MAX_LOGIN_ATTEMPTS")
                .default_value("5")
                .value_parser(clap::value_parser!(u32).range(1..)),
        )
        .arg(
            Arg::new(ARG_LOGIN_WINDOW_SECONDS)
                .long(ARG_LOGIN_WINDOW_SECONDS)
                .help("Length of the failed login window in seconds")
                .env("SMARTSPACE_LOGIN_WINDOW_SECONDS")
                .default_value("900")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_RATE_LIMIT_STORE)
                .long(ARG_RATE_LIMIT_STORE)
                .help("Where failed login counters are kept")
                .env("SMARTSPACE_RATE_LIMIT_STORE")
                .default_value("postgres")
                .value_parser(PossibleValuesParser::new(STORE_BACKENDS)),
        )
        .arg(
            Arg::new(ARG_TRUST_PROXY_HEADERS)
                .long(ARG_TRUST_PROXY_HEADERS)
                .help("Rate limit by X-Forwarded-For/X-Real-IP (only behind a proxy that sets them)")
                .env("SMARTSPACE_TRUST_PROXY_HEADERS")
                .default_value("false")
                .action(ArgAction::Set)
                .value_parser(clap::value_parser!(bool)),
        )
}

fn with_session_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_SESSION_TTL_SECONDS)
                .long(ARG_SESSION_TTL_SECONDS)
                .help("Session cookie TTL in seconds")
                .env("SMARTSPACE_SESSION_TTL_SECONDS")
                .default_value("28800")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
        .arg(
            Arg::new(ARG_COOKIE_SECURE)
                .long(ARG_COOKIE_SECURE)
                .help("Mark session cookies Secure (disable only for local HTTP)")
                .env("SMARTSPACE_COOKIE_SECURE")
                .default_value("true")
                .action(ArgAction::Set)
                .value_parser(clap::value_parser!(bool)),
        )
        .arg(
            Arg::new(ARG_SESSION_STORE)
                .long(ARG_SESSION_STORE)
                .help("Where sessions are kept")
                .env("SMARTSPACE_SESSION_STORE")
                .default_value("postgres")
                .value_parser(PossibleValuesParser::new(STORE_BACKENDS)),
        )
}
