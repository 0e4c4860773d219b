//! Command-line argument dispatch.
//!
//! Maps validated CLI arguments to the action the binary executes.

use crate::cli::actions::{Action, server::Args};
use crate::cli::commands::auth;
use anyhow::{Context, Result};

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if required arguments are missing.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>("port").copied().unwrap_or(8080);
    let dsn = matches
        .get_one::<String>("dsn")
        .cloned()
        .context("missing required argument: --dsn")?;

    let auth_opts = auth::Options::parse(matches)?;

    Ok(Action::Server(Args {
        port,
        dsn,
        max_login_attempts: auth_opts.max_login_attempts,
        login_window_seconds: auth_opts.login_window_seconds,
        session_ttl_seconds: auth_opts.session_ttl_seconds,
        cookie_secure: auth_opts.cookie_secure,
        rate_limit_store: auth_opts.rate_limit_store,
        session_store: auth_opts.session_store,
        trust_proxy_headers: auth_opts.trust_proxy_headers,
    }))
}
