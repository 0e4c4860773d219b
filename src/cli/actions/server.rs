use crate::api::{self, StoreBackend, handlers::auth::AuthConfig};
use anyhow::Result;
use tracing::debug;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: String,
    pub max_login_attempts: u32,
    pub login_window_seconds: u64,
    pub session_ttl_seconds: i64,
    pub cookie_secure: bool,
    pub rate_limit_store: String,
    pub session_store: String,
    pub trust_proxy_headers: bool,
}

/// Execute the server action.
/// # Errors
/// Returns an error if a store backend is unknown, the database is unreachable or the server
/// fails to start.
pub async fn execute(args: Args) -> Result<()> {
    let auth_config = AuthConfig::new()
        .with_max_login_attempts(args.max_login_attempts)
        .with_login_window_seconds(args.login_window_seconds)
        .with_session_ttl_seconds(args.session_ttl_seconds)
        .with_cookie_secure(args.cookie_secure)
        .with_trust_proxy_headers(args.trust_proxy_headers);

    let rate_limit_store: StoreBackend = args.rate_limit_store.parse()?;
    let session_store: StoreBackend = args.session_store.parse()?;

    debug!(
        "auth config: {:?}, rate limit store: {:?}, session store: {:?}",
        auth_config, rate_limit_store, session_store
    );

    api::new(
        args.port,
        args.dsn,
        auth_config,
        rate_limit_store,
        session_store,
    )
    .await
}
