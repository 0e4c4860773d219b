//! Auth state and configuration.

use std::{sync::Arc, time::Duration};

use super::{
    authenticator::Authenticator,
    credentials::CredentialStore,
    rate_limit::{RateLimitPolicy, RateLimiter},
    session::SessionManager,
    session_store::SessionStore,
};

const DEFAULT_MAX_LOGIN_ATTEMPTS: u32 = 5;
const DEFAULT_LOGIN_WINDOW_SECONDS: u64 = 15 * 60;
const DEFAULT_SESSION_TTL_SECONDS: i64 = 8 * 60 * 60;
const DEFAULT_ENTRY_PAGE: &str = "/index.php";

#[derive(Clone, Debug)]
pub struct AuthConfig {
    max_login_attempts: u32,
    login_window_seconds: u64,
    session_ttl_seconds: i64,
    cookie_secure: bool,
    trust_proxy_headers: bool,
    entry_page: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_login_attempts: DEFAULT_MAX_LOGIN_ATTEMPTS,
            login_window_seconds: DEFAULT_LOGIN_WINDOW_SECONDS,
            session_ttl_seconds: DEFAULT_SESSION_TTL_SECONDS,
            cookie_secure: true,
            trust_proxy_headers: false,
            entry_page: DEFAULT_ENTRY_PAGE.to_string(),
        }
    }

    #[must_use]
    pub fn with_max_login_attempts(mut self, attempts: u32) -> Self {
        self.max_login_attempts = attempts;
        self
    }

    #[must_use]
    pub fn with_login_window_seconds(mut self, seconds: u64) -> Self {
        self.login_window_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_session_ttl_seconds(mut self, seconds: i64) -> Self {
        self.session_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_cookie_secure(mut self, secure: bool) -> Self {
        self.cookie_secure = secure;
        self
    }

    /// Key the rate limiter on `X-Forwarded-For`/`X-Real-IP` instead of the peer address.
    #[must_use]
    pub fn with_trust_proxy_headers(mut self, trust: bool) -> Self {
        self.trust_proxy_headers = trust;
        self
    }

    #[must_use]
    pub fn with_entry_page(mut self, entry_page: String) -> Self {
        self.entry_page = entry_page;
        self
    }

    #[must_use]
    pub fn max_login_attempts(&self) -> u32 {
        self.max_login_attempts
    }

    #[must_use]
    pub fn login_window_seconds(&self) -> u64 {
        self.login_window_seconds
    }

    #[must_use]
    pub fn session_ttl_seconds(&self) -> i64 {
        self.session_ttl_seconds
    }

    #[must_use]
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(u64::try_from(self.session_ttl_seconds).unwrap_or(0))
    }

    #[must_use]
    pub fn cookie_secure(&self) -> bool {
        self.cookie_secure
    }

    #[must_use]
    pub fn trust_proxy_headers(&self) -> bool {
        self.trust_proxy_headers
    }

    /// Page the login form lives on; error redirects point back here.
    #[must_use]
    pub fn entry_page(&self) -> &str {
        &self.entry_page
    }

    #[must_use]
    pub fn rate_limit_policy(&self) -> RateLimitPolicy {
        RateLimitPolicy::new(
            self.max_login_attempts,
            Duration::from_secs(self.login_window_seconds),
        )
    }
}

pub struct AuthState {
    config: AuthConfig,
    credentials: Arc<dyn CredentialStore>,
    authenticator: Authenticator,
    rate_limiter: Arc<dyn RateLimiter>,
    sessions: SessionManager,
}

impl AuthState {
    #[must_use]
    pub fn new(
        config: AuthConfig,
        credentials: Arc<dyn CredentialStore>,
        rate_limiter: Arc<dyn RateLimiter>,
        sessions: Arc<dyn SessionStore>,
    ) -> Self {
        let session_ttl = config.session_ttl();
        Self {
            authenticator: Authenticator::new(credentials.clone()),
            credentials,
            rate_limiter,
            sessions: SessionManager::new(sessions, session_ttl),
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    #[must_use]
    pub fn authenticator(&self) -> &Authenticator {
        &self.authenticator
    }

    #[must_use]
    pub fn credentials(&self) -> &dyn CredentialStore {
        self.credentials.as_ref()
    }

    #[must_use]
    pub fn rate_limiter(&self) -> &dyn RateLimiter {
        self.rate_limiter.as_ref()
    }

    #[must_use]
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }
}
