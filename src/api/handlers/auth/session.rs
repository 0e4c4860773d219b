//! Session issuance, cookie helpers and logout.

use anyhow::{Result, bail};
use axum::{
    extract::Extension,
    http::{
        HeaderMap, HeaderValue, StatusCode,
        header::{COOKIE, InvalidHeaderValue, SET_COOKIE},
    },
    response::{IntoResponse, Redirect},
};
use std::{sync::Arc, time::Duration};
use tracing::{debug, error};
use ulid::Ulid;

use super::{
    authenticator::AuthenticatedUser,
    role::Role,
    session_store::{SessionRecord, SessionStore},
    state::{AuthConfig, AuthState},
    utils::{generate_session_token, hash_session_token},
};

pub const SESSION_COOKIE_NAME: &str = "smartspace_session";
pub const CACHE_INVALIDATE_COOKIE_NAME: &str = "cache_invalidate";
const CACHE_INVALIDATE_TTL_SECONDS: u32 = 60 * 60;
const MAX_TOKEN_ATTEMPTS: usize = 3;

/// Issues and resolves server-side sessions.
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    ttl: Duration,
}

impl SessionManager {
    #[must_use]
    pub fn new(store: Arc<dyn SessionStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Start a session for `user` and return the raw token for the cookie.
    ///
    /// Whatever session `previous_token` pointed at is dropped first, so a
    /// token planted before login never becomes authenticated.
    ///
    /// # Errors
    /// Returns an error if the store fails or no unique token could be issued.
    pub async fn create_session(
        &self,
        previous_token: Option<&str>,
        user: &AuthenticatedUser,
    ) -> Result<String> {
        if let Some(previous) = previous_token {
            self.store.delete(&hash_session_token(previous)).await?;
        }

        let record = SessionRecord::from_user(user);
        for _ in 0..MAX_TOKEN_ATTEMPTS {
            let token = generate_session_token()?;
            let token_hash = hash_session_token(&token);
            if self.store.insert(&token_hash, &record, self.ttl).await? {
                debug!("session created for {} {}", record.user_type, record.user_id);
                return Ok(token);
            }
        }
        bail!("failed to generate unique session token")
    }

    /// Session referenced by the request cookie, if it is still live.
    ///
    /// # Errors
    /// Returns an error if the store cannot be read.
    pub async fn current(&self, headers: &HeaderMap) -> Result<Option<SessionRecord>> {
        let Some(token) = extract_session_token(headers) else {
            return Ok(None);
        };
        self.store.lookup(&hash_session_token(&token)).await
    }

    /// Drop the session for `token`. Unknown tokens are ignored.
    ///
    /// # Errors
    /// Returns an error if the store fails.
    pub async fn destroy(&self, token: &str) -> Result<()> {
        self.store.delete(&hash_session_token(token)).await
    }

    /// Remove expired sessions from the store.
    ///
    /// # Errors
    /// Returns an error if the store fails.
    pub async fn purge_expired(&self) -> Result<u64> {
        self.store.purge_expired().await
    }
}

#[utoipa::path(
    post,
    path = "/auth/logout",
    responses(
        (status = 303, description = "Session cleared, redirect to the login page")
    ),
    tag = "auth"
)]
pub async fn logout(
    headers: HeaderMap,
    auth_state: Extension<Arc<AuthState>>,
) -> impl IntoResponse {
    if let Some(token) = extract_session_token(&headers) {
        if let Err(err) = auth_state.sessions().destroy(&token).await {
            error!("Failed to delete session: {err}");
        }
    }

    // Always clear the cookie, even if the session record was missing.
    let mut response_headers = HeaderMap::new();
    if let Ok(cookie) = clear_session_cookie(auth_state.config()) {
        response_headers.insert(SET_COOKIE, cookie);
    }
    (
        response_headers,
        Redirect::to(auth_state.config().entry_page()),
    )
        .into_response()
}

/// Resolve the caller's session and make sure its role is in `allowed`.
///
/// `401` without a live session, `403` when the role does not qualify.
pub(crate) async fn require_role(
    auth_state: &AuthState,
    headers: &HeaderMap,
    allowed: &[Role],
) -> Result<SessionRecord, StatusCode> {
    let session = match auth_state.sessions().current(headers).await {
        Ok(Some(session)) => session,
        Ok(None) => return Err(StatusCode::UNAUTHORIZED),
        Err(err) => {
            error!("Failed to lookup session: {err}");
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };
    if allowed.contains(&session.role) {
        Ok(session)
    } else {
        Err(StatusCode::FORBIDDEN)
    }
}

/// Build a `HttpOnly` cookie for the session token.
pub(super) fn session_cookie(
    config: &AuthConfig,
    token: &str,
) -> Result<HeaderValue, InvalidHeaderValue> {
    let ttl_seconds = config.session_ttl_seconds();
    let mut cookie = format!(
        "{SESSION_COOKIE_NAME}={token}; Path=/; HttpOnly; SameSite=Lax; Max-Age={ttl_seconds}"
    );
    if config.cookie_secure() {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

fn clear_session_cookie(config: &AuthConfig) -> Result<HeaderValue, InvalidHeaderValue> {
    let mut cookie = format!("{SESSION_COOKIE_NAME}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0");
    if config.cookie_secure() {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

/// Short-lived cue telling the browser to drop its offline caches.
///
/// Not `HttpOnly`: page scripts read it to clear the caches.
pub(super) fn cache_invalidate_cookie(config: &AuthConfig) -> Result<HeaderValue, InvalidHeaderValue> {
    let mut cookie = format!(
        "{CACHE_INVALIDATE_COOKIE_NAME}={}; Path=/; SameSite=Lax; Max-Age={CACHE_INVALIDATE_TTL_SECONDS}",
        Ulid::new()
    );
    if config.cookie_secure() {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

pub(super) fn extract_session_token(headers: &HeaderMap) -> Option<String> {
    cookie_value(headers, SESSION_COOKIE_NAME).filter(|token| !token.is_empty())
}

/// Value of the named cookie across every `Cookie` header on the request.
pub(crate) fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|header| header.to_str().ok())
        .flat_map(|value| value.split(';'))
        .find_map(|pair| {
            let (key, val) = pair.trim().split_once('=')?;
            (key.trim() == name).then(|| val.trim().to_string())
        })
}
