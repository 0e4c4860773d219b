//! Login controller.
//!
//! ```text
//! start -> reserve attempt -> denied                      -> redirect ?error=locked
//!                           -> authenticate -> no match    -> redirect ?error=invalid&attempts_left=N
//!                                           -> match       -> session + cookies -> landing page
//!                                           -> error       -> attempt released, 400 or 500
//! ```

use axum::{
    Form,
    extract::{ConnectInfo, Extension},
    http::{HeaderMap, StatusCode, header::SET_COOKIE},
    response::{IntoResponse, Redirect},
};
use secrecy::SecretString;
use std::{net::SocketAddr, sync::Arc};
use tracing::{error, info, instrument, warn};

use super::{
    authenticator::{AuthError, AuthenticatedUser},
    session::{cache_invalidate_cookie, extract_session_token, session_cookie},
    state::AuthState,
    types::LoginForm,
    utils::extract_client_key,
};

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum LoginOutcome {
    Locked,
    Invalid { attempts_left: u32 },
    Authenticated {
        user: AuthenticatedUser,
        session_token: String,
    },
}

/// Run one login attempt for `client_key`.
///
/// The attempt is reserved before any password is checked, so a locked client
/// never reaches the credential store and parallel requests share one budget.
#[instrument(skip_all, fields(client = %client_key))]
pub(crate) async fn process_login(
    auth_state: &AuthState,
    client_key: &str,
    previous_token: Option<&str>,
    email: &str,
    password: &SecretString,
) -> Result<LoginOutcome, AuthError> {
    let limiter = auth_state.rate_limiter();
    let reservation = limiter.try_acquire(client_key).await?;
    if !reservation.allowed {
        warn!("login refused, too many failed attempts");
        return Ok(LoginOutcome::Locked);
    }

    let verdict = auth_state.authenticator().authenticate(email, password).await;
    match verdict {
        Err(err) => {
            // Blank input and storage failures are not failed guesses.
            if let Err(release_err) = limiter.release(client_key).await {
                error!("Failed to release login attempt: {release_err:#}");
            }
            Err(err)
        }
        Ok(None) => {
            info!(attempts_left = reservation.remaining, "login failed");
            Ok(LoginOutcome::Invalid {
                attempts_left: reservation.remaining,
            })
        }
        Ok(Some(user)) => {
            limiter.record_success(client_key).await?;
            let session_token = auth_state
                .sessions()
                .create_session(previous_token, &user)
                .await?;
            info!(role = %user.role, user_id = user.user_id, "login succeeded");
            Ok(LoginOutcome::Authenticated {
                user,
                session_token,
            })
        }
    }
}

#[utoipa::path(
    post,
    path = "/auth/login",
    request_body(content = LoginForm, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 303, description = "Redirect to the role landing page, or back to the login page with an error"),
        (status = 400, description = "Email or password missing", body = String),
        (status = 500, description = "Storage failure", body = String)
    ),
    tag = "auth"
)]
pub async fn login(
    auth_state: Extension<Arc<AuthState>>,
    peer: Option<Extension<ConnectInfo<SocketAddr>>>,
    headers: HeaderMap,
    Form(form): Form<LoginForm>,
) -> impl IntoResponse {
    let client_key = extract_client_key(
        &headers,
        peer.map(|Extension(ConnectInfo(addr))| addr),
        auth_state.config().trust_proxy_headers(),
    );
    let previous_token = extract_session_token(&headers);
    let password = SecretString::from(form.password);
    let entry_page = auth_state.config().entry_page();

    let outcome = process_login(
        &auth_state,
        &client_key,
        previous_token.as_deref(),
        &form.email,
        &password,
    )
    .await;

    match outcome {
        Ok(LoginOutcome::Locked) => Redirect::to(&format!("{entry_page}?error=locked")).into_response(),
        Ok(LoginOutcome::Invalid { attempts_left }) => Redirect::to(&format!(
            "{entry_page}?error=invalid&attempts_left={attempts_left}"
        ))
        .into_response(),
        Ok(LoginOutcome::Authenticated {
            user,
            session_token,
        }) => {
            let config = auth_state.config();
            let mut response_headers = HeaderMap::new();
            match session_cookie(config, &session_token) {
                Ok(cookie) => {
                    response_headers.append(SET_COOKIE, cookie);
                }
                Err(err) => {
                    error!("Failed to build session cookie: {err}");
                    return (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
                        .into_response();
                }
            }
            if let Ok(cookie) = cache_invalidate_cookie(config) {
                response_headers.append(SET_COOKIE, cookie);
            }
            (response_headers, Redirect::to(user.landing_path())).into_response()
        }
        Err(AuthError::MissingCredentials) => (
            StatusCode::BAD_REQUEST,
            AuthError::MissingCredentials.to_string(),
        )
            .into_response(),
        Err(AuthError::Store(err)) => {
            error!("Login failed: {err:#}");
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
        }
    }
}
