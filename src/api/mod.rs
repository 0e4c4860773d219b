use crate::api::handlers::{
    auth::{
        self, AuthConfig, AuthState, CredentialStore, MemoryRateLimiter, MemorySessionStore,
        PgCredentialStore, PgRateLimiter, PgSessionStore, RateLimiter, SessionStore,
        spawn_expiry_sweeper,
    },
    health,
};
use anyhow::{Context, Result, anyhow};
use axum::{
    Extension, Router,
    body::Body,
    extract::MatchedPath,
    http::{HeaderName, HeaderValue, Request},
};
use sqlx::{PgPool, postgres::PgPoolOptions};
use std::{fmt, net::SocketAddr, str::FromStr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    request_id::PropagateRequestIdLayer, set_header::SetRequestHeaderLayer, trace::TraceLayer,
};
use tracing::{Span, info, info_span};
use ulid::Ulid;
use utoipa_axum::router::OpenApiRouter;

pub mod handlers;
// OpenAPI router wiring and route registration live in openapi.rs.
mod openapi;

pub use openapi::openapi;

const EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Where rate-limit counters or sessions are kept.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "memory" => Ok(Self::Memory),
            other => Err(anyhow!(
                "Unknown store backend: {other} (expected postgres or memory)"
            )),
        }
    }
}

impl fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Postgres => f.write_str("postgres"),
            Self::Memory => f.write_str("memory"),
        }
    }
}

/// Build the API router with all documented routes registered.
#[must_use]
pub fn router() -> OpenApiRouter {
    openapi::api_router()
}

/// Router with request ids, tracing and the auth state attached.
///
/// The database pool used by `/health` is layered on by [`new`].
pub fn app(auth_state: Arc<AuthState>) -> Router {
    let (router, _openapi) = router().split_for_parts();
    router.layer(
        ServiceBuilder::new()
            .layer(SetRequestHeaderLayer::if_not_present(
                HeaderName::from_static("x-request-id"),
                |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
            ))
            .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                "x-request-id",
            )))
            .layer(TraceLayer::new_for_http().make_span_with(make_span))
            .layer(Extension(auth_state)),
    )
}

/// Start the server
/// # Errors
/// Return error if failed to start the server
pub async fn new(
    port: u16,
    dsn: String,
    auth_config: AuthConfig,
    rate_limit_store: StoreBackend,
    session_store: StoreBackend,
) -> Result<()> {
    // Connect to database
    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .max_lifetime(Duration::from_secs(60 * 2))
        .test_before_acquire(true)
        .connect(&dsn)
        .await
        .context("Failed to connect to database")?;

    let auth_state = Arc::new(build_auth_state(
        &pool,
        auth_config,
        rate_limit_store,
        session_store,
    ));

    let _sweeper = spawn_expiry_sweeper(auth_state.clone(), EXPIRY_SWEEP_INTERVAL);

    let app = app(auth_state).layer(Extension(pool));

    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("Listening on [::]:{}", port);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {err}");
        }
        info!("Gracefully shutdown");
    })
    .await?;

    Ok(())
}

fn build_auth_state(
    pool: &PgPool,
    auth_config: AuthConfig,
    rate_limit_store: StoreBackend,
    session_store: StoreBackend,
) -> AuthState {
    let credentials: Arc<dyn CredentialStore> = Arc::new(PgCredentialStore::new(pool.clone()));

    let policy = auth_config.rate_limit_policy();
    let rate_limiter: Arc<dyn RateLimiter> = match rate_limit_store {
        StoreBackend::Postgres => Arc::new(PgRateLimiter::new(pool.clone(), policy)),
        StoreBackend::Memory => Arc::new(MemoryRateLimiter::new(policy)),
    };

    let sessions: Arc<dyn SessionStore> = match session_store {
        StoreBackend::Postgres => Arc::new(PgSessionStore::new(pool.clone())),
        StoreBackend::Memory => Arc::new(MemorySessionStore::new()),
    };

    info!(
        "rate limit store: {}, session store: {}",
        rate_limit_store, session_store
    );

    auth::AuthState::new(auth_config, credentials, rate_limiter, sessions)
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}
