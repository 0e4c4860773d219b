use crate::GIT_COMMIT_HASH;
use axum::{
    body::Body,
    extract::Extension,
    http::{
        HeaderMap, HeaderValue, Method, StatusCode,
        header::{CACHE_CONTROL, CONTENT_TYPE, PRAGMA},
    },
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use sqlx::{Connection, PgPool};
use tracing::{Instrument, debug, error, info_span};
use utoipa::ToSchema;

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct Health {
    commit: String,
    name: String,
    version: String,
    database: String,
}

#[utoipa::path(
    get,
    path= "/health",
    responses (
        (status = 200, description = "Database is reachable", body = [Health]),
        (status = 503, description = "Database is unreachable", body = [Health])
    ),
    tag= "smartspace"
)]
// axum handler for health
pub async fn health(method: Method, pool: Extension<PgPool>) -> impl IntoResponse {
    let acquire_span = info_span!(
        "db.acquire",
        db.system = "postgresql",
        db.operation = "ACQUIRE"
    );
    let result = match pool.0.acquire().instrument(acquire_span).await {
        Ok(mut conn) => {
            let ping_span = info_span!("db.ping", db.system = "postgresql", db.operation = "PING");
            conn.ping().instrument(ping_span).await.map_err(|error| {
                error!("Failed to ping database: {}", error);
                StatusCode::SERVICE_UNAVAILABLE
            })
        }

        Err(error) => {
            error!("Failed to acquire database connection: {}", error);

            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    };

    let health = Health {
        commit: GIT_COMMIT_HASH.to_string(),
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        database: if result.is_ok() {
            "ok".to_string()
        } else {
            "error".to_string()
        },
    };

    let body = if method == Method::GET {
        Json(&health).into_response()
    } else {
        Body::empty().into_response()
    };

    let headers = x_app_headers(&health);

    if result.is_ok() {
        debug!("Database connection is healthy");
        (StatusCode::OK, headers, body)
    } else {
        debug!("Database connection is unhealthy");
        (StatusCode::SERVICE_UNAVAILABLE, headers, body)
    }
}

/// `X-App: name:version:short-commit`, or no header if it cannot be encoded.
fn x_app_headers(health: &Health) -> HeaderMap {
    let short_hash = if health.commit.len() > 7 {
        health.commit.get(0..7).unwrap_or("")
    } else {
        ""
    };
    let mut headers = HeaderMap::new();
    match format!("{}:{}:{}", health.name, health.version, short_hash).parse::<HeaderValue>() {
        Ok(value) => {
            debug!("X-App header: {:?}", value);
            headers.insert("X-App", value);
        }
        Err(err) => error!("Failed to parse X-App header: {}", err),
    }
    headers
}

#[utoipa::path(
    get,
    path = "/connection-test",
    responses(
        (status = 200, description = "Server is reachable", body = String, content_type = "text/plain")
    ),
    tag = "smartspace"
)]
// Connectivity probe for offline clients; never touches state.
pub async fn connection_test(method: Method) -> impl IntoResponse {
    let headers = [
        (CONTENT_TYPE, "text/plain; charset=utf-8"),
        (CACHE_CONTROL, "no-store, no-cache, must-revalidate, max-age=0"),
        (PRAGMA, "no-cache"),
    ];
    let body = if method == Method::HEAD { "" } else { "OK" };
    (StatusCode::OK, headers, body)
}
