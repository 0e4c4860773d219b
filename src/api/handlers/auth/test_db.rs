//! `PostgreSQL` fixture for the store tests.
//!
//! Tests run against the database named by `SMARTSPACE_TEST_DSN` and are
//! skipped when it is unset. Rows use ULID-derived keys, so tests can share a
//! database and run in parallel.

use anyhow::{Context, Result};
use sqlx::{PgPool, postgres::PgPoolOptions};
use std::time::Duration;
use tokio::sync::OnceCell;

const SCHEMA_SQL: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/sql/schema.sql"));

pub(crate) const TEST_DSN_ENV: &str = "SMARTSPACE_TEST_DSN";

static SCHEMA_APPLIED: OnceCell<()> = OnceCell::const_new();

/// Pool for the test database, or `None` when no database is configured.
pub(crate) async fn test_pool() -> Result<Option<PgPool>> {
    let Ok(dsn) = std::env::var(TEST_DSN_ENV) else {
        eprintln!("Skipping integration test: {TEST_DSN_ENV} is not set");
        return Ok(None);
    };

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&dsn)
        .await
        .context("failed to connect to test database")?;

    SCHEMA_APPLIED
        .get_or_try_init(|| async {
            sqlx::Executor::execute(&pool, SCHEMA_SQL)
                .await
                .context("failed to execute schema SQL")?;
            Ok::<(), anyhow::Error>(())
        })
        .await?;

    Ok(Some(pool))
}

/// Move a client's rate-limit window one hour into the past.
pub(crate) async fn age_login_window(pool: &PgPool, client_key: &str) -> Result<()> {
    sqlx::query(
        "UPDATE login_attempts SET window_start = NOW() - INTERVAL '1 hour' WHERE client_key = $1",
    )
    .bind(client_key)
    .execute(pool)
    .await
    .context("failed to age login window")?;
    Ok(())
}
