//! Server-side session storage keyed by the hash of the session token.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row, types::Json};
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;
use tracing::Instrument;
use utoipa::ToSchema;

use super::{StoreFuture, authenticator::AuthenticatedUser, role::Role, utils::is_unique_violation};

/// Normalized user record kept for the lifetime of a session.
#[derive(ToSchema, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SessionRecord {
    pub user_id: i64,
    pub role: Role,
    pub email: String,
    pub name: String,
    pub user_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firstname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lastname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
    /// Tells the client to drop its offline caches on the next page load.
    #[serde(default)]
    pub clear_sw_cache: bool,
}

impl SessionRecord {
    #[must_use]
    pub fn from_user(user: &AuthenticatedUser) -> Self {
        Self {
            user_id: user.user_id,
            role: user.role,
            email: user.email.clone(),
            name: user.display_name.clone(),
            user_type: user.role.user_type(),
            firstname: user.first_name.clone(),
            lastname: user.last_name.clone(),
            department: user.department.clone(),
            clear_sw_cache: true,
        }
    }
}

pub trait SessionStore: Send + Sync {
    /// Store a new session. Returns `false` if the hash is already taken.
    fn insert<'a>(
        &'a self,
        token_hash: &'a [u8],
        record: &'a SessionRecord,
        ttl: Duration,
    ) -> StoreFuture<'a, bool>;

    /// Live session for the hash, if any.
    fn lookup<'a>(&'a self, token_hash: &'a [u8]) -> StoreFuture<'a, Option<SessionRecord>>;

    /// Remove the session. Missing sessions are not an error.
    fn delete<'a>(&'a self, token_hash: &'a [u8]) -> StoreFuture<'a, ()>;

    /// Remove every expired session. Returns how many were removed.
    fn purge_expired(&self) -> StoreFuture<'_, u64>;
}

#[derive(Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<Vec<u8>, (SessionRecord, Instant)>>,
}

impl MemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn insert<'a>(
        &'a self,
        token_hash: &'a [u8],
        record: &'a SessionRecord,
        ttl: Duration,
    ) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let now = Instant::now();
            let mut sessions = self.sessions.lock().await;
            sessions.retain(|_, (_, expires_at)| *expires_at > now);
            if sessions.contains_key(token_hash) {
                return Ok(false);
            }
            sessions.insert(token_hash.to_vec(), (record.clone(), now + ttl));
            Ok(true)
        })
    }

    fn lookup<'a>(&'a self, token_hash: &'a [u8]) -> StoreFuture<'a, Option<SessionRecord>> {
        Box::pin(async move {
            let sessions = self.sessions.lock().await;
            Ok(sessions
                .get(token_hash)
                .filter(|(_, expires_at)| *expires_at > Instant::now())
                .map(|(record, _)| record.clone()))
        })
    }

    fn delete<'a>(&'a self, token_hash: &'a [u8]) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.sessions.lock().await.remove(token_hash);
            Ok(())
        })
    }

    fn purge_expired(&self) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            let now = Instant::now();
            let mut sessions = self.sessions.lock().await;
            let before = sessions.len();
            sessions.retain(|_, (_, expires_at)| *expires_at > now);
            Ok(u64::try_from(before - sessions.len()).unwrap_or(u64::MAX))
        })
    }
}

/// `PostgreSQL` sessions in `user_sessions`; only token hashes are stored.
#[derive(Clone, Debug)]
pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl SessionStore for PgSessionStore {
    fn insert<'a>(
        &'a self,
        token_hash: &'a [u8],
        record: &'a SessionRecord,
        ttl: Duration,
    ) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let query = r"
                INSERT INTO user_sessions (session_hash, user_id, role, data, expires_at)
                VALUES ($1, $2, $3, $4, NOW() + ($5 * INTERVAL '1 second'))
            ";
            let span = tracing::info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "INSERT",
                db.statement = query
            );
            let ttl_seconds = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
            let result = sqlx::query(query)
                .bind(token_hash)
                .bind(record.user_id)
                .bind(record.role.as_str())
                .bind(Json(record))
                .bind(ttl_seconds)
                .execute(&self.pool)
                .instrument(span)
                .await;

            match result {
                Ok(_) => Ok(true),
                Err(err) if is_unique_violation(&err) => Ok(false),
                Err(err) => Err(err).context("failed to insert session"),
            }
        })
    }

    fn lookup<'a>(&'a self, token_hash: &'a [u8]) -> StoreFuture<'a, Option<SessionRecord>> {
        Box::pin(async move {
            let query = r"
                SELECT data
                FROM user_sessions
                WHERE session_hash = $1
                  AND expires_at > NOW()
                LIMIT 1
            ";
            let span = tracing::info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "SELECT",
                db.statement = query
            );
            let row = sqlx::query(query)
                .bind(token_hash)
                .fetch_optional(&self.pool)
                .instrument(span)
                .await
                .context("failed to lookup session")?;

            let Some(row) = row else {
                return Ok(None);
            };
            let Json(record): Json<SessionRecord> = row
                .try_get("data")
                .context("failed to decode session record")?;
            Ok(Some(record))
        })
    }

    fn delete<'a>(&'a self, token_hash: &'a [u8]) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let query = "DELETE FROM user_sessions WHERE session_hash = $1";
            let span = tracing::info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "DELETE",
                db.statement = query
            );
            sqlx::query(query)
                .bind(token_hash)
                .execute(&self.pool)
                .instrument(span)
                .await
                .context("failed to delete session")?;
            Ok(())
        })
    }

    fn purge_expired(&self) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            let query = "DELETE FROM user_sessions WHERE expires_at <= NOW()";
            let span = tracing::info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "DELETE",
                db.statement = query
            );
            let result = sqlx::query(query)
                .execute(&self.pool)
                .instrument(span)
                .await
                .context("failed to purge expired sessions")?;
            Ok(result.rows_affected())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    fn record() -> SessionRecord {
        SessionRecord {
            user_id: 42,
            role: Role::Teacher,
            email: "teacher@mcismartspace.edu".to_string(),
            name: "Ana".to_string(),
            user_type: "teacher".to_string(),
            firstname: Some("Ana".to_string()),
            lastname: Some(String::new()),
            department: Some("CCS".to_string()),
            clear_sw_cache: true,
        }
    }

    #[tokio::test]
    async fn memory_store_insert_lookup_delete() -> Result<()> {
        let store = MemorySessionStore::new();
        assert!(store.insert(b"hash", &record(), Duration::from_secs(60)).await?);
        assert_eq!(store.lookup(b"hash").await?, Some(record()));

        store.delete(b"hash").await?;
        assert_eq!(store.lookup(b"hash").await?, None);

        // Deleting twice is fine.
        store.delete(b"hash").await?;
        Ok(())
    }

    #[tokio::test]
    async fn memory_store_rejects_duplicate_hash() -> Result<()> {
        let store = MemorySessionStore::new();
        assert!(store.insert(b"hash", &record(), Duration::from_secs(60)).await?);
        assert!(!store.insert(b"hash", &record(), Duration::from_secs(60)).await?);
        Ok(())
    }

    #[tokio::test]
    async fn memory_store_hides_expired_sessions() -> Result<()> {
        let store = MemorySessionStore::new();
        assert!(store.insert(b"hash", &record(), Duration::ZERO).await?);
        assert_eq!(store.lookup(b"hash").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn memory_store_purges_expired_sessions() -> Result<()> {
        let store = MemorySessionStore::new();
        assert!(store.insert(b"live", &record(), Duration::from_secs(60)).await?);
        assert!(store.insert(b"gone", &record(), Duration::ZERO).await?);
        assert_eq!(store.purge_expired().await?, 1);
        assert_eq!(store.purge_expired().await?, 0);
        assert_eq!(store.lookup(b"live").await?, Some(record()));
        Ok(())
    }

    #[test]
    fn session_record_json_shape() -> Result<()> {
        let value = serde_json::to_value(record())?;
        assert_eq!(value["role"], "Teacher");
        assert_eq!(value["user_type"], "teacher");
        assert_eq!(value["clear_sw_cache"], true);

        let registrar = SessionRecord {
            role: Role::Registrar,
            firstname: None,
            lastname: None,
            department: None,
            ..record()
        };
        let value = serde_json::to_value(&registrar)?;
        assert!(value.get("firstname").is_none());
        let decoded: SessionRecord = serde_json::from_value(value)?;
        assert_eq!(decoded, registrar);
        Ok(())
    }
}
