//! Identity tables: one credential table per role.

use anyhow::Context;
use sqlx::{PgPool, Row, postgres::PgRow};
use std::fmt;
use tracing::Instrument;

use super::{StoreFuture, role::Role};

/// A single row from one of the identity tables.
#[derive(Clone)]
pub struct CredentialRecord {
    pub id: i64,
    pub email: String,
    pub password_hash: String,
    pub role: Role,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub department: Option<String>,
}

impl CredentialRecord {
    /// Name shown in the UI. Registrar accounts are shared and carry no personal name.
    #[must_use]
    pub fn display_name(&self) -> String {
        match (self.role, self.first_name.as_deref()) {
            (Role::Registrar, _) | (_, None) => self.role.as_str().to_string(),
            (_, Some(first_name)) => first_name.to_string(),
        }
    }
}

impl fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("id", &self.id)
            .field("email", &self.email)
            .field("password_hash", &"***")
            .field("role", &self.role)
            .field("first_name", &self.first_name)
            .field("last_name", &self.last_name)
            .field("department", &self.department)
            .finish()
    }
}

/// Read access to the identity tables.
pub trait CredentialStore: Send + Sync {
    /// Fetch the record whose login email matches exactly (store collation applies).
    fn find_by_email<'a>(
        &'a self,
        role: Role,
        email: &'a str,
    ) -> StoreFuture<'a, Option<CredentialRecord>>;

    /// Number of rows in the role's table using `email`.
    fn count_by_email<'a>(&'a self, role: Role, email: &'a str) -> StoreFuture<'a, i64>;

    /// Department of the given user, if the role has one.
    fn department(&self, role: Role, user_id: i64) -> StoreFuture<'_, Option<String>>;
}

const fn select_by_email(role: Role) -> &'static str {
    match role {
        Role::Registrar => {
            r"
            SELECT reg_id AS id, reg_email AS email, reg_password AS password_hash,
                   NULL::text AS first_name, NULL::text AS last_name, NULL::text AS department
            FROM registrar
            WHERE reg_email = $1
            LIMIT 1
        "
        }
        Role::DepartmentAdmin => {
            r"
            SELECT admin_id AS id, email, password AS password_hash,
                   first_name, last_name, department
            FROM dept_admin
            WHERE email = $1
            LIMIT 1
        "
        }
        Role::Teacher => {
            r"
            SELECT teacher_id AS id, email, password AS password_hash,
                   first_name, last_name, department
            FROM teacher
            WHERE email = $1
            LIMIT 1
        "
        }
        Role::Student => {
            r"
            SELECT student_id AS id, email, password AS password_hash,
                   first_name, last_name, department
            FROM student
            WHERE email = $1
            LIMIT 1
        "
        }
    }
}

const fn count_by_email(role: Role) -> &'static str {
    match role {
        Role::Registrar => "SELECT COUNT(*) FROM registrar WHERE reg_email = $1",
        Role::DepartmentAdmin => "SELECT COUNT(*) FROM dept_admin WHERE email = $1",
        Role::Teacher => "SELECT COUNT(*) FROM teacher WHERE email = $1",
        Role::Student => "SELECT COUNT(*) FROM student WHERE email = $1",
    }
}

const fn select_department(role: Role) -> Option<&'static str> {
    match role {
        Role::Registrar => None,
        Role::DepartmentAdmin => Some("SELECT department FROM dept_admin WHERE admin_id = $1"),
        Role::Teacher => Some("SELECT department FROM teacher WHERE teacher_id = $1"),
        Role::Student => Some("SELECT department FROM student WHERE student_id = $1"),
    }
}

fn decode_record(row: &PgRow, role: Role) -> Result<CredentialRecord, sqlx::Error> {
    Ok(CredentialRecord {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        password_hash: row.try_get("password_hash")?,
        role,
        first_name: row.try_get("first_name")?,
        last_name: row.try_get("last_name")?,
        department: row.try_get("department")?,
    })
}

/// `PostgreSQL` backed identity tables.
#[derive(Clone, Debug)]
pub struct PgCredentialStore {
    pool: PgPool,
}

impl PgCredentialStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl CredentialStore for PgCredentialStore {
    fn find_by_email<'a>(
        &'a self,
        role: Role,
        email: &'a str,
    ) -> StoreFuture<'a, Option<CredentialRecord>> {
        Box::pin(async move {
            let query = select_by_email(role);
            let span = tracing::info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "SELECT",
                db.table = role.table()
            );
            let row = sqlx::query(query)
                .bind(email)
                .fetch_optional(&self.pool)
                .instrument(span)
                .await
                .with_context(|| format!("failed to lookup {} credentials", role.table()))?;

            row.map(|row| decode_record(&row, role))
                .transpose()
                .with_context(|| format!("failed to decode {} credentials", role.table()))
        })
    }

    fn count_by_email<'a>(&'a self, role: Role, email: &'a str) -> StoreFuture<'a, i64> {
        Box::pin(async move {
            let span = tracing::info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "SELECT",
                db.table = role.table()
            );
            let row = sqlx::query(count_by_email(role))
                .bind(email)
                .fetch_one(&self.pool)
                .instrument(span)
                .await
                .with_context(|| format!("failed to count {} emails", role.table()))?;
            row.try_get(0)
                .with_context(|| format!("failed to decode {} email count", role.table()))
        })
    }

    fn department(&self, role: Role, user_id: i64) -> StoreFuture<'_, Option<String>> {
        Box::pin(async move {
            let Some(query) = select_department(role) else {
                return Ok(None);
            };
            let span = tracing::info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "SELECT",
                db.table = role.table()
            );
            let row = sqlx::query(query)
                .bind(user_id)
                .fetch_optional(&self.pool)
                .instrument(span)
                .await
                .with_context(|| format!("failed to lookup {} department", role.table()))?;
            let department = match row {
                Some(row) => row
                    .try_get::<Option<String>, _>("department")
                    .with_context(|| format!("failed to decode {} department", role.table()))?,
                None => None,
            };
            Ok(department)
        })
    }
}
