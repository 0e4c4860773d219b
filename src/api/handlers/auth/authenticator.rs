//! Multi-table credential verification.
//!
//! Tables are probed in [`Role::PRIORITY`] order and the first record whose
//! password verifies wins. A miss is indistinguishable from a wrong password.

use anyhow::Context;
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use super::{
    credentials::{CredentialRecord, CredentialStore},
    password::verify_password,
    role::Role,
};

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Email and password are required.")]
    MissingCredentials,
    #[error("credential store failure: {0:#}")]
    Store(#[from] anyhow::Error),
}

/// Identity resolved by a successful login.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub user_id: i64,
    pub role: Role,
    pub email: String,
    pub display_name: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub department: Option<String>,
}

impl AuthenticatedUser {
    fn from_record(record: CredentialRecord, email: &str) -> Self {
        let display_name = record.display_name();
        let (first_name, last_name, department) = if record.role == Role::Registrar {
            (None, None, None)
        } else {
            // Personal accounts always carry these fields, possibly empty.
            (
                Some(record.first_name.unwrap_or_default()),
                Some(record.last_name.unwrap_or_default()),
                Some(record.department.unwrap_or_default()),
            )
        };
        Self {
            user_id: record.id,
            role: record.role,
            email: email.to_string(),
            display_name,
            first_name,
            last_name,
            department,
        }
    }

    #[must_use]
    pub const fn landing_path(&self) -> &'static str {
        self.role.landing_path()
    }
}

#[derive(Clone)]
pub struct Authenticator {
    store: Arc<dyn CredentialStore>,
}

impl Authenticator {
    #[must_use]
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }

    /// Resolve `email`/`password` to a user, or `None` when nothing verifies.
    ///
    /// # Errors
    /// Returns [`AuthError::MissingCredentials`] for blank input (before any lookup)
    /// and [`AuthError::Store`] when a table cannot be read.
    #[instrument(skip_all)]
    pub async fn authenticate(
        &self,
        email: &str,
        password: &SecretString,
    ) -> Result<Option<AuthenticatedUser>, AuthError> {
        let email = email.trim();
        if email.is_empty() || password.expose_secret().is_empty() {
            return Err(AuthError::MissingCredentials);
        }

        self.flag_duplicate_email(email).await?;

        for role in Role::PRIORITY {
            let Some(record) = self.store.find_by_email(role, email).await? else {
                continue;
            };

            let candidate = password.expose_secret().to_string();
            let stored_hash = record.password_hash.clone();
            let verified =
                tokio::task::spawn_blocking(move || verify_password(&candidate, &stored_hash))
                    .await
                    .context("password verification task failed")?;

            if verified {
                debug!("{} login verified for {}", role, email);
                return Ok(Some(AuthenticatedUser::from_record(record, email)));
            }
            debug!("{} password mismatch for {}", role, email);
        }

        Ok(None)
    }

    /// The same email in several identity tables is tolerated but reported.
    async fn flag_duplicate_email(&self, email: &str) -> Result<(), AuthError> {
        let mut occurrences = 0;
        for role in Role::PRIORITY {
            occurrences += self.store.count_by_email(role, email).await?;
        }
        if occurrences > 1 {
            warn!(
                occurrences,
                "SECURITY WARNING: email {email} exists in multiple user tables"
            );
        }
        Ok(())
    }
}
