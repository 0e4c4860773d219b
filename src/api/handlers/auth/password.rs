//! Password hash verification.
//!
//! Stored hashes are PHC strings: Argon2 (`$argon2id$`) or the `$2y$`/`$2b$`
//! bcrypt hashes written by the legacy PHP portal.

use argon2::{Argon2, PasswordHash, PasswordVerifier};
use tracing::warn;

/// Check `password` against `stored_hash`. Unknown or corrupt hashes never verify.
#[must_use]
pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    if is_bcrypt(stored_hash) {
        return match bcrypt::verify(password, stored_hash) {
            Ok(valid) => valid,
            Err(err) => {
                warn!("Unreadable bcrypt hash: {err}");
                false
            }
        };
    }

    match PasswordHash::new(stored_hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(err) => {
            warn!("Unreadable password hash: {err}");
            false
        }
    }
}

fn is_bcrypt(hash: &str) -> bool {
    ["$2y$", "$2b$", "$2a$"]
        .iter()
        .any(|prefix| hash.starts_with(prefix))
}
