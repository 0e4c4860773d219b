//! Auth handlers and supporting modules.
//!
//! This module coordinates the role-based login flow: throttling, probing the
//! four identity tables, and issuing the server-side session.
//!
//! ## Login Throttling
//!
//! Every login reserves one attempt for its client key before any password is
//! checked. Once the configured maximum is reserved inside the fixed window,
//! further attempts are refused with `error=locked` until the window expires.
//! A successful login clears the counter. The client key is the peer address
//! unless proxy headers are explicitly trusted.
//!
//! Expired counters and sessions are purged by a background sweeper.
//!
//! ## Storage Seams
//!
//! Credentials, sessions and rate-limit counters are reached through object
//! safe traits so the flow can run against `PostgreSQL` in production and
//! in-memory stores in tests or single-node development setups.

use anyhow::Result;
use std::{future::Future, pin::Pin};

pub mod authenticator;
pub mod credentials;
pub(crate) mod department;
pub(crate) mod login;
pub mod password;
pub mod rate_limit;
pub mod role;
pub(crate) mod session;
pub mod session_store;
mod state;
pub mod sweeper;
pub(crate) mod types;
mod utils;

pub use authenticator::{AuthError, AuthenticatedUser, Authenticator};
pub use credentials::{CredentialRecord, CredentialStore, PgCredentialStore};
pub use rate_limit::{
    Clock, MemoryRateLimiter, PgRateLimiter, RateLimitPolicy, RateLimitStatus, RateLimiter,
    SystemClock,
};
pub use role::Role;
pub use session::SessionManager;
pub use session_store::{MemorySessionStore, PgSessionStore, SessionRecord, SessionStore};
pub use state::{AuthConfig, AuthState};
pub use sweeper::{SweepReport, spawn_expiry_sweeper, sweep_expired};

/// Boxed future returned by the storage traits.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

#[cfg(test)]
mod test_db;
#[cfg(test)]
mod tests;
