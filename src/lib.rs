//! # `SmartSpace` (Login Portal & Offline Client Support)
//!
//! `smartspace` is the login front door of the MCiSmartSpace room and space
//! management application. It authenticates users against four disjoint
//! identity tables, issues a server-side session and redirects the browser to
//! the landing page of the matched role.
//!
//! ## Roles
//!
//! Identity tables are probed in a fixed priority order and the first verified
//! match wins:
//!
//! 1. **Registrar** → `/registrar/registrar.php`
//! 2. **Department Admin** → `/department-admin/dept-admin.php`
//! 3. **Teacher** → `/users/users_browse_room.php`
//! 4. **Student** → `/users/users_browse_room.php`
//!
//! The same email may exist in more than one table. This is logged as a
//! security signal and never blocks a login.
//!
//! ## Login Throttling
//!
//! Attempts are counted per client (the peer address, or the first proxy hop
//! when proxy headers are trusted) inside a fixed window. Each attempt is
//! reserved before any password is checked. Once the limit is reached the
//! client is redirected with `error=locked` and the identity tables are not
//! consulted until the window expires or a successful login clears the counter.
//!
//! ## Sessions
//!
//! A successful login always drops the previous session and issues a fresh
//! random token. Only the SHA-256 hash of the token is stored.
//!
//! ## Offline Support
//!
//! [`offline`] models the browser side: a cache-first offline worker with a
//! canned offline page and a connectivity monitor that reloads the page when
//! the server becomes reachable again.

pub mod api;
pub mod cli;
pub mod offline;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);
