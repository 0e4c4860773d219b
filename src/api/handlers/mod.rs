//! API handlers for the login portal.

pub mod auth;
pub mod health;
