//! Small helpers for session tokens and client identification.

use anyhow::{Context, Result};
use axum::http::HeaderMap;
use base64::Engine;
use rand::{RngCore, rngs::OsRng};
use sha2::{Digest, Sha256};
use std::net::SocketAddr;

/// Create a new session token for the auth cookie.
/// The raw value is only returned to set the cookie; the store keeps a hash.
pub(crate) fn generate_session_token() -> Result<String> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate session token")?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
}

/// Hash a session token so raw values never reach the store.
pub(crate) fn hash_session_token(token: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().to_vec()
}

pub(super) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}

/// Key used for login throttling.
///
/// Forwarding headers are client-controlled, so `X-Forwarded-For` (first hop) and
/// `X-Real-IP` are only read when the server sits behind a proxy that sets them.
/// Otherwise the peer address is the key.
pub(super) fn extract_client_key(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trust_proxy_headers: bool,
) -> String {
    let proxied = if trust_proxy_headers {
        forwarded_client(headers)
    } else {
        None
    };
    proxied
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

fn forwarded_client(headers: &HeaderMap) -> Option<String> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };
    header("x-forwarded-for").or_else(|| header("x-real-ip"))
}
