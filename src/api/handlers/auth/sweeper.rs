//! Background removal of expired rate-limit counters and sessions.

use anyhow::Result;
use std::{sync::Arc, time::Duration};
use tokio::time::sleep;
use tracing::{debug, error};

use super::state::AuthState;

/// Removal counts from one sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub login_attempts: u64,
    pub sessions: u64,
}

/// Purge expired counters and sessions once.
///
/// # Errors
/// Returns an error if either store fails.
pub async fn sweep_expired(auth_state: &AuthState) -> Result<SweepReport> {
    let login_attempts = auth_state.rate_limiter().purge_expired().await?;
    let sessions = auth_state.sessions().purge_expired().await?;
    Ok(SweepReport {
        login_attempts,
        sessions,
    })
}

/// Spawn a task that sweeps on a fixed cadence for the life of the process.
pub fn spawn_expiry_sweeper(
    auth_state: Arc<AuthState>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match sweep_expired(&auth_state).await {
                Ok(report) => debug!(
                    login_attempts = report.login_attempts,
                    sessions = report.sessions,
                    "expired auth rows purged"
                ),
                Err(err) => error!("expiry sweep failed: {err:#}"),
            }

            sleep(interval).await;
        }
    })
}
