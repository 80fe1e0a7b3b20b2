//! Background tasks for the voice agent.
//!
//! Includes:
//! - Sweeping sessions whose room dropped or emptied.
//! - Checking the backend connection and reconnecting when it is down.

use crate::manager::SessionManager;
use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Runs [`SessionManager::sweep`] every `period` until cancelled.
pub async fn run_sweep(manager: Arc<SessionManager>, period: Duration, cancel: CancellationToken) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let removed = manager.sweep().await;
        if removed > 0 {
            tracing::info!(
                removed,
                remaining = manager.session_count(),
                "swept idle sessions"
            );
        }
    }
    tracing::debug!("session sweep stopped");
}

/// Runs [`SessionManager::check_liveness`] every `period` until cancelled.
pub async fn run_liveness(
    manager: Arc<SessionManager>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if let Err(e) = manager.check_liveness().await {
            tracing::error!(error = %e, "failed to restore backend connection");
        }
    }
    tracing::debug!("liveness check stopped");
}
