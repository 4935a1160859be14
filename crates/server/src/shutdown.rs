use std::time::Duration;

use anyhow::anyhow;
use mentionbot_db::StoreFacade;
use tokio::task::JoinError;
use tracing::{error, info, warn};

/// Stops the periodic sync, then makes one bounded push attempt. Failures are
/// logged only.
pub async fn shutdown_store(store: &StoreFacade, timeout: Duration) {
    store.stop_periodic_sync().await;

    match tokio::time::timeout(timeout, store.sync_push()).await {
        Ok(Ok(())) => {
            info!(event_name = "store.sync.final_push", correlation_id = "shutdown", "final push done")
        }
        Ok(Err(error)) => warn!(
            event_name = "store.sync.final_push_failed",
            correlation_id = "shutdown",
            error = %error,
            "final push failed"
        ),
        Err(_) => warn!(
            event_name = "store.sync.final_push_failed",
            correlation_id = "shutdown",
            timeout_secs = timeout.as_secs(),
            "final push timed out"
        ),
    }
}

/// The listener only returns once it has given up, so any exit is an error
/// that should take the process down.
pub fn listener_exit_error(joined: Result<anyhow::Result<()>, JoinError>) -> anyhow::Error {
    let error = match joined {
        Ok(Ok(())) => anyhow!("slack listener stopped after exhausting reconnect attempts"),
        Ok(Err(error)) => error.context("slack listener failed"),
        Err(join_error) => anyhow!("slack listener task aborted: {join_error}"),
    };
    error!(
        event_name = "system.server.slack_listener_exited",
        correlation_id = "runtime",
        error = %format!("{error:#}"),
        "slack listener exited; shutting down"
    );
    error
}
