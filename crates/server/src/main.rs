mod bootstrap;
mod health;
mod mention;
mod shutdown;

use std::{fs::OpenOptions, sync::Arc, sync::Mutex, time::Duration};

use anyhow::Result;
use mentionbot_core::config::{AppConfig, LoadOptions};
use mentionbot_core::DataStore;
use tracing::{info, warn};

use crate::bootstrap::Application;

const FINAL_SYNC_TIMEOUT: Duration = Duration::from_secs(120);

/// Console output in the configured format, plus a plain-text copy in
/// `<LOG_DIR>/app.log` for the log-reading tools.
fn init_logging(config: &AppConfig) -> Result<()> {
    use mentionbot_core::config::LogFormat::*;
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    std::fs::create_dir_all(&config.logging.dir)?;
    let app_log = OpenOptions::new().create(true).append(true).open(config.logging.app_log_path())?;

    let console = match config.logging.format {
        Compact => fmt::layer().with_target(false).compact().boxed(),
        Pretty => fmt::layer().with_target(false).pretty().boxed(),
        Json => fmt::layer().with_target(false).json().boxed(),
    };
    let file = fmt::layer().with_target(false).with_ansi(false).with_writer(Mutex::new(app_log));

    tracing_subscriber::registry()
        .with(EnvFilter::new(&config.logging.level))
        .with(console)
        .with(file)
        .try_init()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    // Load config and initialize logging before any other operations
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config)?;

    let Application { config, store, slack_runner } = bootstrap::bootstrap_with_config(config)?;

    if let Err(error) = store.sync_pull().await {
        warn!(
            event_name = "store.sync.pull_failed",
            correlation_id = "bootstrap",
            error = %error,
            "startup pull failed; continuing with the local file"
        );
    }
    store.start_periodic_sync();

    health::spawn(
        &config.server.bind_address,
        config.server.port,
        Arc::clone(&store) as Arc<dyn DataStore>,
    )
    .await?;

    let mut listener = tokio::spawn(async move { slack_runner.start().await });

    info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        thread_id = "unknown",
        "mentionbot started"
    );
    let outcome = tokio::select! {
        signal = wait_for_shutdown() => signal,
        joined = &mut listener => Err(shutdown::listener_exit_error(joined)),
    };
    info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        thread_id = "unknown",
        "mentionbot stopping"
    );

    shutdown::shutdown_store(&store, FINAL_SYNC_TIMEOUT).await;
    outcome
}

async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;
    Ok(())
}
