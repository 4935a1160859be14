use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mentionbot_core::config::{StoreConfig, StoreMode};
use mentionbot_core::store::{DataStore, QueryOutcome};
use serde_json::Value;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::local::LocalStore;
use crate::mirror::{AzCopy, BlobMirror, RemoteLocation, SyncError};

/// Single entry point to the store. Statements share a read gate; pull and
/// push take it exclusively so the file is never copied mid-write or
/// swapped under a running statement.
pub struct StoreFacade {
    inner: Arc<FacadeInner>,
    periodic: Mutex<Option<PeriodicSync>>,
}

struct FacadeInner {
    local: LocalStore,
    mirror: Option<BlobMirror>,
    gate: RwLock<()>,
    interval: Duration,
}

struct PeriodicSync {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl StoreFacade {
    pub fn from_config(config: &StoreConfig) -> Result<Self, SyncError> {
        let local = LocalStore::new(&config.path, config.busy_timeout_ms);
        let mirror = match config.mode {
            StoreMode::Local => None,
            StoreMode::AzureBlob => {
                let base_url = config.blob.remote_url(&config.path).ok_or_else(|| {
                    SyncError::NotConfigured(
                        "set AZURE_BLOB_URL or AZURE_STORAGE_ACCOUNT_NAME and AZURE_BLOB_CONTAINER"
                            .to_string(),
                    )
                })?;
                let remote = RemoteLocation::new(base_url, config.blob.sas_token.clone());
                Some(BlobMirror::new(
                    &config.path,
                    remote,
                    Arc::new(AzCopy::new(config.copy_program.clone())),
                ))
            }
        };

        Ok(Self::new(local, mirror, config.sync_interval()))
    }

    pub fn new(local: LocalStore, mirror: Option<BlobMirror>, interval: Duration) -> Self {
        Self {
            inner: Arc::new(FacadeInner { local, mirror, gate: RwLock::new(()), interval }),
            periodic: Mutex::new(None),
        }
    }

    pub fn mode(&self) -> StoreMode {
        if self.inner.mirror.is_some() {
            StoreMode::AzureBlob
        } else {
            StoreMode::Local
        }
    }

    pub fn local_path(&self) -> &Path {
        self.inner.local.path()
    }

    pub async fn sync_pull(&self) -> Result<(), SyncError> {
        self.inner.pull().await
    }

    pub async fn sync_push(&self) -> Result<(), SyncError> {
        self.inner.push().await
    }

    /// Pushes immediately, then once per interval until stopped.
    pub fn start_periodic_sync(&self) {
        if self.inner.mirror.is_none() {
            debug!(event_name = "store.sync.periodic_skipped", "local mode, no periodic sync");
            return;
        }

        let mut periodic = self.periodic.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if periodic.as_ref().is_some_and(|running| !running.handle.is_finished()) {
            warn!(event_name = "store.sync.periodic_already_running", "periodic sync already started");
            return;
        }

        let (stop, mut stop_rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        let interval = inner.interval;
        let handle = tokio::spawn(async move {
            loop {
                if let Err(error) = inner.push().await {
                    warn!(
                        event_name = "store.sync.push_failed",
                        error = %error,
                        "periodic push failed, retrying next interval"
                    );
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!(event_name = "store.sync.periodic_stopped", "periodic sync loop exited");
        });

        info!(
            event_name = "store.sync.periodic_started",
            interval_secs = interval.as_secs(),
            "periodic sync started"
        );
        *periodic = Some(PeriodicSync { stop, handle });
    }

    /// Stops the periodic loop and waits for an in-flight push to finish.
    pub async fn stop_periodic_sync(&self) {
        let running = self.periodic.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take();
        let Some(running) = running else {
            debug!(event_name = "store.sync.periodic_not_running", "no periodic sync to stop");
            return;
        };

        let _ = running.stop.send(true);
        if let Err(error) = running.handle.await {
            warn!(event_name = "store.sync.periodic_join_failed", error = %error, "periodic task ended abnormally");
        }
    }
}

impl FacadeInner {
    async fn push(&self) -> Result<(), SyncError> {
        let Some(mirror) = &self.mirror else {
            debug!(event_name = "store.sync.push_skipped", "local mode, nothing to push");
            return Ok(());
        };

        let _exclusive = self.gate.write().await;
        mirror.push().await?;
        info!(
            event_name = "store.sync.push_completed",
            remote = %mirror.remote().redacted(),
            "store uploaded"
        );
        Ok(())
    }

    async fn pull(&self) -> Result<(), SyncError> {
        let Some(mirror) = &self.mirror else {
            debug!(event_name = "store.sync.pull_skipped", "local mode, nothing to pull");
            return Ok(());
        };

        let _exclusive = self.gate.write().await;
        mirror.pull().await?;
        info!(
            event_name = "store.sync.pull_completed",
            remote = %mirror.remote().redacted(),
            "store downloaded"
        );
        Ok(())
    }
}

#[async_trait]
impl DataStore for StoreFacade {
    async fn query(&self, sql: &str, params: &[Value]) -> QueryOutcome {
        let _shared = self.inner.gate.read().await;
        match self.inner.local.execute(sql, params).await {
            Ok(outcome) => outcome,
            Err(error) => {
                warn!(event_name = "store.query.failed", error = %error, "query failed");
                QueryOutcome::failed(format!("Query failed: {error}"))
            }
        }
    }

    async fn schema(&self) -> String {
        let _shared = self.inner.gate.read().await;
        match self.inner.local.table_definitions().await {
            Ok(schema) => schema,
            Err(error) => {
                warn!(event_name = "store.schema.failed", error = %error, "schema fetch failed");
                format!("Schema fetch failed: {error}")
            }
        }
    }
}

impl Drop for StoreFacade {
    fn drop(&mut self) {
        if let Some(running) =
            self.periodic.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner()).take()
        {
            running.handle.abort();
        }
    }
}
