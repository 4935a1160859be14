use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tokio::process::Command;

const MAX_DETAIL_CHARS: usize = 600;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("remote mirror is not configured: {0}")]
    NotConfigured(String),
    #[error("local store file `{0}` does not exist")]
    MissingLocal(PathBuf),
    #[error("failed to launch `{program}`: {source}")]
    Spawn { program: String, source: std::io::Error },
    #[error("copy command exited with {status}: {detail}")]
    CopyFailed { status: String, detail: String },
    #[error("filesystem error on `{path}`: {source}")]
    Io { path: PathBuf, source: std::io::Error },
}

/// Copies a file between a local path and a remote location.
#[async_trait]
pub trait CopyCommand: Send + Sync {
    async fn copy(&self, source: &str, destination: &str) -> Result<(), SyncError>;
}

/// Runs `azcopy copy <src> <dst> --overwrite=true`.
#[derive(Clone, Debug)]
pub struct AzCopy {
    program: String,
}

impl AzCopy {
    pub fn new(program: impl Into<String>) -> Self {
        Self { program: program.into() }
    }
}

impl Default for AzCopy {
    fn default() -> Self {
        Self::new("azcopy")
    }
}

#[async_trait]
impl CopyCommand for AzCopy {
    async fn copy(&self, source: &str, destination: &str) -> Result<(), SyncError> {
        let output = Command::new(&self.program)
            .arg("copy")
            .arg(source)
            .arg(destination)
            .arg("--overwrite=true")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| SyncError::Spawn { program: self.program.clone(), source })?;

        if output.status.success() {
            return Ok(());
        }

        let mut detail = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if detail.is_empty() {
            detail = String::from_utf8_lossy(&output.stdout).trim().to_string();
        }
        let status = match output.status.code() {
            Some(code) => format!("status {code}"),
            None => "a signal".to_string(),
        };

        Err(SyncError::CopyFailed { status, detail: truncate(&detail, MAX_DETAIL_CHARS) })
    }
}

/// Where the mirrored copy lives. The SAS token is only ever joined onto the
/// URL at the moment the copy command is invoked.
#[derive(Clone, Debug)]
pub struct RemoteLocation {
    base_url: String,
    sas_token: Option<SecretString>,
}

impl RemoteLocation {
    pub fn new(base_url: impl Into<String>, sas_token: Option<SecretString>) -> Self {
        Self { base_url: base_url.into(), sas_token }
    }

    pub fn redacted(&self) -> String {
        match &self.sas_token {
            Some(_) => format!("{}?<redacted>", self.base_url),
            None => self.base_url.clone(),
        }
    }

    fn with_credentials(&self) -> String {
        match &self.sas_token {
            Some(token) => {
                format!("{}?{}", self.base_url, token.expose_secret().trim_start_matches('?'))
            }
            None => self.base_url.clone(),
        }
    }
}

#[derive(Clone)]
pub struct BlobMirror {
    local_path: PathBuf,
    remote: RemoteLocation,
    copier: Arc<dyn CopyCommand>,
}

impl BlobMirror {
    pub fn new(
        local_path: impl Into<PathBuf>,
        remote: RemoteLocation,
        copier: Arc<dyn CopyCommand>,
    ) -> Self {
        Self { local_path: local_path.into(), remote, copier }
    }

    pub fn remote(&self) -> &RemoteLocation {
        &self.remote
    }

    pub async fn push(&self) -> Result<(), SyncError> {
        let exists = tokio::fs::try_exists(&self.local_path)
            .await
            .map_err(|source| SyncError::Io { path: self.local_path.clone(), source })?;
        if !exists {
            return Err(SyncError::MissingLocal(self.local_path.clone()));
        }

        self.copier
            .copy(&self.local_path.to_string_lossy(), &self.remote.with_credentials())
            .await
    }

    /// Downloads into a sibling temp file, then renames it over the store so
    /// a failed download never leaves a truncated database behind.
    pub async fn pull(&self) -> Result<(), SyncError> {
        if let Some(parent) = self.local_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| SyncError::Io { path: parent.to_path_buf(), source })?;
        }

        let staging = staging_path(&self.local_path);
        let _ = tokio::fs::remove_file(&staging).await;

        if let Err(error) =
            self.copier.copy(&self.remote.with_credentials(), &staging.to_string_lossy()).await
        {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(error);
        }

        tokio::fs::rename(&staging, &self.local_path)
            .await
            .map_err(|source| SyncError::Io { path: self.local_path.clone(), source })
    }
}

impl std::fmt::Debug for BlobMirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobMirror")
            .field("local_path", &self.local_path)
            .field("remote", &self.remote.redacted())
            .finish()
    }
}

fn staging_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "store.db".to_string());
    path.with_file_name(format!(".{name}.download"))
}

fn truncate(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    let mut cut: String = value.chars().take(max_chars).collect();
    cut.push_str("...");
    cut
}
