use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use filetime::FileTime;
use ftpbackup_core::{RemoteSession, SessionError};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::backoff::Backoff;

pub const DEFAULT_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("session error: {0}")]
    Session(#[from] SessionError),
    #[error("download of {path} failed after {attempts} attempt(s): {source}")]
    Exhausted {
        path: String,
        attempts: u32,
        source: Box<TransferError>,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct TransferConfig {
    pub attempts: u32,
    pub backoff: Backoff,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            backoff: Backoff::fixed(DEFAULT_RETRY_DELAY),
        }
    }
}

/// Downloads single files with bounded retries.
#[derive(Debug, Clone, Default)]
pub struct TransferExecutor {
    config: TransferConfig,
}

impl TransferExecutor {
    pub fn new(config: TransferConfig) -> Self {
        Self { config }
    }

    /// Mirrors `remote_path` to `local_path` and returns the size the server
    /// reported before the transfer (0 when it reports none).
    ///
    /// Data lands in a `.partial` sibling first, so `local_path` only ever
    /// holds a complete file.
    pub async fn fetch<S: RemoteSession>(
        &self,
        session: &mut S,
        remote_path: &str,
        local_path: &Path,
    ) -> Result<u64, TransferError> {
        let size = match session.file_size(remote_path).await {
            Ok(size) => size,
            Err(err) => {
                debug!(path = remote_path, error = %err, "remote size unavailable");
                0
            }
        };

        let attempts = self.config.attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match download_once(session, remote_path, local_path).await {
                Ok(written) => {
                    debug!(path = remote_path, bytes = written, attempt, "downloaded file");
                    break;
                }
                Err(err) if attempt < attempts => {
                    let delay = self.config.backoff.delay(attempt - 1);
                    warn!(
                        path = remote_path,
                        attempt,
                        error = %err,
                        retry_in_ms = delay.as_millis() as u64,
                        "download failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    return Err(TransferError::Exhausted {
                        path: remote_path.to_string(),
                        attempts: attempt,
                        source: Box::new(err),
                    });
                }
            }
        }

        apply_remote_mtime(session, remote_path, local_path).await;
        Ok(size)
    }
}

async fn download_once<S: RemoteSession>(
    session: &mut S,
    remote_path: &str,
    target: &Path,
) -> Result<u64, TransferError> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let partial = partial_path(target);
    let result = write_partial(session, remote_path, &partial).await;
    match result {
        Ok(written) => {
            tokio::fs::rename(&partial, target).await?;
            Ok(written)
        }
        Err(err) => {
            let _ = tokio::fs::remove_file(&partial).await;
            Err(err)
        }
    }
}

async fn write_partial<S: RemoteSession>(
    session: &mut S,
    remote_path: &str,
    partial: &Path,
) -> Result<u64, TransferError> {
    let mut file = tokio::fs::File::create(partial).await?;
    let written = session.retrieve(remote_path, &mut file).await?;
    file.flush().await?;
    file.sync_all().await?;
    Ok(written)
}

async fn apply_remote_mtime<S: RemoteSession>(session: &mut S, remote_path: &str, local_path: &Path) {
    let modified = match session.modified_time(remote_path).await {
        Ok(modified) => modified,
        Err(err) => {
            debug!(path = remote_path, error = %err, "remote modification time unavailable");
            return;
        }
    };
    let mtime = FileTime::from_unix_time(modified.unix_timestamp(), modified.nanosecond());
    if let Err(err) = filetime::set_file_mtime(local_path, mtime) {
        warn!(path = %local_path.display(), error = %err, "failed to set local modification time");
    }
}

fn partial_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    target.with_file_name(name)
}
