use std::{
    io,
    path::{Path, PathBuf},
    time::Instant,
};

use ftpbackup_core::{Connector, RemoteSession, SessionError};
use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

use super::history::{BackupKind, HistoryError, RunCounters, RunHistory, RunStatus};
use super::paths::{local_path_for, normalize_remote_path, snapshot_dir_name};
use super::policy::{BackupMode, Decision, DecisionPolicy};
use super::transfer::{TransferConfig, TransferExecutor};
use super::walker::{EntryKind, RemoteEntry, Visitor, WalkAction, WalkError, walk};

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("connection failed: {0}")]
    Connection(#[source] SessionError),
    #[error("history error: {0}")]
    History(#[from] HistoryError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Connecting,
    Preparing,
    Walking,
    Finalizing,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunPhase::Connecting => "connecting",
            RunPhase::Preparing => "preparing",
            RunPhase::Walking => "walking",
            RunPhase::Finalizing => "finalizing",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub remote_root: String,
    pub output_dir: PathBuf,
    pub prefix: String,
    pub policy: DecisionPolicy,
    pub transfer: TransferConfig,
}

impl RunnerConfig {
    pub fn new(remote_root: &str, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            remote_root: normalize_remote_path(remote_root),
            output_dir: output_dir.into(),
            prefix: "backup".to_string(),
            policy: DecisionPolicy::default(),
            transfer: TransferConfig::default(),
        }
    }
}

/// Outcome of a run that reached the history store.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: i64,
    pub kind: BackupKind,
    pub status: RunStatus,
    /// An incremental run was requested but had no baseline.
    pub downgraded: bool,
    pub remote_root: String,
    pub local_root: PathBuf,
    pub counters: RunCounters,
    /// Files whose download failed after all retries.
    pub failed_files: u64,
    /// Entries the walker could not classify or enter.
    pub skipped_entries: u64,
    #[serde(with = "time::serde::timestamp")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::timestamp")]
    pub finished_at: OffsetDateTime,
    pub duration_secs: f64,
    pub failure: Option<String>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Success
    }
}

pub struct BackupRunner<C> {
    connector: C,
    history: RunHistory,
    config: RunnerConfig,
}

impl<C: Connector> BackupRunner<C> {
    pub fn new(connector: C, history: RunHistory, config: RunnerConfig) -> Self {
        Self {
            connector,
            history,
            config,
        }
    }

    pub fn history(&self) -> &RunHistory {
        &self.history
    }

    pub async fn run(&self, mode: BackupMode) -> Result<RunReport, BackupError> {
        self.run_at(mode, OffsetDateTime::now_utc()).await
    }

    /// Runs one backup as if it started at `now`.
    ///
    /// Returns `Err` only when no history record was written or finished;
    /// a run that failed after `record_start` comes back as a report with
    /// [`RunStatus::Failed`].
    pub async fn run_at(
        &self,
        mode: BackupMode,
        now: OffsetDateTime,
    ) -> Result<RunReport, BackupError> {
        let started_at = now.replace_nanosecond(0).unwrap_or(now);
        let clock = Instant::now();

        info!(
            phase = RunPhase::Connecting.as_str(),
            remote_root = %self.config.remote_root,
            "starting backup"
        );
        let mut session = self
            .connector
            .connect()
            .await
            .map_err(BackupError::Connection)?;

        let outcome = self
            .run_connected(&mut session, mode, started_at, clock)
            .await;

        if let Err(err) = session.close().await {
            warn!(error = %err, "failed to close remote session");
        }
        outcome
    }

    async fn run_connected(
        &self,
        session: &mut C::Session,
        mode: BackupMode,
        started_at: OffsetDateTime,
        clock: Instant,
    ) -> Result<RunReport, BackupError> {
        let root = self.config.remote_root.as_str();

        debug!(phase = RunPhase::Preparing.as_str(), "deciding backup kind");
        let snapshot = self.history.snapshot(root).await?;
        let decision = self.config.policy.decide(&snapshot, mode, started_at);
        if decision.downgraded {
            warn!("no successful run to compare against; performing a full backup instead");
        }
        let local_root = self.config.output_dir.join(snapshot_dir_name(
            &self.config.prefix,
            started_at,
            decision.kind,
        ));
        tokio::fs::create_dir_all(&local_root).await?;
        let mirrors = match decision.kind {
            BackupKind::Full => Vec::new(),
            BackupKind::Incremental => self.history.mirror_roots(root).await?,
        };
        let run_id = self
            .history
            .record_start(decision.kind, root, &local_root, started_at)
            .await?;
        info!(
            run_id,
            kind = decision.kind.as_str(),
            local_root = %local_root.display(),
            "backup directory created"
        );

        debug!(phase = RunPhase::Walking.as_str(), run_id, "walking remote tree");
        let executor = TransferExecutor::new(self.config.transfer);
        let mut context = BackupContext::new(&executor, &local_root, &mirrors, &decision);
        let walked = walk(session, root, &mut context).await;

        debug!(phase = RunPhase::Finalizing.as_str(), run_id, "finalizing run");
        let (status, failure) = match walked {
            Ok(stats) => {
                debug!(
                    run_id,
                    directories = stats.directories,
                    files = stats.files,
                    skipped = stats.skipped,
                    "walk complete"
                );
                (RunStatus::Success, None)
            }
            Err(err) => {
                error!(run_id, error = %err, "backup failed");
                (RunStatus::Failed, Some(err.to_string()))
            }
        };
        let BackupContext {
            counters,
            failed_files,
            skipped_entries,
            ..
        } = context;
        let elapsed = clock.elapsed();
        let finished_at = started_at + elapsed;
        self.history
            .record_finish(run_id, status, counters, finished_at)
            .await?;
        info!(
            run_id,
            status = status.as_str(),
            files = counters.files,
            directories = counters.directories,
            bytes = counters.bytes,
            "backup finished"
        );

        Ok(RunReport {
            run_id,
            kind: decision.kind,
            status,
            downgraded: decision.downgraded,
            remote_root: root.to_string(),
            local_root,
            counters,
            failed_files,
            skipped_entries,
            started_at,
            finished_at,
            duration_secs: elapsed.as_secs_f64(),
            failure,
        })
    }
}

/// Live state of one run, fed by the walker.
struct BackupContext<'a> {
    executor: &'a TransferExecutor,
    local_root: &'a Path,
    /// Earlier snapshots that hold the current mirror, newest first.
    mirrors: &'a [PathBuf],
    baseline: Option<OffsetDateTime>,
    counters: RunCounters,
    failed_files: u64,
    skipped_entries: u64,
}

impl<'a> BackupContext<'a> {
    fn new(
        executor: &'a TransferExecutor,
        local_root: &'a Path,
        mirrors: &'a [PathBuf],
        decision: &Decision,
    ) -> Self {
        Self {
            executor,
            local_root,
            mirrors,
            baseline: decision.baseline,
            counters: RunCounters::default(),
            failed_files: 0,
            skipped_entries: 0,
        }
    }

    async fn already_mirrored(&self, relative: &str) -> bool {
        let roots = std::iter::once(self.local_root).chain(self.mirrors.iter().map(PathBuf::as_path));
        for root in roots {
            let Ok(candidate) = local_path_for(root, relative) else {
                continue;
            };
            if tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
                return true;
            }
        }
        false
    }

    async fn should_fetch<S: RemoteSession>(&self, session: &mut S, entry: &RemoteEntry) -> bool {
        let Some(baseline) = self.baseline else {
            return true;
        };
        if !self.already_mirrored(&entry.relative).await {
            debug!(path = %entry.path, "new file since last backup");
            return true;
        }
        match session.modified_time(&entry.path).await {
            Ok(modified) if modified > baseline => {
                debug!(path = %entry.path, "file modified since last backup");
                true
            }
            Ok(_) => false,
            Err(err) => {
                debug!(path = %entry.path, error = %err, "modification time unavailable; keeping mirrored copy");
                false
            }
        }
    }
}

impl<S: RemoteSession> Visitor<S> for BackupContext<'_> {
    async fn visit(&mut self, session: &mut S, entry: &RemoteEntry) -> WalkAction {
        let local = match local_path_for(self.local_root, &entry.relative) {
            Ok(local) => local,
            Err(err) => {
                warn!(path = %entry.path, error = %err, "cannot map remote entry to a local path");
                return WalkAction::Skip;
            }
        };

        match entry.kind {
            EntryKind::Directory => {
                self.counters.directories += 1;
                if let Err(err) = tokio::fs::create_dir_all(&local).await {
                    warn!(path = %local.display(), error = %err, "failed to create local directory");
                }
                WalkAction::Descend
            }
            EntryKind::File => {
                if self.should_fetch(session, entry).await {
                    match self.executor.fetch(session, &entry.path, &local).await {
                        Ok(bytes) => {
                            self.counters.files += 1;
                            self.counters.bytes += bytes;
                        }
                        Err(err) => {
                            error!(path = %entry.path, error = %err, "failed to download file");
                            self.failed_files += 1;
                        }
                    }
                }
                WalkAction::Skip
            }
        }
    }

    fn skipped(&mut self, _error: &WalkError) {
        self.skipped_entries += 1;
    }
}

#[cfg(test)]
#[path = "runner_tests.rs"]
mod tests;
