use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::Serialize;
use sqlx::{
    Row, SqlitePool,
    migrate::Migrator,
    sqlite::{SqliteConnectOptions, SqliteRow},
};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, warn};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const RUN_COLUMNS: &str = "id, kind, started_at, finished_at, remote_root, local_root, \
     files_count, directories_count, total_bytes, status";

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
    #[error("invalid backup kind: {0}")]
    InvalidKind(String),
    #[error("invalid run status: {0}")]
    InvalidStatus(String),
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    Full,
    Incremental,
}

impl BackupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupKind::Full => "full",
            BackupKind::Incremental => "incremental",
        }
    }

    fn parse(value: &str) -> Result<Self, HistoryError> {
        match value {
            "full" => Ok(BackupKind::Full),
            "incremental" => Ok(BackupKind::Incremental),
            other => Err(HistoryError::InvalidKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        }
    }

    fn parse(value: &str) -> Result<Self, HistoryError> {
        match value {
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "failed" => Ok(RunStatus::Failed),
            other => Err(HistoryError::InvalidStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunCounters {
    pub files: u64,
    pub directories: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunRecord {
    pub id: i64,
    pub kind: BackupKind,
    #[serde(with = "time::serde::timestamp")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::timestamp::option")]
    pub finished_at: Option<OffsetDateTime>,
    pub remote_root: String,
    pub local_root: String,
    pub counters: RunCounters,
    pub status: RunStatus,
}

/// The two history facts the decision policy needs for one remote root.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistorySnapshot {
    pub last_full_success: Option<OffsetDateTime>,
    pub last_success: Option<OffsetDateTime>,
}

pub struct RunHistory {
    pool: SqlitePool,
}

impl RunHistory {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn open(db_path: &Path) -> Result<Self, HistoryError> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let history = Self { pool };
        history.init().await?;
        Ok(history)
    }

    pub async fn init(&self) -> Result<(), HistoryError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn record_start(
        &self,
        kind: BackupKind,
        remote_root: &str,
        local_root: &Path,
        started_at: OffsetDateTime,
    ) -> Result<i64, HistoryError> {
        let result = sqlx::query(
            "INSERT INTO backup_runs (kind, started_at, remote_root, local_root, status)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(kind.as_str())
        .bind(started_at.unix_timestamp())
        .bind(remote_root)
        .bind(local_root.to_string_lossy().into_owned())
        .bind(RunStatus::Running.as_str())
        .execute(&self.pool)
        .await?;
        let id = result.last_insert_rowid();
        debug!(run_id = id, kind = kind.as_str(), remote_root, "recorded run start");
        Ok(id)
    }

    pub async fn record_finish(
        &self,
        run_id: i64,
        status: RunStatus,
        counters: RunCounters,
        finished_at: OffsetDateTime,
    ) -> Result<(), HistoryError> {
        let result = sqlx::query(
            "UPDATE backup_runs
             SET finished_at = ?1,
                 files_count = ?2,
                 directories_count = ?3,
                 total_bytes = ?4,
                 status = ?5
             WHERE id = ?6",
        )
        .bind(finished_at.unix_timestamp())
        .bind(to_db_count(counters.files))
        .bind(to_db_count(counters.directories))
        .bind(to_db_count(counters.bytes))
        .bind(status.as_str())
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!(run_id, "no backup run with this id; finish not recorded");
        }
        Ok(())
    }

    pub async fn last_successful_full_start(
        &self,
        remote_root: &str,
    ) -> Result<Option<OffsetDateTime>, HistoryError> {
        let row = sqlx::query(
            "SELECT MAX(started_at) FROM backup_runs
             WHERE kind = 'full' AND status = 'success' AND remote_root = ?1",
        )
        .bind(remote_root)
        .fetch_one(&self.pool)
        .await?;
        row.try_get::<Option<i64>, _>(0)?
            .map(from_unix)
            .transpose()
    }

    pub async fn last_successful_start(
        &self,
        remote_root: &str,
    ) -> Result<Option<OffsetDateTime>, HistoryError> {
        let row = sqlx::query(
            "SELECT MAX(started_at) FROM backup_runs
             WHERE status = 'success' AND remote_root = ?1",
        )
        .bind(remote_root)
        .fetch_one(&self.pool)
        .await?;
        row.try_get::<Option<i64>, _>(0)?
            .map(from_unix)
            .transpose()
    }

    pub async fn snapshot(&self, remote_root: &str) -> Result<HistorySnapshot, HistoryError> {
        Ok(HistorySnapshot {
            last_full_success: self.last_successful_full_start(remote_root).await?,
            last_success: self.last_successful_start(remote_root).await?,
        })
    }

    /// Local roots of successful runs since the latest successful full run, newest first.
    ///
    /// Together these snapshots hold the current mirror of `remote_root`.
    pub async fn mirror_roots(&self, remote_root: &str) -> Result<Vec<PathBuf>, HistoryError> {
        let rows = sqlx::query(
            "SELECT local_root FROM backup_runs
             WHERE remote_root = ?1
                AND status = 'success'
                AND started_at >= COALESCE(
                    (SELECT MAX(started_at) FROM backup_runs
                     WHERE remote_root = ?1 AND kind = 'full' AND status = 'success'),
                    0)
             ORDER BY started_at DESC, id DESC",
        )
        .bind(remote_root)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                row.try_get::<String, _>("local_root")
                    .map(PathBuf::from)
                    .map_err(HistoryError::from)
            })
            .collect()
    }

    pub async fn get_run(&self, run_id: i64) -> Result<Option<RunRecord>, HistoryError> {
        let row = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM backup_runs WHERE id = ?1"
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    pub async fn list_runs(
        &self,
        remote_root: &str,
        limit: u32,
    ) -> Result<Vec<RunRecord>, HistoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM backup_runs
             WHERE remote_root = ?1
             ORDER BY started_at DESC, id DESC
             LIMIT ?2"
        ))
        .bind(remote_root)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }
}

fn record_from_row(row: &SqliteRow) -> Result<RunRecord, HistoryError> {
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    let finished_at: Option<i64> = row.try_get("finished_at")?;
    Ok(RunRecord {
        id: row.try_get("id")?,
        kind: BackupKind::parse(&kind)?,
        started_at: from_unix(row.try_get("started_at")?)?,
        finished_at: finished_at.map(from_unix).transpose()?,
        remote_root: row.try_get("remote_root")?,
        local_root: row.try_get("local_root")?,
        counters: RunCounters {
            files: from_db_count(row.try_get("files_count")?),
            directories: from_db_count(row.try_get("directories_count")?),
            bytes: from_db_count(row.try_get("total_bytes")?),
        },
        status: RunStatus::parse(&status)?,
    })
}

fn from_unix(secs: i64) -> Result<OffsetDateTime, HistoryError> {
    OffsetDateTime::from_unix_timestamp(secs).map_err(|_| HistoryError::InvalidTimestamp(secs))
}

fn to_db_count(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_db_count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

pub fn default_db_path() -> Result<PathBuf, HistoryError> {
    let mut path = dirs::data_dir().ok_or(HistoryError::MissingDataDir)?;
    path.push("ftpbackup");
    path.push("history.db");
    Ok(path)
}

#[cfg(test)]
#[path = "history_tests.rs"]
mod tests;
