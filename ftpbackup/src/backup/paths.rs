use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use time::OffsetDateTime;
use time::macros::format_description;

use super::history::BackupKind;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("relative path is empty")]
    Empty,
    #[error("path contains unsupported component: {0}")]
    UnsupportedComponent(String),
}

/// Normalizes a remote path to an absolute, slash-separated form without a trailing slash.
pub fn normalize_remote_path(path: &str) -> String {
    let cleaned = path.replace('\\', "/");
    let trimmed = cleaned.trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{trimmed}")
    }
}

pub fn join_remote(dir: &str, name: &str) -> String {
    normalize_remote_path(&format!("{dir}/{name}"))
}

/// Maps a path relative to the walk root ("img/a.jpg") under `local_root`.
pub fn local_path_for(local_root: &Path, relative: &str) -> Result<PathBuf, PathError> {
    if relative.is_empty() {
        return Err(PathError::Empty);
    }

    let mut out = local_root.to_path_buf();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => continue,
            Component::RootDir | Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent(relative.to_string()));
            }
        }
    }
    Ok(out)
}

/// Snapshot directory name, e.g. `backup_20250629_181837_FULL`.
pub fn snapshot_dir_name(prefix: &str, started_at: OffsetDateTime, kind: BackupKind) -> String {
    let stamp = started_at
        .format(format_description!(
            "[year][month][day]_[hour][minute][second]"
        ))
        .unwrap_or_else(|_| started_at.unix_timestamp().to_string());
    let marker = match kind {
        BackupKind::Full => "FULL",
        BackupKind::Incremental => "INC",
    };
    format!("{prefix}_{stamp}_{marker}")
}
