use ftpbackup_core::{RemoteSession, SessionError};
use thiserror::Error;
use tracing::{debug, warn};

use super::paths::join_remote;

#[derive(Debug, Error)]
pub enum WalkError {
    #[error("cannot enter {path}: {source}")]
    Enter { path: String, source: SessionError },
    #[error("cannot list {path}: {source}")]
    List { path: String, source: SessionError },
    #[error("cannot read current directory: {0}")]
    Position(SessionError),
    #[error("cannot classify {path}: {source}")]
    Probe { path: String, source: SessionError },
    #[error("cannot return to {path}: {source}")]
    Restore { path: String, source: SessionError },
}

impl WalkError {
    /// After a failed restore every later probe would run against the wrong directory.
    pub fn is_fatal(&self) -> bool {
        matches!(self, WalkError::Restore { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    /// Absolute remote path.
    pub path: String,
    /// Slash-separated path below the walk root, e.g. `img/a.jpg`.
    pub relative: String,
    pub kind: EntryKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkAction {
    Descend,
    Skip,
}

/// Receives every classified entry. The return value only matters for directories.
#[allow(async_fn_in_trait)]
pub trait Visitor<S: RemoteSession> {
    async fn visit(&mut self, session: &mut S, entry: &RemoteEntry) -> WalkAction;

    /// An entry below the root could not be classified, entered or listed.
    fn skipped(&mut self, _error: &WalkError) {}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkStats {
    /// Directories below the root.
    pub directories: u64,
    pub files: u64,
    /// Entries that could not be classified or descended into.
    pub skipped: u64,
}

/// A saved server-side position.
struct Cursor {
    path: String,
}

impl Cursor {
    async fn save<S: RemoteSession>(session: &mut S) -> Result<Self, WalkError> {
        let path = session
            .current_directory()
            .await
            .map_err(WalkError::Position)?;
        Ok(Self { path })
    }

    async fn restore<S: RemoteSession>(&self, session: &mut S) -> Result<(), WalkError> {
        session
            .change_directory(&self.path)
            .await
            .map_err(|source| WalkError::Restore {
                path: self.path.clone(),
                source,
            })
    }
}

/// Depth-first pre-order walk of `root`.
///
/// The cursor is put back after every entry and, once the walk ends, at the
/// position it had before the call, whatever the outcome.
pub async fn walk<S, V>(
    session: &mut S,
    root: &str,
    visitor: &mut V,
) -> Result<WalkStats, WalkError>
where
    S: RemoteSession,
    V: Visitor<S>,
{
    let origin = Cursor::save(session).await?;
    let mut stats = WalkStats::default();
    let walked = walk_directory(session, root, "", visitor, &mut stats).await;
    let restored = origin.restore(session).await;
    walked?;
    restored?;
    Ok(stats)
}

async fn walk_directory<S, V>(
    session: &mut S,
    dir: &str,
    relative: &str,
    visitor: &mut V,
    stats: &mut WalkStats,
) -> Result<(), WalkError>
where
    S: RemoteSession,
    V: Visitor<S>,
{
    session
        .change_directory(dir)
        .await
        .map_err(|source| WalkError::Enter {
            path: dir.to_string(),
            source,
        })?;
    let here = Cursor::save(session).await?;
    let names = session
        .list_names(&here.path)
        .await
        .map_err(|source| WalkError::List {
            path: here.path.clone(),
            source,
        })?;
    debug!(dir = %here.path, entries = names.len(), "listed remote directory");

    for name in names {
        if name.is_empty() || name == "." || name == ".." {
            continue;
        }
        let path = join_remote(&here.path, &name);
        let child_relative = if relative.is_empty() {
            name
        } else {
            format!("{relative}/{name}")
        };

        let outcome = visit_entry(session, path, child_relative, visitor, stats).await;
        here.restore(session).await?;
        if let Err(err) = outcome {
            if err.is_fatal() {
                return Err(err);
            }
            warn!(error = %err, "skipping remote entry");
            stats.skipped += 1;
            visitor.skipped(&err);
        }
    }
    Ok(())
}

async fn visit_entry<S, V>(
    session: &mut S,
    path: String,
    relative: String,
    visitor: &mut V,
    stats: &mut WalkStats,
) -> Result<(), WalkError>
where
    S: RemoteSession,
    V: Visitor<S>,
{
    let kind = match session.change_directory(&path).await {
        Ok(()) => EntryKind::Directory,
        Err(err) if err.is_rejected() => EntryKind::File,
        Err(source) => return Err(WalkError::Probe { path, source }),
    };
    let entry = RemoteEntry {
        path,
        relative,
        kind,
    };

    match entry.kind {
        EntryKind::File => {
            stats.files += 1;
            visitor.visit(session, &entry).await;
        }
        EntryKind::Directory => {
            stats.directories += 1;
            if visitor.visit(session, &entry).await == WalkAction::Descend {
                Box::pin(walk_directory(
                    session,
                    &entry.path,
                    &entry.relative,
                    visitor,
                    stats,
                ))
                .await?;
            }
        }
    }
    Ok(())
}
