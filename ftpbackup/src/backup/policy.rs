use std::str::FromStr;

use thiserror::Error;
use time::{Duration, OffsetDateTime};

use super::history::{BackupKind, HistorySnapshot};

pub const DEFAULT_FULL_INTERVAL: Duration = Duration::days(7);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackupMode {
    ForceFull,
    ForceIncremental,
    #[default]
    Auto,
}

#[derive(Debug, Error)]
#[error("unknown backup mode: {0} (expected full, incremental or auto)")]
pub struct ParseModeError(String);

impl FromStr for BackupMode {
    type Err = ParseModeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(BackupMode::ForceFull),
            "incremental" | "inc" => Ok(BackupMode::ForceIncremental),
            "auto" => Ok(BackupMode::Auto),
            other => Err(ParseModeError(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub kind: BackupKind,
    /// Files modified after this instant are copied; `None` for full runs.
    pub baseline: Option<OffsetDateTime>,
    /// An incremental run was requested but no baseline exists.
    pub downgraded: bool,
}

impl Decision {
    fn full() -> Self {
        Self {
            kind: BackupKind::Full,
            baseline: None,
            downgraded: false,
        }
    }

    fn incremental(baseline: OffsetDateTime) -> Self {
        Self {
            kind: BackupKind::Incremental,
            baseline: Some(baseline),
            downgraded: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecisionPolicy {
    full_interval: Duration,
}

impl Default for DecisionPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_FULL_INTERVAL)
    }
}

impl DecisionPolicy {
    pub fn new(full_interval: Duration) -> Self {
        Self { full_interval }
    }

    pub fn full_interval(&self) -> Duration {
        self.full_interval
    }

    pub fn decide(
        &self,
        history: &HistorySnapshot,
        mode: BackupMode,
        now: OffsetDateTime,
    ) -> Decision {
        match mode {
            BackupMode::ForceFull => Decision::full(),
            BackupMode::ForceIncremental => match history.last_success {
                Some(baseline) => Decision::incremental(baseline),
                None => Decision {
                    downgraded: true,
                    ..Decision::full()
                },
            },
            BackupMode::Auto => match (history.last_full_success, history.last_success) {
                (Some(last_full), Some(baseline)) if now - last_full < self.full_interval => {
                    Decision::incremental(baseline)
                }
                _ => Decision::full(),
            },
        }
    }
}
