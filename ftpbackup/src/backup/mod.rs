pub mod backoff;
pub mod history;
pub mod paths;
pub mod policy;
pub mod runner;
#[cfg(test)]
mod testing;
pub mod transfer;
pub mod walker;

pub use history::{BackupKind, HistoryError, RunCounters, RunHistory, RunRecord, RunStatus};
pub use policy::{BackupMode, DecisionPolicy};
pub use runner::{BackupError, BackupRunner, RunReport, RunnerConfig};
