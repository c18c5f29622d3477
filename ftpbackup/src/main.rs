use std::path::Path;

use anyhow::Context;
use ftpbackup::backup::{
    BackupKind, BackupMode, BackupRunner, RunHistory, RunRecord, RunReport, RunStatus,
};
use ftpbackup::config::BackupConfig;
use ftpbackup::logging::init_tracing;
use ftpbackup_core::FtpConnector;
use time::macros::format_description;
use tracing::debug;

const HISTORY_LIMIT: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliCommand {
    Run(BackupMode),
    History,
    Help,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CliOptions {
    command: CliCommand,
    json: bool,
}

fn parse_cli<I>(args: I) -> anyhow::Result<CliOptions>
where
    I: IntoIterator<Item = String>,
{
    let mut options = CliOptions {
        command: CliCommand::Run(BackupMode::Auto),
        json: false,
    };
    let mut args = args.into_iter().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--full" => options.command = CliCommand::Run(BackupMode::ForceFull),
            "--incremental" => options.command = CliCommand::Run(BackupMode::ForceIncremental),
            "--auto" => options.command = CliCommand::Run(BackupMode::Auto),
            "--type" => {
                let value = args.next().context("--type requires a value")?;
                options.command = CliCommand::Run(value.parse()?);
            }
            "--history" => options.command = CliCommand::History,
            "--json" => options.json = true,
            "--help" | "-h" => options.command = CliCommand::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(options)
}

fn print_usage() {
    println!("Usage: ftpbackup [--full | --incremental | --auto | --type <mode>] [--json]");
    println!("       ftpbackup --history [--json]");
    println!("  --full          Copy every remote file");
    println!("  --incremental   Copy files changed since the last successful run");
    println!("  --auto          Full when the last full run is a week old, else incremental (default)");
    println!("  --history       List recorded runs for the configured remote directory");
    println!("  --json          Print machine-readable output");
    println!();
    println!("Connection settings come from FTPBACKUP_* environment variables or .env");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let options = parse_cli(std::env::args())?;
    if options.command == CliCommand::Help {
        print_usage();
        return Ok(());
    }

    init_tracing();
    let config = BackupConfig::from_env()?;
    debug!(?config, "loaded configuration");
    let history = RunHistory::open(&config.db_path)
        .await
        .with_context(|| format!("failed to open history database {}", config.db_path.display()))?;

    match options.command {
        CliCommand::History => {
            let runs = history.list_runs(&config.remote_dir, HISTORY_LIMIT).await;
            history.close().await;
            let runs = runs.context("failed to read backup history")?;
            if options.json {
                println!("{}", serde_json::to_string_pretty(&runs)?);
            } else {
                print!("{}", render_history(&config.remote_dir, &runs));
            }
            Ok(())
        }
        CliCommand::Run(mode) => {
            let runner = BackupRunner::new(
                FtpConnector::new(config.ftp_config()),
                history,
                config.runner_config(),
            );
            let outcome = runner.run(mode).await;
            runner.history().close().await;
            let report = outcome.context("backup failed")?;
            if options.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", render_summary(&report, &config.db_path));
            }
            if !report.succeeded() {
                anyhow::bail!(
                    "backup failed: {}",
                    report.failure.as_deref().unwrap_or("unknown error")
                );
            }
            Ok(())
        }
        CliCommand::Help => Ok(()),
    }
}

fn kind_label(kind: BackupKind) -> &'static str {
    match kind {
        BackupKind::Full => "Full",
        BackupKind::Incremental => "Incremental",
    }
}

fn megabytes(bytes: u64) -> f64 {
    bytes as f64 / 1024.0 / 1024.0
}

fn render_summary(report: &RunReport, db_path: &Path) -> String {
    let rule = "=".repeat(50);
    let headline = match report.status {
        RunStatus::Success => "Backup Complete!",
        _ => "Backup Failed!",
    };
    let mut out = String::new();
    out.push_str(&format!("{rule}\n{headline}\n"));
    if report.downgraded {
        out.push_str("No previous successful backup found; performed a full backup instead.\n");
    }
    out.push_str(&format!("Type: {}\n", kind_label(report.kind)));
    out.push_str(&format!("Directories: {}\n", report.counters.directories));
    out.push_str(&format!("Files: {}\n", report.counters.files));
    if report.failed_files > 0 {
        out.push_str(&format!("Failed files: {}\n", report.failed_files));
    }
    out.push_str(&format!(
        "Total size: {:.2} MB\n",
        megabytes(report.counters.bytes)
    ));
    out.push_str(&format!("Duration: {:.1} seconds\n", report.duration_secs));
    out.push_str(&format!(
        "Backup location: {}\n",
        report.local_root.display()
    ));
    out.push_str(&format!("{rule}\n"));
    out.push_str(&format!("Backup details stored in {}\n", db_path.display()));
    out
}

fn render_history(remote_root: &str, runs: &[RunRecord]) -> String {
    if runs.is_empty() {
        return format!("No backups recorded for {remote_root}\n");
    }
    let stamp = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    let mut out = format!("Backups of {remote_root} (newest first)\n");
    for run in runs {
        let started = run
            .started_at
            .format(stamp)
            .unwrap_or_else(|_| run.started_at.unix_timestamp().to_string());
        out.push_str(&format!(
            "#{:<4} {:<11} {:<7} {}  dirs {:>5}  files {:>6}  {:>9.2} MB  {}\n",
            run.id,
            kind_label(run.kind),
            run.status.as_str(),
            started,
            run.counters.directories,
            run.counters.files,
            megabytes(run.counters.bytes),
            run.local_root,
        ));
    }
    out
}
