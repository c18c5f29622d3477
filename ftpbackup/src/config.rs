use std::{
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use ftpbackup_core::{DEFAULT_PORT, FtpConfig};

use crate::backup::backoff::Backoff;
use crate::backup::history::default_db_path;
use crate::backup::paths::normalize_remote_path;
use crate::backup::policy::DecisionPolicy;
use crate::backup::runner::RunnerConfig;
use crate::backup::transfer::{DEFAULT_ATTEMPTS, DEFAULT_RETRY_DELAY, TransferConfig};

const DEFAULT_REMOTE_DIR: &str = "/";
const DEFAULT_OUTPUT_DIR: &str = ".";
const DEFAULT_PREFIX: &str = "backup";
const DEFAULT_FULL_INTERVAL_DAYS: u64 = 7;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

#[derive(Clone)]
pub struct BackupConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub remote_dir: String,
    pub output_dir: PathBuf,
    pub prefix: String,
    pub db_path: PathBuf,
    pub attempts: u32,
    pub retry_delay: Duration,
    /// Cap for the doubling retry delay; equal to `retry_delay` keeps it fixed.
    pub retry_max_delay: Duration,
    pub retry_jitter: bool,
    pub full_interval: time::Duration,
    pub connect_timeout: Duration,
}

impl fmt::Debug for BackupConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("remote_dir", &self.remote_dir)
            .field("output_dir", &self.output_dir)
            .field("prefix", &self.prefix)
            .field("db_path", &self.db_path)
            .field("attempts", &self.attempts)
            .field("retry_delay", &self.retry_delay)
            .field("retry_max_delay", &self.retry_max_delay)
            .field("retry_jitter", &self.retry_jitter)
            .field("full_interval", &self.full_interval)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl BackupConfig {
    /// Reads `FTPBACKUP_*` variables; call `dotenvy::dotenv()` first to honour `.env`.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &str| {
            lookup(name)
                .filter(|value| !value.is_empty())
                .with_context(|| format!("{name} is not set"))
        };
        let home = dirs::home_dir();
        let expand = |value: String| match &home {
            Some(home) => expand_with_home(&value, home),
            None => PathBuf::from(value),
        };

        let host = required("FTPBACKUP_HOST")?;
        let username = required("FTPBACKUP_USER")?;
        let password = required("FTPBACKUP_PASSWORD")?;
        let port = match lookup("FTPBACKUP_PORT") {
            Some(value) => value
                .trim()
                .parse::<u16>()
                .with_context(|| format!("invalid FTPBACKUP_PORT: {value}"))?,
            None => DEFAULT_PORT,
        };
        let remote_dir = normalize_remote_path(
            &lookup("FTPBACKUP_REMOTE_DIR").unwrap_or_else(|| DEFAULT_REMOTE_DIR.to_string()),
        );
        let output_dir = lookup("FTPBACKUP_OUTPUT")
            .map(expand)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR));
        let prefix = lookup("FTPBACKUP_PREFIX")
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_PREFIX.to_string());
        let db_path = match lookup("FTPBACKUP_DB_PATH") {
            Some(value) => expand(value),
            None => default_db_path().context("cannot locate the history database")?,
        };
        let attempts = read_positive(&lookup, "FTPBACKUP_ATTEMPTS", u64::from(DEFAULT_ATTEMPTS));
        let retry_delay = Duration::from_millis(read_u64(
            &lookup,
            "FTPBACKUP_RETRY_DELAY_MS",
            DEFAULT_RETRY_DELAY.as_millis() as u64,
        ));
        let retry_max_delay = Duration::from_millis(read_u64(
            &lookup,
            "FTPBACKUP_RETRY_MAX_DELAY_MS",
            retry_delay.as_millis() as u64,
        ));
        let retry_jitter = match lookup("FTPBACKUP_RETRY_JITTER") {
            Some(value) => parse_flag(&value)
                .with_context(|| format!("invalid FTPBACKUP_RETRY_JITTER: {value}"))?,
            None => false,
        };
        let full_interval_days = read_positive(
            &lookup,
            "FTPBACKUP_FULL_INTERVAL_DAYS",
            DEFAULT_FULL_INTERVAL_DAYS,
        );
        let connect_timeout = Duration::from_secs(read_positive(
            &lookup,
            "FTPBACKUP_CONNECT_TIMEOUT_SECS",
            DEFAULT_CONNECT_TIMEOUT_SECS,
        ));

        Ok(Self {
            host,
            port,
            username,
            password,
            remote_dir,
            output_dir,
            prefix,
            db_path,
            attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
            retry_delay,
            retry_max_delay,
            retry_jitter,
            full_interval: time::Duration::days(
                i64::try_from(full_interval_days).unwrap_or(i64::MAX / 86_400),
            ),
            connect_timeout,
        })
    }

    pub fn ftp_config(&self) -> FtpConfig {
        let mut config = FtpConfig::new(&self.host, &self.username, &self.password)
            .with_port(self.port);
        config.connect_timeout = self.connect_timeout;
        config
    }

    pub fn runner_config(&self) -> RunnerConfig {
        let mut config = RunnerConfig::new(&self.remote_dir, &self.output_dir);
        config.prefix = self.prefix.clone();
        config.policy = DecisionPolicy::new(self.full_interval);
        config.transfer = TransferConfig {
            attempts: self.attempts,
            backoff: Backoff::new(self.retry_delay, self.retry_max_delay, self.retry_jitter),
        };
        config
    }
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

/// Unparsable values fall back to `default`.
fn read_u64<F>(lookup: &F, name: &str, default: u64) -> u64
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

/// Like [`read_u64`], but zero also falls back to `default`.
fn read_positive<F>(lookup: &F, name: &str, default: u64) -> u64
where
    F: Fn(&str) -> Option<String>,
{
    match read_u64(lookup, name, default) {
        0 => default,
        value => value,
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}
