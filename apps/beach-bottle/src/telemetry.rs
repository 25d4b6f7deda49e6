//! Subscriber setup shared by the CLI subcommands.
//!
//! Verbose levels apply to this workspace's own targets only; dependencies
//! (webrtc, reqwest, ...) stay at `info` unless `BOTTLE_TRACE_DEPS` is set.
//! `BOTTLE_LOG_FILTER` replaces the computed directives entirely.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use clap::ValueEnum;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::flag;

const FILTER_ENV: &str = "BOTTLE_LOG_FILTER";
const TRACE_DEPS_ENV: &str = "BOTTLE_TRACE_DEPS";
const STORAGE_TARGET: &str = "bottle_storage";

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogOptions {
    pub level: LogLevel,
    /// Append to this file instead of writing to stderr.
    pub file: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum InitError {
    #[error("cannot open log file {path:?}: {source}")]
    LogFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid BOTTLE_LOG_FILTER directives '{directives}': {reason}")]
    Filter { directives: String, reason: String },
    #[error("a global subscriber is already installed: {0}")]
    Install(String),
}

static WRITER: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the process-wide subscriber once; later calls return `Ok`.
pub fn init(options: &LogOptions) -> Result<(), InitError> {
    if WRITER.get().is_some() {
        return Ok(());
    }
    let filter = match std::env::var(FILTER_ENV) {
        Ok(custom) => EnvFilter::try_new(&custom).map_err(|err| InitError::Filter {
            reason: err.to_string(),
            directives: custom,
        })?,
        Err(_) => EnvFilter::new(directives(options.level, flag(TRACE_DEPS_ENV))),
    };
    let (writer, guard) = match &options.file {
        Some(path) => tracing_appender::non_blocking(open_log_file(path)?),
        None => tracing_appender::non_blocking(std::io::stderr()),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(options.level >= LogLevel::Debug)
        .with_ansi(options.file.is_none())
        .with_writer(writer)
        .try_init()
        .map_err(|err| InitError::Install(err.to_string()))?;
    let _ = WRITER.set(guard);
    Ok(())
}

fn open_log_file(path: &Path) -> Result<File, InitError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| InitError::LogFile {
            path: path.to_path_buf(),
            source,
        })
}

fn own_targets() -> [String; 2] {
    [
        env!("CARGO_PKG_NAME").replace('-', "_"),
        STORAGE_TARGET.to_string(),
    ]
}

/// `EnvFilter` directives for `level`.
fn directives(level: LogLevel, trace_deps: bool) -> String {
    let filter = LevelFilter::from(level);
    if level < LogLevel::Debug || trace_deps {
        return filter.to_string().to_lowercase();
    }
    let mut directives = String::from("info");
    for target in own_targets() {
        directives.push_str(&format!(",{target}={}", filter.to_string().to_lowercase()));
    }
    directives
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_levels_apply_globally() {
        assert_eq!(directives(LogLevel::Warn, false), "warn");
        assert_eq!(directives(LogLevel::Info, true), "info");
    }

    #[test]
    fn verbose_levels_scope_to_workspace_targets() {
        assert_eq!(
            directives(LogLevel::Debug, false),
            "info,beach_bottle=debug,bottle_storage=debug"
        );
        assert_eq!(directives(LogLevel::Trace, true), "trace");
    }
}
