//! Subscriber setup for binaries and tests
//!
//! The library itself only emits `tracing` events. A binary calls [`init`]
//! once; events then go to daily files under `$XDG_STATE_HOME/tlog/`
//! (`tlog.YYYY-MM-DD.log`) and, with `logging.stderr`, to stderr as well.

use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{Config, LoggingConfig};
use crate::error::{Error, Result};

pub const LOG_FILE_PREFIX: &str = "tlog";
pub const LOG_FILE_SUFFIX: &str = "log";

/// Install the global subscriber
///
/// Fails if the log directory cannot be created, the level does not parse,
/// or a subscriber is already installed.
pub fn init(config: &LoggingConfig) -> Result<LoggingGuard> {
    let log_dir = Config::state_dir();
    std::fs::create_dir_all(&log_dir)?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix(LOG_FILE_SUFFIX)
        .max_log_files(config.max_files)
        .build(&log_dir)
        .map_err(|e| Error::Config(format!("failed to create log appender: {}", e)))?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let file_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_names(true);

    let stderr_layer = config.stderr.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .compact()
    });

    tracing_subscriber::registry()
        .with(filter(&config.level)?)
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .map_err(|e| Error::Config(format!("logging already initialized: {}", e)))?;

    tracing::debug!(
        log_dir = %log_dir.display(),
        level = %config.level,
        stderr = config.stderr,
        "Logging initialized"
    );

    Ok(LoggingGuard { _guard: guard })
}

/// Test subscriber: silent unless `RUST_LOG` is set, output captured per test
pub fn init_test() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("off"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Flushes buffered file output when dropped
pub struct LoggingGuard {
    _guard: tracing_appender::non_blocking::WorkerGuard,
}

/// `RUST_LOG` wins; otherwise `level` applies to the tlog crates while
/// dependencies stay at `warn`.
fn filter(level: &str) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(directives(level))
        .map_err(|e| Error::Config(format!("invalid logging.level {:?}: {}", level, e)))
}

fn directives(level: &str) -> String {
    format!("warn,tlog_core={level},tlog={level}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_scopes_tlog_crates_only() {
        assert_eq!(directives("debug"), "warn,tlog_core=debug,tlog=debug");
    }

    #[test]
    fn test_init_test_is_reentrant() {
        init_test();
        init_test();
        tracing::info!("still fine");
    }
}
