//! Logging setup for exitpact using tracing.
//!
//! Negotiation traffic goes to a daily rolling file; the console gets the
//! same events without source locations.

use anyhow::Result;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Overrides the per-user log directory.
pub const LOG_DIR_ENV: &str = "EXITPACT_LOG_DIR";

/// Agents and the round machinery at debug, everything else quieter.
pub const DEFAULT_FILTER: &str = "warn,exitpact=info,exitpact::agent=debug,exitpact::core=debug";

const LOG_FILE_PREFIX: &str = "negotiation.log";

/// Install the file and console subscribers.
///
/// The returned guard flushes the file writer on drop; keep it alive for as
/// long as the process logs.
pub fn init() -> Result<(WorkerGuard, PathBuf)> {
    let log_dir = log_dir(std::env::var_os(LOG_DIR_ENV).map(PathBuf::from))?;
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_file(true)
        .with_line_number(true);

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact();

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()?;

    tracing::debug!("Negotiation log: {}", log_dir.join(LOG_FILE_PREFIX).display());

    Ok((guard, log_dir))
}

/// Where log files go: the override if given, else the per-user data dir.
pub fn log_dir(override_dir: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(dir) = override_dir.filter(|d| !d.as_os_str().is_empty()) {
        return Ok(dir);
    }

    let dirs = directories::ProjectDirs::from("com", "exitpact", "exitpact")
        .ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))?;

    Ok(dirs.data_dir().join("logs"))
}

/// Console-only logging for tests.
///
/// Safe to call from every test; only the first call installs the subscriber.
#[cfg(test)]
pub fn init_test() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_test_writer())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_dir_override_wins() {
        let dir = tempfile::tempdir().unwrap();
        let resolved = log_dir(Some(dir.path().to_path_buf())).unwrap();
        assert_eq!(resolved, dir.path());
    }

    #[test]
    fn test_empty_override_falls_back() {
        // Needs a home directory to resolve the fallback.
        if let Ok(resolved) = log_dir(Some(PathBuf::new())) {
            assert!(resolved.ends_with("logs"));
        }
    }

    #[test]
    fn test_default_filter_parses() {
        assert!(EnvFilter::try_new(DEFAULT_FILTER).is_ok());
    }
}
