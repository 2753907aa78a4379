//! Structured logging for the networking crates.
//!
//! Console output carries uptime timestamps and module paths. When the config
//! names a log directory, a JSON copy of every event is written there as well.
//! `RUST_LOG` takes precedence over the configured level.

use std::path::Path;

use nebula_config::DebugConfig;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when neither `RUST_LOG` nor the config names one.
pub const DEFAULT_FILTER: &str = "info";

/// Name of the JSON log file created inside the log directory.
pub const LOG_FILE_NAME: &str = "nebula-net.log";

/// Initialize the global tracing subscriber.
///
/// Returns `false` if a subscriber was already installed, which happens when
/// several tests in one process call this.
///
/// # Examples
///
/// ```no_run
/// use nebula_config::Config;
/// use nebula_log::init_logging;
///
/// let config = Config::default();
/// init_logging(&config.debug);
/// ```
pub fn init_logging(config: &DebugConfig) -> bool {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| filter_for(&config.log_level));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(true) // stdin and rcs threads are named
        .with_level(true)
        .with_timer(fmt::time::uptime());

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer);

    if let Some(log_dir) = config.log_dir.as_deref()
        && let Some(log_file) = open_log_file(log_dir)
    {
        let file_layer = fmt::layer()
            .with_writer(log_file)
            .with_ansi(false)
            .with_target(true)
            .with_timer(fmt::time::uptime())
            .json();
        return subscriber.with(file_layer).try_init().is_ok();
    }

    subscriber.try_init().is_ok()
}

/// Build the filter for a configured level string.
///
/// An empty string falls back to [`DEFAULT_FILTER`]. Anything `EnvFilter`
/// cannot parse falls back too, with a note on stderr since logging is not up
/// yet.
pub fn filter_for(level: &str) -> EnvFilter {
    if level.trim().is_empty() {
        return EnvFilter::new(DEFAULT_FILTER);
    }
    EnvFilter::try_new(level).unwrap_or_else(|err| {
        eprintln!("ignoring log level {level:?}: {err}");
        EnvFilter::new(DEFAULT_FILTER)
    })
}

fn open_log_file(log_dir: &Path) -> Option<std::fs::File> {
    std::fs::create_dir_all(log_dir).ok()?;
    std::fs::File::create(log_dir.join(LOG_FILE_NAME)).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_level_uses_default() {
        assert_eq!(filter_for("").to_string(), DEFAULT_FILTER);
        assert_eq!(filter_for("   ").to_string(), DEFAULT_FILTER);
    }

    #[test]
    fn test_subsystem_filter() {
        let filter = filter_for("warn,nebula_net=debug");
        let filter_str = filter.to_string();
        assert!(filter_str.contains("nebula_net=debug"));
        assert!(filter_str.contains("warn"));
    }

    #[test]
    fn test_bad_level_falls_back() {
        assert_eq!(filter_for("nebula_net=verbose").to_string(), DEFAULT_FILTER);
    }

    #[test]
    fn test_env_filter_parsing() {
        for filter_str in ["info", "debug,nebula_net=trace", "warn,nebula_multiplayer=debug", "error"] {
            assert!(EnvFilter::try_new(filter_str).is_ok(), "failed to parse {filter_str}");
        }
    }

    #[test]
    fn test_log_file_created_in_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        let nested = temp_dir.path().join("logs");
        assert!(open_log_file(&nested).is_some());
        assert!(nested.join(LOG_FILE_NAME).exists());
    }

    #[test]
    fn test_second_init_reports_existing_subscriber() {
        let config = DebugConfig::default();
        init_logging(&config);
        assert!(!init_logging(&config));
    }
}
