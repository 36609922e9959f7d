//! Tracing setup: console filter selection plus an optional daily-rolling
//! file sink under the data directory.
//!
//! The console hides child-process chatter by default (`ffmpeg_stderr`
//! lines, ort provider noise); the log file keeps ffmpeg stderr at debug
//! so failed encodes can be diagnosed after the fact.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DEFAULT_NOISE_FILTER: &str = "ort=error,ffmpeg_stderr=error";
pub const DEFAULT_LOG_RETENTION_FILES: usize = 14;
pub const DEFAULT_LOG_DIR_NAME: &str = "logs";
pub const DEFAULT_LOG_FILE_PREFIX: &str = "enscale";
pub const DEFAULT_LOG_FILE_SUFFIX: &str = "log";

const FFMPEG_DEBUG_TARGETS: [&str; 1] = ["ffmpeg_stderr"];

#[derive(Debug, Clone, Default)]
pub struct LoggingOptions {
    /// `-v` / `-vv` from the CLI.
    pub verbose: u8,
    /// Explicit `--log-filter`; overrides everything else.
    pub cli_log_filter: Option<String>,
    /// `RUST_LOG` captured by the caller.
    pub rust_log_env: Option<String>,
    /// Where the `logs/` directory lives; `None` disables the file sink.
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterPlan {
    pub console_filter: String,
    pub file_filter: String,
}

/// Explicit CLI filter > verbosity flags > RUST_LOG > default.
fn select_user_filter(options: &LoggingOptions) -> String {
    if let Some(filter) = options.cli_log_filter.as_deref() {
        filter.to_string()
    } else if options.verbose >= 2 {
        "trace".to_string()
    } else if options.verbose == 1 {
        "debug".to_string()
    } else if let Some(filter) = options.rust_log_env.as_deref() {
        filter.to_string()
    } else {
        DEFAULT_LOG_FILTER.to_string()
    }
}

pub fn compose_filters(options: &LoggingOptions) -> FilterPlan {
    let user_filter = select_user_filter(options);
    // explicit choices get the raw filter; the implicit default gets the
    // noise suppression prepended
    let implicit = options.cli_log_filter.is_none() && options.verbose == 0;
    if !implicit {
        return FilterPlan {
            console_filter: user_filter.clone(),
            file_filter: user_filter,
        };
    }

    let file_noise: Vec<String> = DEFAULT_NOISE_FILTER
        .split(',')
        .map(|directive| match directive.split_once('=') {
            Some((target, _)) if FFMPEG_DEBUG_TARGETS.contains(&target) => {
                format!("{target}=debug")
            }
            _ => directive.to_string(),
        })
        .collect();

    FilterPlan {
        console_filter: format!("{DEFAULT_NOISE_FILTER},{user_filter}"),
        file_filter: format!("{},{user_filter}", file_noise.join(",")),
    }
}

/// Install the global subscriber. Returns an error only for a malformed
/// filter string; an unwritable log directory degrades to console-only.
pub fn init(options: &LoggingOptions) -> Result<()> {
    let filters = compose_filters(options);
    let console_filter = EnvFilter::try_new(&filters.console_filter)
        .with_context(|| format!("invalid log filter: {}", filters.console_filter))?;

    let file_layer = options.data_dir.as_deref().and_then(|data_dir| {
        let log_dir = data_dir.join(DEFAULT_LOG_DIR_NAME);
        if let Err(e) = fs::create_dir_all(&log_dir) {
            eprintln!("warning: log directory unavailable ({e}); logging to console only");
            return None;
        }
        let appender = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix(DEFAULT_LOG_FILE_PREFIX)
            .filename_suffix(DEFAULT_LOG_FILE_SUFFIX)
            .max_log_files(DEFAULT_LOG_RETENTION_FILES)
            .build(&log_dir)
            .ok()?;
        let file_filter = EnvFilter::try_new(&filters.file_filter).ok()?;
        Some(
            fmt::layer()
                .with_ansi(false)
                .with_writer(appender)
                .with_filter(file_filter),
        )
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_filter(console_filter))
        .with(file_layer)
        .try_init()
        .context("failed to install tracing subscriber")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_filter_overrides_everything() {
        let options = LoggingOptions {
            verbose: 2,
            cli_log_filter: Some("enscale_core=trace".into()),
            rust_log_env: Some("error".into()),
            data_dir: None,
        };
        let plan = compose_filters(&options);
        assert_eq!(plan.console_filter, "enscale_core=trace");
        assert_eq!(plan.file_filter, "enscale_core=trace");
    }

    #[test]
    fn test_verbose_levels() {
        let debug = compose_filters(&LoggingOptions {
            verbose: 1,
            ..Default::default()
        });
        assert_eq!(debug.console_filter, "debug");
        let trace = compose_filters(&LoggingOptions {
            verbose: 2,
            ..Default::default()
        });
        assert_eq!(trace.console_filter, "trace");
    }

    #[test]
    fn test_implicit_default_includes_noise_suppression() {
        let plan = compose_filters(&LoggingOptions::default());
        assert_eq!(
            plan.console_filter,
            format!("{DEFAULT_NOISE_FILTER},{DEFAULT_LOG_FILTER}")
        );
        assert_eq!(plan.file_filter, "ort=error,ffmpeg_stderr=debug,info");
    }

    #[test]
    fn test_rust_log_env_used_when_implicit() {
        let plan = compose_filters(&LoggingOptions {
            rust_log_env: Some("warn".into()),
            ..Default::default()
        });
        assert!(plan.console_filter.ends_with(",warn"));
    }
}
