//! Logging setup over `tracing` / `tracing-subscriber`.
//!
//! Configuration-driven: level, format and an optional log file. `RUST_LOG`
//! always wins over the configured level, so operators can crank one module
//! up without touching config.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Full,
    Pretty,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    /// When set, log lines also go to this file (never rotated away
    /// mid-run; rotation is the operator's business).
    pub file_path: Option<PathBuf>,
}

/// Initializes the global subscriber from config. Safe to call more than
/// once; later calls are no-ops.
pub fn init_from_config(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));

    macro_rules! init_with_writer {
        ($writer:expr) => {
            match config.format {
                LogFormat::Compact => tracing_subscriber::registry()
                    .with(fmt::layer().compact().with_writer($writer))
                    .with(filter)
                    .try_init(),
                LogFormat::Full => tracing_subscriber::registry()
                    .with(fmt::layer().with_writer($writer))
                    .with(filter)
                    .try_init(),
                LogFormat::Pretty => tracing_subscriber::registry()
                    .with(fmt::layer().pretty().with_writer($writer))
                    .with(filter)
                    .try_init(),
            }
        };
    }

    let result = match &config.file_path {
        Some(path) => {
            let directory = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let file_name = path
                .file_name()
                .unwrap_or_else(|| std::ffi::OsStr::new("pansou.log"));
            let appender = tracing_appender::rolling::never(directory, file_name);
            init_with_writer!(appender)
        }
        None => init_with_writer!(std::io::stdout),
    };
    let _ = result;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_deserializes_lowercase() {
        let config: LoggingConfig =
            serde_json::from_str(r#"{"level":"debug","format":"pretty"}"#).unwrap();
        assert_eq!(config.level, LogLevel::Debug);
        assert_eq!(config.format, LogFormat::Pretty);
        assert!(config.file_path.is_none());
    }

    #[test]
    fn init_is_idempotent() {
        let config = LoggingConfig::default();
        init_from_config(&config);
        init_from_config(&config);
    }
}
