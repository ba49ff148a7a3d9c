use std::fs;

use anyhow::{anyhow, Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Keeps the file writer alive; dropping it flushes pending log lines.
pub struct ObservabilityGuard {
    _file_guard: Option<WorkerGuard>,
}

impl ObservabilityGuard {
    /// Installs the global subscriber: human-readable lines on stderr and,
    /// when `logging.logFile` is set, JSON lines appended to that file.
    /// `RUST_LOG` overrides the configured level.
    pub fn init(logging: &LoggingConfig) -> Result<Self> {
        let level = if logging.level.trim().is_empty() {
            "info"
        } else {
            logging.level.trim()
        };
        let env_filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(level))
            .with_context(|| format!("invalid log level '{}'", level))?;

        let stderr_layer = tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr);

        let (file_layer, file_guard) = match logging.log_file.as_deref() {
            Some(path) => {
                let dir = path
                    .parent()
                    .filter(|dir| !dir.as_os_str().is_empty())
                    .unwrap_or_else(|| std::path::Path::new("."));
                let file_name = path
                    .file_name()
                    .ok_or_else(|| anyhow!("logging.logFile {} has no file name", path.display()))?;
                fs::create_dir_all(dir)
                    .with_context(|| format!("failed creating log dir {}", dir.display()))?;
                let appender = tracing_appender::rolling::never(dir, file_name);
                let (writer, guard) = tracing_appender::non_blocking(appender);
                let layer = tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(false)
                    .with_writer(writer);
                (Some(layer), Some(guard))
            }
            None => (None, None),
        };

        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .with(file_layer)
            .try_init()
            .map_err(|err| anyhow!("failed installing tracing subscriber: {}", err))?;

        Ok(Self {
            _file_guard: file_guard,
        })
    }
}
