use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    io::{self, Write},
    path::PathBuf,
    sync::{Arc, Once},
};
use tracing_subscriber::{
    filter::LevelFilter,
    fmt::{writer::{BoxMakeWriter, MakeWriterExt}, MakeWriter},
    prelude::*,
    EnvFilter,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// A simple level (`info`, `debug`, ...) or a full `EnvFilter` directive string.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    /// Emit one JSON object per event.
    #[serde(default)]
    pub json: bool,

    #[serde(default = "LoggingConfig::default_stderr")]
    pub stderr: bool,

    /// Append logs to this file as well. If it cannot be opened, file logging is skipped.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_owned()
    }

    fn default_stderr() -> bool {
        true
    }

    /// Lower-cases plain level names (accepting `warning`); directive strings pass through.
    pub(crate) fn normalize_level(input: &str) -> String {
        const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

        let trimmed = input.trim();
        let lower = trimmed.to_ascii_lowercase();
        if trimmed.is_empty() {
            Self::default_level()
        } else if lower == "warning" {
            "warn".to_owned()
        } else if LEVELS.contains(&lower.as_str()) {
            lower
        } else {
            trimmed.to_owned()
        }
    }

    /// The effective filter: the configured level with `RUST_LOG` directives layered on top.
    ///
    /// An unparsable combination falls back to `RUST_LOG` alone, then to the configured level,
    /// then to `info`.
    pub fn env_filter(&self) -> EnvFilter {
        let configured = Self::normalize_level(&self.level);
        let env = std::env::var("RUST_LOG")
            .ok()
            .filter(|value| !value.trim().is_empty());

        let mut candidates = Vec::with_capacity(3);
        if let Some(env) = &env {
            candidates.push(format!("{configured},{}", env.trim()));
            candidates.push(env.trim().to_owned());
        }
        candidates.push(configured);

        candidates
            .iter()
            .find_map(|directives| EnvFilter::try_new(directives).ok())
            .unwrap_or_else(|| EnvFilter::default().add_directive(LevelFilter::INFO.into()))
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            json: false,
            stderr: Self::default_stderr(),
            file: None,
        }
    }
}

struct SharedFile {
    file: Arc<Mutex<std::fs::File>>,
}

impl<'a> MakeWriter<'a> for SharedFile {
    type Writer = SharedFileWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        SharedFileWriter {
            guard: self.file.lock(),
        }
    }
}

struct SharedFileWriter<'a> {
    guard: parking_lot::MutexGuard<'a, std::fs::File>,
}

impl Write for SharedFileWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.guard.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.guard.flush()
    }
}

static TRACING_INIT: Once = Once::new();

/// Install the global `tracing` subscriber described by `config`.
///
/// Only the first call has an effect.
pub fn init_tracing(config: &LoggingConfig) {
    TRACING_INIT.call_once(|| {
        let filter = config.env_filter();

        let file = config.file.as_ref().and_then(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        });

        let mut writer = if config.stderr {
            BoxMakeWriter::new(std::io::stderr)
        } else {
            BoxMakeWriter::new(std::io::sink)
        };
        if let Some(file) = file {
            writer = BoxMakeWriter::new(writer.and(SharedFile {
                file: Arc::new(Mutex::new(file)),
            }));
        }

        let layer: Box<dyn tracing_subscriber::Layer<_> + Send + Sync> = if config.json {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_ansi(false)
                .boxed()
        } else {
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .boxed()
        };

        let subscriber = tracing_subscriber::registry().with(filter).with(layer);
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_are_forgiving() {
        assert_eq!(LoggingConfig::normalize_level(" WARNING "), "warn");
        assert_eq!(LoggingConfig::normalize_level("Debug"), "debug");
        assert_eq!(LoggingConfig::normalize_level(""), "info");
        assert_eq!(
            LoggingConfig::normalize_level("qsync.sync=trace,info"),
            "qsync.sync=trace,info"
        );
    }

    #[test]
    fn defaults_log_to_stderr_at_info() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, "info");
        assert!(config.stderr);
        assert!(!config.json);
        assert!(config.file.is_none());
    }
}
