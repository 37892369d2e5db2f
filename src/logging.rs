//! Logging initialization
//!
//! Builds the tracing subscriber from [`LoggingConfig`], with the
//! `LOG_LEVEL`, `LOG_FORMAT`, `LOG_OUTPUT` and `LOG_FILE` environment
//! variables taking precedence. Unknown values fall back to defaults
//! (`info`, `text`, `stderr`) rather than failing startup.

use crate::config::LoggingConfig;
use crate::error::{Error, Result};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Handle returned by [`init`]. For file output this owns the
/// non-blocking appender guard; dropping it flushes and stops the
/// writer thread, so the caller keeps it for the process lifetime.
pub struct LogGuard {
    _appender: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Effective settings after merging config and environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedLogging {
    pub level: String,
    pub format: LogFormat,
    pub output: LogOutput,
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    Stdout,
    Stderr,
    File,
}

/// Merge config with environment overrides. Split from [`init`] so the
/// fallback rules are testable without installing a global subscriber.
pub fn resolve(config: &LoggingConfig) -> ResolvedLogging {
    let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| config.level.clone());
    let level = if level.trim().is_empty() {
        "info".to_string()
    } else {
        level
    };

    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| config.format.clone());
    let format = match format.to_ascii_lowercase().as_str() {
        "json" => LogFormat::Json,
        "text" => LogFormat::Text,
        _ => LogFormat::Text,
    };

    let output = std::env::var("LOG_OUTPUT").unwrap_or_else(|_| config.output.clone());
    let output = match output.to_ascii_lowercase().as_str() {
        "stdout" => LogOutput::Stdout,
        "file" => LogOutput::File,
        "stderr" => LogOutput::Stderr,
        _ => LogOutput::Stderr,
    };

    let file = std::env::var("LOG_FILE")
        .ok()
        .map(PathBuf::from)
        .or_else(|| config.file.clone());

    // File output without a path degrades to stderr.
    let output = if output == LogOutput::File && file.is_none() {
        LogOutput::Stderr
    } else {
        output
    };

    ResolvedLogging {
        level,
        format,
        output,
        file,
    }
}

/// Install the global tracing subscriber.
pub fn init(config: &LoggingConfig) -> Result<LogGuard> {
    let resolved = resolve(config);

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&resolved.level));

    match resolved.output {
        LogOutput::Stdout => {
            install(filter, resolved.format, std::io::stdout);
            Ok(LogGuard { _appender: None })
        },
        LogOutput::Stderr => {
            install(filter, resolved.format, std::io::stderr);
            Ok(LogGuard { _appender: None })
        },
        LogOutput::File => {
            let path = resolved
                .file
                .ok_or_else(|| Error::Config("LOG_OUTPUT=file requires LOG_FILE".into()))?;

            let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let name = path
                .file_name()
                .ok_or_else(|| Error::Config(format!("invalid log file: {}", path.display())))?;

            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);

            match resolved.format {
                LogFormat::Json => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer().json().with_writer(writer).with_ansi(false))
                        .init();
                },
                LogFormat::Text => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer().with_writer(writer).with_ansi(false))
                        .init();
                },
            }

            Ok(LogGuard {
                _appender: Some(guard),
            })
        },
    }
}

fn install<W>(filter: EnvFilter, format: LogFormat, writer: W)
where
    W: for<'a> fmt::MakeWriter<'a> + Send + Sync + 'static,
{
    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(writer))
                .init();
        },
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(writer))
                .init();
        },
    }
}
