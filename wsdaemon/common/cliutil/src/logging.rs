// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use anyhow::{bail, Context, Result};
use std::{
    path::{Path, PathBuf},
    time::SystemTime,
};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{Layer, Registry};

/// Name of the environment variable containing the log directory and file respectively.
/// If both are provided, an error is thrown.
/// If neither is provided, no logging to files is performed.
pub const LOG_DIR_ENV: &str = "WSDAEMON_LOG_DIR";
pub const LOG_FILE_ENV: &str = "WSDAEMON_LOG_FILE";

/// An environment variable choosing whether to log to the console.
/// If "0", don't log to the console.
/// Otherwise, do log to the console.
pub const CONSOLE_LOG_ENV: &str = "WSDAEMON_LOG_CONSOLE";

/// An environment variable choosing the output format of every log sink.
/// "json" selects one JSON object per line, anything else plain text.
pub const LOG_FORMAT_ENV: &str = "WSDAEMON_LOG_FORMAT";

/// A guard object to perform cleanups with RAII.
pub struct LogGuard {
    _span_guard: tracing::span::EnteredSpan,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl LogFormat {
    fn from_env_value(value: Option<&str>) -> Self {
        match value {
            Some(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        }
    }

    fn layer<S, W>(self, writer: W, ansi: bool, filter: EnvFilter) -> Box<dyn Layer<S> + Send + Sync>
    where
        S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a> + 'static,
        W: for<'w> tracing_subscriber::fmt::MakeWriter<'w> + Send + Sync + 'static,
    {
        match self {
            LogFormat::Text => tracing_subscriber::fmt::layer()
                .with_ansi(ansi)
                .with_writer(writer)
                .with_filter(filter)
                .boxed(),
            LogFormat::Json => tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_writer(writer)
                .with_filter(filter)
                .boxed(),
        }
    }
}

fn default_filter() -> Result<EnvFilter> {
    Ok(EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?)
}

/// The configuration for the logger.
#[derive(Default)]
pub struct LoggingConfig {
    /// The path to dump the logs to, and a filter for which logs should be dumped there.
    /// If None, logs will not be written to a file.
    pub log_file: Option<(PathBuf, EnvFilter)>,
    /// A filter for which logs should be written to the console.
    /// If None, logs will not be written to the console.
    pub console_logger: Option<EnvFilter>,
    pub format: LogFormat,
}

impl LoggingConfig {
    pub fn from_env() -> Result<Self> {
        let timestamp = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();

        let log_file = match (std::env::var_os(LOG_FILE_ENV), std::env::var_os(LOG_DIR_ENV)) {
            (Some(_), Some(_)) => bail!("You can't have both {LOG_FILE_ENV} and {LOG_DIR_ENV} set"),
            (Some(file), None) => Some(PathBuf::from(file)),
            (None, Some(dir)) => {
                let name = format!("{}.{timestamp}.log", crate::get_current_process_name());
                Some(Path::new(&dir).join(name))
            }
            (None, None) => None,
        };

        let console_logger = match std::env::var(CONSOLE_LOG_ENV).ok().as_deref() {
            Some("0") => None,
            _ => Some(default_filter()?),
        };

        let log_file = match log_file {
            Some(log_file) => Some((log_file, default_filter()?)),
            None => None,
        };

        Ok(Self {
            log_file,
            console_logger,
            format: LogFormat::from_env_value(std::env::var(LOG_FORMAT_ENV).ok().as_deref()),
        })
    }

    /// Sets up the standard tracing subscriber in accordance with the config, and starts a span
    /// named "main".
    pub fn setup(self) -> Result<LogGuard> {
        let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

        if let Some(filter) = self.console_logger {
            layers.push(self.format.layer(std::io::stderr, true, filter));
        }

        if let Some((log_file, filter)) = self.log_file {
            let f = std::fs::File::create(&log_file)
                .with_context(|| format!("Failed to open log file {log_file:?}"))?;
            layers.push(self.format.layer(f, false, filter));
        }

        tracing_subscriber::registry()
            .with(layers)
            .try_init()
            .context("Failed to start logging. A subscriber is already installed.")?;

        let span_guard = tracing::trace_span!("main", pid = std::process::id()).entered();

        Ok(LogGuard {
            _span_guard: span_guard,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_from_env_value() {
        assert_eq!(LogFormat::from_env_value(None), LogFormat::Text);
        assert_eq!(LogFormat::from_env_value(Some("text")), LogFormat::Text);
        assert_eq!(LogFormat::from_env_value(Some("json")), LogFormat::Json);
        assert_eq!(LogFormat::from_env_value(Some("JSON")), LogFormat::Json);
    }

    #[test]
    fn setup_logging_works() -> Result<()> {
        const INFO_MESSAGE: &str = "log at level info";
        const WARN_MESSAGE: &str = "log at level warn";
        const DEBUG_MESSAGE: &str = "log at level debug";

        let dir = tempfile::tempdir()?;
        let log_file = dir.path().join("out.log");
        let filter = EnvFilter::builder().parse("info")?;

        {
            // Only one test may install the global subscriber.
            let _guard = LoggingConfig {
                log_file: Some((log_file.clone(), filter)),
                console_logger: None,
                format: LogFormat::Json,
            }
            .setup()?;

            tracing::warn!("{}", WARN_MESSAGE);
            tracing::info!("{}", INFO_MESSAGE);
            tracing::debug!("{}", DEBUG_MESSAGE);
        }

        let log_content = std::fs::read_to_string(log_file)?;
        assert!(
            !log_content.contains(DEBUG_MESSAGE),
            "Found debug message in {}",
            log_content
        );
        assert!(
            log_content.contains(INFO_MESSAGE),
            "Unable to find info message in {}",
            log_content
        );
        assert!(
            log_content.contains(WARN_MESSAGE),
            "Unable to find warn message in {}",
            log_content
        );
        for line in log_content.lines() {
            assert!(line.starts_with('{'), "Not a JSON line: {}", line);
        }

        Ok(())
    }
}
