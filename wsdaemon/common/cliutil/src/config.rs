// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::LoggingConfig;
use anyhow::Result;

/// The configuration for the current process.
/// This should rarely be used, as most users will just prefer Default::default().
#[derive(Default)]
pub struct ConfigBuilder {
    logging: Option<LoggingConfig>,

    log_command_line: Option<bool>,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the logging config. If this isn't called, it defaults to
    /// `LoggingConfig::from_env()`.
    pub fn logging(mut self, cfg: LoggingConfig) -> Self {
        self.logging = Some(cfg);
        self
    }

    /// `enable` controls whether to log the command-line of the current process.
    pub fn log_command_line(mut self, enable: bool) -> Self {
        self.log_command_line = Some(enable);
        self
    }

    /// Builds a Config suitable for use with cli_main.
    pub fn build(self) -> Result<Config> {
        let logging = match self.logging {
            Some(logging) => logging,
            None => LoggingConfig::from_env()?,
        };
        Ok(Config {
            logging,
            log_command_line: self.log_command_line.unwrap_or(true),
        })
    }
}

/// A POD struct containing the configs, after applying any defaults for unset values.
/// Build it with `cliutil::ConfigBuilder::new().set_<field>().build()`.
pub struct Config {
    pub(crate) logging: LoggingConfig,
    pub(crate) log_command_line: bool,
}
