// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};

use crate::IdentityRange;

const DEFAULT_MAX_REQUESTS: u32 = 10;
const DEFAULT_RECONNECT_DELAY_MS: u64 = 5000;
const DEFAULT_AGENT_PORT: u16 = 22999;

fn default_max_requests() -> u32 {
    DEFAULT_MAX_REQUESTS
}

fn default_reconnect_delay_ms() -> u64 {
    DEFAULT_RECONNECT_DELAY_MS
}

fn default_agent_port() -> u16 {
    DEFAULT_AGENT_PORT
}

/// Limits applied to every canary session.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CanaryConfig {
    /// Number of mapping requests served on one stream before it is closed
    /// and re-established.
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,

    /// Delay between two sessions. Halved after a failed session.
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

impl CanaryConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl Default for CanaryConfig {
    fn default() -> Self {
        Self {
            max_requests: DEFAULT_MAX_REQUESTS,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
        }
    }
}

/// Node-wide configuration of the ID mapper. Loaded once at startup and never
/// modified afterwards.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MapperConfig {
    /// Where the host's proc filesystem is mounted.
    #[serde(rename = "procLocation")]
    pub proc_root: PathBuf,

    /// The only range container UID 0 may be mapped into.
    #[serde(rename = "rootUIDRange")]
    pub root_range: IdentityRange,

    /// Ranges any other container UID may be mapped into.
    #[serde(rename = "userUIDRange")]
    pub user_ranges: Vec<IdentityRange>,

    #[serde(default)]
    pub canary: CanaryConfig,

    /// TCP port the in-workspace agent serves the canary on.
    #[serde(default = "default_agent_port")]
    pub agent_port: u16,
}

impl MapperConfig {
    /// Reads and validates a JSON config file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Self = serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config {}", path.display()))?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        ensure!(
            !self.proc_root.as_os_str().is_empty(),
            "procLocation must not be empty"
        );
        ensure!(self.root_range.size > 0, "rootUIDRange has size 0");
        for (i, range) in self.user_ranges.iter().enumerate() {
            ensure!(range.size > 0, "userUIDRange[{i}] has size 0");
        }
        ensure!(self.canary.max_requests > 0, "canary.maxRequests must be positive");
        ensure!(
            self.canary.reconnect_delay_ms > 0,
            "canary.reconnectDelayMs must be positive"
        );
        Ok(())
    }
}
