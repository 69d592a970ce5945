// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::{
    fs::OpenOptions,
    io::Write,
    os::unix::fs::OpenOptionsExt,
    path::{Path, PathBuf},
};

use anyhow::{ensure, Context, Result};
use itertools::Itertools;
use tracing::instrument;

/// One line of a uid_map/gid_map: `size` IDs starting at `container_id` in
/// the user namespace map to IDs starting at `host_id` in the parent.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MappingEntry {
    pub container_id: u32,
    pub host_id: u32,
    pub size: u32,
}

impl MappingEntry {
    pub fn new(container_id: u32, host_id: u32, size: u32) -> Self {
        Self {
            container_id,
            host_id,
            size,
        }
    }
}

/// Renders a mapping in the format the kernel expects in uid_map/gid_map.
pub fn render_mapping(mapping: &[MappingEntry]) -> String {
    mapping
        .iter()
        .map(|entry| format!("{} {} {}\n", entry.container_id, entry.host_id, entry.size))
        .join("")
}

fn map_file_path(proc_root: &Path, host_pid: u64, is_gid: bool) -> PathBuf {
    let name = if is_gid { "gid_map" } else { "uid_map" };
    proc_root.join(host_pid.to_string()).join(name)
}

/// Writes the mapping to `<proc_root>/<host_pid>/uid_map` (or `gid_map`).
///
/// The kernel only accepts a map that arrives in a single write(2), and only
/// once per user namespace. A second attempt fails with EPERM.
#[instrument(skip(proc_root, mapping))]
pub fn write_mapping(
    proc_root: &Path,
    host_pid: u64,
    is_gid: bool,
    mapping: &[MappingEntry],
) -> Result<()> {
    let path = map_file_path(proc_root, host_pid, is_gid);
    let content = render_mapping(mapping);

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o644)
        .open(&path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let written = file
        .write(content.as_bytes())
        .with_context(|| format!("Failed to write {}", path.display()))?;
    ensure!(
        written == content.len(),
        "Short write to {}: {} of {} bytes",
        path.display(),
        written,
        content.len()
    );
    Ok(())
}
