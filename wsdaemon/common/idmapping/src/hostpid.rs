// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::{
    collections::{HashSet, VecDeque},
    path::Path,
};

use anyhow::{Context, Result};
use tracing::{debug, instrument};

/// Returned by [`find_host_pid`] when no process in the tree carries the
/// requested in-container PID.
#[derive(Debug, Eq, PartialEq, thiserror::Error)]
#[error("in-container PID {pid} not found on the node")]
pub struct HostPidNotFound {
    pub pid: u64,
}

/// The subset of `/proc/<pid>/status` the ID mapper needs.
#[derive(Debug, Default, Eq, PartialEq)]
pub struct ProcessStatus {
    pub pid: u64,
    /// 0 for processes without a parent.
    pub ppid: u64,
    /// The process's PID in every PID namespace it belongs to, outermost
    /// first.
    pub nspid: Vec<u64>,
}

fn parse_pid_list(value: &str) -> Result<Vec<u64>> {
    value
        .split_ascii_whitespace()
        .map(|field| {
            field
                .parse::<u64>()
                .with_context(|| format!("Invalid PID {field:?}"))
        })
        .collect()
}

fn parse_status(content: &str) -> Result<ProcessStatus> {
    let mut pid = None;
    let mut ppid = 0;
    let mut nspid = Vec::new();
    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        match key {
            "Pid" => {
                pid = Some(
                    value
                        .trim()
                        .parse::<u64>()
                        .with_context(|| format!("Invalid Pid line {line:?}"))?,
                )
            }
            "PPid" => {
                ppid = value
                    .trim()
                    .parse::<u64>()
                    .with_context(|| format!("Invalid PPid line {line:?}"))?
            }
            "NSpid" => nspid = parse_pid_list(value)?,
            _ => {}
        }
    }
    Ok(ProcessStatus {
        pid: pid.context("status has no Pid line")?,
        ppid,
        nspid,
    })
}

fn read_status(proc_dir: &Path) -> Result<ProcessStatus> {
    let path = proc_dir.join("status");
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    parse_status(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Reads `<proc_root>/<pid>/status`.
pub fn read_process_status(proc_root: &Path, pid: u64) -> Result<ProcessStatus> {
    read_status(&proc_root.join(pid.to_string()))
}

/// Lists the children of every thread of a process. Threads whose children
/// cannot be read or parsed are skipped.
fn read_children(proc_dir: &Path) -> Result<Vec<u64>> {
    let task_dir = proc_dir.join("task");
    let mut children = Vec::new();
    for entry in std::fs::read_dir(&task_dir)
        .with_context(|| format!("Failed to list {}", task_dir.display()))?
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!("Skipping a thread of {}: {}", task_dir.display(), e);
                continue;
            }
        };
        let path = entry.path().join("children");
        // The thread may have exited since we listed the directory.
        let pids = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))
            .and_then(|content| {
                parse_pid_list(&content)
                    .with_context(|| format!("Failed to parse {}", path.display()))
            });
        match pids {
            Ok(pids) => children.extend(pids),
            Err(e) => debug!("Skipping thread: {:#}", e),
        }
    }
    Ok(children)
}

/// Translates a PID as seen from inside a workspace container into the PID of
/// the same process as seen through `proc_root`.
///
/// Walks the process tree below `seed_pid` breadth-first and returns the first
/// process whose NSpid list contains `target_pid`. The workspace process may
/// sit several PID namespaces deep (container runtime, sandbox layers), which
/// is why every NSpid entry is compared and not only the innermost one.
///
/// Processes whose status or children cannot be read are skipped, since they
/// may exit while the tree is being walked.
#[instrument(skip(proc_root))]
pub fn find_host_pid(
    proc_root: &Path,
    seed_pid: u64,
    target_pid: u64,
) -> Result<u64, HostPidNotFound> {
    let mut queue = VecDeque::from([seed_pid]);
    let mut seen = HashSet::new();

    while let Some(pid) = queue.pop_front() {
        if !seen.insert(pid) {
            continue;
        }

        let proc_dir = proc_root.join(pid.to_string());
        let status = match read_status(&proc_dir) {
            Ok(status) => status,
            Err(e) => {
                debug!("Skipping PID {}: {:#}", pid, e);
                continue;
            }
        };
        if status.nspid.contains(&target_pid) {
            return Ok(status.pid);
        }

        match read_children(&proc_dir) {
            Ok(children) => queue.extend(children.into_iter().filter(|c| !seen.contains(c))),
            Err(e) => debug!("Skipping children of PID {}: {:#}", pid, e),
        }
    }

    Err(HostPidNotFound { pid: target_pid })
}
