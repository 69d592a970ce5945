// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};

use anyhow::{ensure, Context, Result};
use async_trait::async_trait;
use idmapping::read_process_status;
use tracing::{debug, instrument};

/// Resolves a workspace container to a process on the node.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Returns the host PID of the container's init process.
    ///
    /// Called once per mapping request, since a restarted container gets a
    /// new PID.
    async fn container_pid(&self, container_id: &str) -> Result<u64>;
}

/// A [`ContainerRuntime`] that finds containers by their cgroup.
///
/// Container runtimes put the container ID into the cgroup path of every
/// process of the container. The container's init is the process among them
/// whose parent is not in the container. PIDs wrap around, so a descendant
/// may well have a lower PID than init.
pub struct ProcCgroupRuntime {
    proc_root: PathBuf,
}

impl ProcCgroupRuntime {
    pub fn new(proc_root: &Path) -> Self {
        Self {
            proc_root: proc_root.to_path_buf(),
        }
    }
}

/// Lists the PIDs whose cgroup mentions `container_id`.
fn scan_cgroups(proc_root: &Path, container_id: &str) -> Result<BTreeSet<u64>> {
    let mut found = BTreeSet::new();
    for entry in std::fs::read_dir(proc_root)
        .with_context(|| format!("Failed to list {}", proc_root.display()))?
    {
        let entry = entry?;
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u64>().ok())
        else {
            continue;
        };

        let path = entry.path().join("cgroup");
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => {
                debug!("Skipping {}: {}", path.display(), e);
                continue;
            }
        };
        if content.lines().any(|line| line.contains(container_id)) {
            found.insert(pid);
        }
    }
    Ok(found)
}

/// Returns the lowest PID of the container whose parent is outside the
/// container. Processes whose status cannot be read are only picked if no
/// other process qualifies.
fn find_container_init(proc_root: &Path, container_id: &str) -> Result<Option<u64>> {
    let pids = scan_cgroups(proc_root, container_id)?;
    let mut fallback = None;
    for &pid in &pids {
        match read_process_status(proc_root, pid) {
            Ok(status) if !pids.contains(&status.ppid) => return Ok(Some(pid)),
            Ok(_) => {}
            Err(e) => {
                debug!("Cannot read status of PID {}: {:#}", pid, e);
                fallback.get_or_insert(pid);
            }
        }
    }
    Ok(fallback.or_else(|| pids.first().copied()))
}

#[async_trait]
impl ContainerRuntime for ProcCgroupRuntime {
    #[instrument(skip(self))]
    async fn container_pid(&self, container_id: &str) -> Result<u64> {
        // An empty ID would match every process on the node.
        ensure!(!container_id.is_empty(), "Empty container ID");

        let proc_root = self.proc_root.clone();
        let id = container_id.to_owned();
        let found = tokio::task::spawn_blocking(move || find_container_init(&proc_root, &id))
            .await
            .context("cgroup scan panicked")??;
        found.with_context(|| format!("No process found for container {container_id}"))
    }
}

#[cfg(test)]
mod tests {
    use idmapping::find_host_pid;
    use testutil::FakeProcFs;

    use super::*;

    const CONTAINER_ID: &str = "3f1e6a0d2c7b";

    #[tokio::test]
    async fn test_falls_back_to_lowest_pid_without_status() -> Result<()> {
        let procfs = FakeProcFs::new()?;
        procfs.set_cgroup(1, "0::/init.scope\n")?;
        procfs.set_cgroup(
            4100,
            &format!("0::/kubepods/burstable/pod1234/{CONTAINER_ID}\n"),
        )?;
        procfs.set_cgroup(
            4000,
            &format!("0::/kubepods/burstable/pod1234/{CONTAINER_ID}\n"),
        )?;
        procfs.set_cgroup(3000, "0::/kubepods/burstable/pod1234/other\n")?;
        std::fs::create_dir_all(procfs.path().join("self"))?;

        let runtime = ProcCgroupRuntime::new(procfs.path());
        assert_eq!(runtime.container_pid(CONTAINER_ID).await?, 4000);
        Ok(())
    }

    #[tokio::test]
    async fn test_finds_init_after_pid_wraparound() -> Result<()> {
        let procfs = FakeProcFs::new()?;
        let cgroup = format!("0::/kubepods/pod1234/{CONTAINER_ID}\n");
        procfs.add_child_process(100, 1, &[100], &[5000])?;
        procfs.set_cgroup(100, "0::/system.slice/containerd.service\n")?;
        procfs.add_child_process(5000, 100, &[5000, 1], &[5001])?;
        procfs.set_cgroup(5000, &cgroup)?;
        procfs.add_child_process(5001, 5000, &[5001, 2], &[300])?;
        procfs.set_cgroup(5001, &cgroup)?;
        // Spawned after the PID counter wrapped.
        procfs.add_child_process(300, 5001, &[300, 3], &[])?;
        procfs.set_cgroup(300, &cgroup)?;

        let runtime = ProcCgroupRuntime::new(procfs.path());
        let seed = runtime.container_pid(CONTAINER_ID).await?;
        assert_eq!(seed, 5000);
        assert_eq!(find_host_pid(procfs.path(), seed, 2)?, 5001);
        assert_eq!(find_host_pid(procfs.path(), seed, 3)?, 300);
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_container() -> Result<()> {
        let procfs = FakeProcFs::new()?;
        procfs.set_cgroup(1, "0::/init.scope\n")?;

        let runtime = ProcCgroupRuntime::new(procfs.path());
        let err = runtime.container_pid(CONTAINER_ID).await.unwrap_err();
        assert!(format!("{err:#}").contains(CONTAINER_ID), "{err:#}");
        Ok(())
    }

    #[tokio::test]
    async fn test_rejects_empty_id() -> Result<()> {
        let procfs = FakeProcFs::new()?;
        procfs.set_cgroup(1, "0::/init.scope\n")?;

        let runtime = ProcCgroupRuntime::new(procfs.path());
        assert!(runtime.container_pid("").await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_skips_processes_without_cgroup() -> Result<()> {
        let procfs = FakeProcFs::new()?;
        procfs.add_process(10, &[10], &[])?;
        procfs.set_cgroup(20, &format!("0::/{CONTAINER_ID}\n"))?;

        let runtime = ProcCgroupRuntime::new(procfs.path());
        assert_eq!(runtime.container_pid(CONTAINER_ID).await?, 20);
        Ok(())
    }
}
