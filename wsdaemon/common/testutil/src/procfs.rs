// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::path::Path;

use anyhow::{ensure, Result};
use itertools::Itertools;
use tempfile::TempDir;

/// A synthetic proc filesystem in a temporary directory.
///
/// Only the files the ID mapper reads are populated:
/// - `<pid>/status` with `Pid` and `NSpid` lines,
/// - `<pid>/task/<tid>/children`,
/// - `<pid>/cgroup`.
///
/// The directory is removed when the value is dropped.
pub struct FakeProcFs {
    dir: TempDir,
}

impl FakeProcFs {
    pub fn new() -> Result<Self> {
        Ok(Self {
            dir: tempfile::Builder::new().prefix("fakeproc.").tempdir()?,
        })
    }

    /// Returns the path to use in place of `/proc`.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Adds a process with a single thread.
    ///
    /// `nspid` lists the PID of the process in every PID namespace it is a
    /// member of, outermost first. The outermost one is reported as `Pid`.
    pub fn add_process(&self, pid: u64, nspid: &[u64], children: &[u64]) -> Result<()> {
        self.add_child_process(pid, 0, nspid, children)
    }

    /// Like [`FakeProcFs::add_process`], with `ppid` reported as the parent.
    pub fn add_child_process(
        &self,
        pid: u64,
        ppid: u64,
        nspid: &[u64],
        children: &[u64],
    ) -> Result<()> {
        ensure!(
            nspid.first() == Some(&pid),
            "NSpid of {pid} must start with {pid}, got {nspid:?}"
        );
        let proc_dir = self.path().join(pid.to_string());
        std::fs::create_dir_all(&proc_dir)?;
        std::fs::write(
            proc_dir.join("status"),
            format!(
                "Name:\tfake\nState:\tS (sleeping)\nTgid:\t{pid}\nPid:\t{pid}\nPPid:\t{ppid}\n\
                 NSpid:\t{}\n",
                nspid.iter().join("\t")
            ),
        )?;
        self.add_thread_children(pid, pid, children)
    }

    /// Adds a thread `tid` to process `pid` with the given children.
    pub fn add_thread_children(&self, pid: u64, tid: u64, children: &[u64]) -> Result<()> {
        let task_dir = self
            .path()
            .join(pid.to_string())
            .join("task")
            .join(tid.to_string());
        std::fs::create_dir_all(&task_dir)?;
        // The kernel separates entries with spaces and leaves a trailing one.
        std::fs::write(
            task_dir.join("children"),
            children.iter().map(|c| format!("{c} ")).join(""),
        )?;
        Ok(())
    }

    /// Sets the content of `<pid>/cgroup`.
    pub fn set_cgroup(&self, pid: u64, content: &str) -> Result<()> {
        let proc_dir = self.path().join(pid.to_string());
        std::fs::create_dir_all(&proc_dir)?;
        std::fs::write(proc_dir.join("cgroup"), content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_process_layout() -> Result<()> {
        let procfs = FakeProcFs::new()?;
        procfs.add_process(57000, &[57000, 42, 7], &[57001, 57002])?;

        let status = std::fs::read_to_string(procfs.path().join("57000/status"))?;
        assert!(status.contains("Pid:\t57000\n"), "{status}");
        assert!(status.contains("NSpid:\t57000\t42\t7\n"), "{status}");
        assert_eq!(
            std::fs::read_to_string(procfs.path().join("57000/task/57000/children"))?,
            "57001 57002 "
        );
        Ok(())
    }

    #[test]
    fn test_add_child_process_reports_parent() -> Result<()> {
        let procfs = FakeProcFs::new()?;
        procfs.add_child_process(5001, 5000, &[5001, 2], &[])?;

        let status = std::fs::read_to_string(procfs.path().join("5001/status"))?;
        assert!(status.contains("PPid:\t5000\n"), "{status}");
        Ok(())
    }

    #[test]
    fn test_add_process_rejects_inconsistent_nspid() -> Result<()> {
        let procfs = FakeProcFs::new()?;
        assert!(procfs.add_process(1, &[2, 1], &[]).is_err());
        Ok(())
    }

    #[test]
    fn test_removed_on_drop() -> Result<()> {
        let procfs = FakeProcFs::new()?;
        let path = procfs.path().to_path_buf();
        drop(procfs);
        assert!(!path.exists());
        Ok(())
    }
}
