/*
Copyright (c) 2022 VMware, Inc.
SPDX-License-Identifier: MIT
Permission is hereby granted, free of charge, to any person obtaining a copy
of this software and associated documentation files (the "Software"), to deal
in the Software without restriction, including without limitation the rights
to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
copies of the Software, and to permit persons to whom the Software is
furnished to do so, subject to the following conditions:
The above copyright notice and this permission notice shall be included in all
copies or substantial portions of the Software.
THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
SOFTWARE.
 */

//! Resource limits through the cgroup v2 unified hierarchy.
//!
//! Each supervised service gets a leaf directory under a base established at
//! startup; memory, CPU, and pid-count limits are plain writes into the
//! kernel's control files, and moving a pid into `cgroup.procs` relocates
//! the process with all of its threads atomically.
//!
//! The v2 "no internal processes" rule means a cgroup with member processes
//! cannot enable controllers for its children.  [`CgroupBase::bootstrap`]
//! therefore parks the supervisor itself in a `supervisor` leaf next to the
//! service leaves before touching `cgroup.subtree_control`.

use anyhow::{bail, Context, Result};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{event, Level};

/// Mount point of the unified hierarchy.
pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";

const CGROUP_PROCS: &str = "cgroup.procs";
const CPU_PERIOD_USECS: u64 = 100_000;

/// The parent directory that per-service leaves are created under.
#[derive(Debug)]
pub struct CgroupBase {
    path: PathBuf,
}

impl CgroupBase {
    /// Wraps an already-delegated base directory, for deployments where a
    /// system manager hands the supervisor a writable subtree.
    pub fn at(path: impl Into<PathBuf>) -> CgroupBase {
        CgroupBase { path: path.into() }
    }

    /// Claims `<root>/<name>` on the unified hierarchy, moves the supervisor
    /// into a leaf of its own, and enables the cpu/memory/pids controllers
    /// for the service leaves.  Directories left behind by an earlier run
    /// are reused.
    pub fn bootstrap(name: &str) -> Result<CgroupBase> {
        let root = Path::new(CGROUP_ROOT);
        if !root.join("cgroup.controllers").exists() {
            bail!("cgroup v2 unified hierarchy not mounted at {CGROUP_ROOT}");
        }
        let base = root.join(name);
        create_dir_idempotent(&base)?;

        // Park ourselves in a leaf; a cgroup with member processes cannot
        // enable controllers for its children.
        let own_leaf = base.join("supervisor");
        create_dir_idempotent(&own_leaf)?;
        write_control(&own_leaf.join(CGROUP_PROCS), std::process::id())
            .context("could not move the supervisor into its leaf cgroup")?;

        if let Err(error) = write_control(&base.join("cgroup.subtree_control"), "+cpu +memory +pids")
        {
            event!(Level::WARN, "could not enable cgroup controllers ({error:#})");
        }
        Ok(CgroupBase { path: base })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Owned association with one created leaf directory.  Destroyed by
/// removing the directory, which the kernel only permits once no task is
/// attached.
#[derive(Debug)]
pub struct CgroupHandle {
    path: PathBuf,
}

impl CgroupHandle {
    /// Makes `<base>/<name>`; the kernel populates the control files.
    /// Creating a directory that already exists (after a supervisor crash,
    /// or on restart of the same service) is not an error.
    pub fn create(base: &CgroupBase, name: &str) -> Result<CgroupHandle> {
        let path = base.path().join(name);
        create_dir_idempotent(&path)?;
        Ok(CgroupHandle { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Caps memory use at `bytes`.  No-op when `bytes` is 0.
    pub fn set_memory_limit(&self, bytes: u64) -> Result<()> {
        if bytes == 0 {
            return Ok(());
        }
        write_control(&self.path.join("memory.max"), bytes)
    }

    /// Caps CPU use at `percent` of one core: 50 is half a core, 200 is two
    /// cores.  No-op when `percent` is 0.
    pub fn set_cpu_quota(&self, percent: u64) -> Result<()> {
        if percent == 0 {
            return Ok(());
        }
        let quota = percent * CPU_PERIOD_USECS / 100;
        write_control(&self.path.join("cpu.max"), format!("{quota} {CPU_PERIOD_USECS}"))
    }

    /// Caps the number of tasks.  No-op when `limit` is 0.
    pub fn set_pids_limit(&self, limit: u64) -> Result<()> {
        if limit == 0 {
            return Ok(());
        }
        write_control(&self.path.join("pids.max"), limit)
    }

    /// Moves `pid` and all of its threads into this cgroup.
    pub fn attach(&self, pid: libc::pid_t) -> Result<()> {
        write_control(&self.path.join(CGROUP_PROCS), pid)
    }

    /// Current memory charge, from `memory.current`.
    pub fn current_memory_bytes(&self) -> Result<u64> {
        let path = self.path.join("memory.current");
        let text = fs::read_to_string(&path)
            .with_context(|| format!("could not read {}", path.display()))?;
        Ok(text.trim().parse().unwrap_or(0))
    }

    /// Removes the directory.  The kernel refuses unless it is empty, i.e.
    /// every attached task has been reaped or moved away.
    pub fn destroy(self) -> Result<()> {
        fs::remove_dir(&self.path)
            .with_context(|| format!("could not remove cgroup {}", self.path.display()))
    }
}

fn create_dir_idempotent(path: &Path) -> Result<()> {
    match fs::create_dir(path) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == ErrorKind::AlreadyExists => Ok(()),
        Err(error) => {
            Err(error).with_context(|| format!("could not create cgroup {}", path.display()))
        }
    }
}

/// Control files are created by the kernel, never by us; opening without
/// `create` keeps a bad path from materializing a plain file.
fn write_control<T: ToString>(path: &Path, data: T) -> Result<()> {
    let data = data.to_string();
    fs::OpenOptions::new()
        .write(true)
        .open(path)
        .and_then(|mut file| file.write_all(data.as_bytes()))
        .with_context(|| format!("could not write {:?} to {}", data, path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // A scratch directory standing in for a delegated cgroup subtree.  The
    // control files the kernel would provide are created by hand.
    fn scratch_base() -> CgroupBase {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let count = COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!(
            "warden-cgroup-test-{}-{count}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&path);
        fs::create_dir_all(&path).unwrap();
        CgroupBase::at(path)
    }

    fn fake_control_files(handle: &CgroupHandle) {
        for name in ["memory.max", "cpu.max", "pids.max", "cgroup.procs", "memory.current"] {
            fs::write(handle.path().join(name), "").unwrap();
        }
    }

    #[test]
    fn create_is_idempotent() {
        let base = scratch_base();
        let first = CgroupHandle::create(&base, "web").unwrap();
        let second = CgroupHandle::create(&base, "web").unwrap();
        assert_eq!(first.path(), second.path());
    }

    #[test]
    fn limits_use_the_documented_formats() {
        let base = scratch_base();
        let handle = CgroupHandle::create(&base, "web").unwrap();
        fake_control_files(&handle);

        handle.set_memory_limit(64 * 1024 * 1024).unwrap();
        assert_eq!(
            fs::read_to_string(handle.path().join("memory.max")).unwrap(),
            "67108864"
        );

        handle.set_cpu_quota(50).unwrap();
        assert_eq!(
            fs::read_to_string(handle.path().join("cpu.max")).unwrap(),
            "50000 100000"
        );
        handle.set_cpu_quota(200).unwrap();
        assert_eq!(
            fs::read_to_string(handle.path().join("cpu.max")).unwrap(),
            "200000 100000"
        );

        handle.set_pids_limit(16).unwrap();
        assert_eq!(
            fs::read_to_string(handle.path().join("pids.max")).unwrap(),
            "16"
        );

        handle.attach(1234).unwrap();
        assert_eq!(
            fs::read_to_string(handle.path().join(CGROUP_PROCS)).unwrap(),
            "1234"
        );
    }

    #[test]
    fn zero_limits_are_noops() {
        let base = scratch_base();
        let handle = CgroupHandle::create(&base, "web").unwrap();
        // No control files exist, so a real write would fail loudly.
        handle.set_memory_limit(0).unwrap();
        handle.set_cpu_quota(0).unwrap();
        handle.set_pids_limit(0).unwrap();
    }

    #[test]
    fn writes_never_create_control_files() {
        let base = scratch_base();
        let handle = CgroupHandle::create(&base, "web").unwrap();
        assert!(handle.set_memory_limit(1).is_err());
        assert!(!handle.path().join("memory.max").exists());
    }

    #[test]
    fn current_memory_reads_the_charge() {
        let base = scratch_base();
        let handle = CgroupHandle::create(&base, "web").unwrap();
        fake_control_files(&handle);
        fs::write(handle.path().join("memory.current"), "8675309\n").unwrap();
        assert_eq!(handle.current_memory_bytes().unwrap(), 8675309);
    }

    #[test]
    fn destroy_requires_an_empty_directory() {
        let base = scratch_base();
        let handle = CgroupHandle::create(&base, "web").unwrap();
        fake_control_files(&handle);
        let path = handle.path().to_path_buf();
        assert!(handle.destroy().is_err());
        for dirent in fs::read_dir(&path).unwrap() {
            fs::remove_file(dirent.unwrap().path()).unwrap();
        }
        let handle = CgroupHandle { path: path.clone() };
        handle.destroy().unwrap();
        assert!(!path.exists());
    }
}
