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

//! One supervised service and the table of all of them.
//!
//! A [`SupervisedEntry`] couples the launch specification and restart policy
//! a user declared with the runtime state of the current incarnation.  The
//! invariants the rest of the crate leans on:
//!
//!   - `state == Running` if and only if `pid > 0`;
//!   - `pgid == pid` for the whole life of an incarnation, because the child
//!     is made a process-group leader before `exec`;
//!   - every signal the supervisor sends targets the process *group*, never
//!     a bare pid;
//!   - a reaped entry has `pid == 0`, so a stale signal can never land on a
//!     pid the kernel has recycled.
//!
//! Entries are mutated only from the engine's event loop (or from code the
//! engine calls synchronously); that single-threading is the serialization
//! contract, there is no per-entry lock.

use anyhow::{bail, Context, Result};
use libc::c_int;
use std::collections::HashSet;
use std::io;
use std::os::unix::prelude::*;
use std::process::Command;
use std::time::{Duration, Instant};
use tracing::{event, Level};

use crate::cgroup::{CgroupBase, CgroupHandle};
use crate::sys;

/// Restart budget applied when the configuration does not name one.
pub const DEFAULT_MAX_RESTARTS: u32 = 3;

/// Delay before the first restart attempt.
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(1);

/// Multiplier applied to the delay on each successive attempt.
pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EntryState {
    /// Not running; eligible for a restart decision.
    Stopped,
    /// `spawn` is underway.
    Starting,
    /// Running with a live pid.
    Running,
    /// Out of restart budget, or the launch itself failed.  Terminal until
    /// the supervisor exits.
    Failed,
}

/// One user-declared service.
#[derive(Debug)]
pub struct SupervisedEntry {
    pub name: String,
    pub command: String,
    pub argv: Vec<String>,

    pub max_restarts: u32,
    pub base_restart_delay: Duration,
    pub backoff_factor: f64,
    pub memory_limit_bytes: Option<u64>,
    pub cpu_quota_percent: Option<u64>,
    pub pids_limit: Option<u64>,

    pub state: EntryState,
    /// 0 whenever the entry is not running.
    pub pid: libc::pid_t,
    /// Equal to `pid` while running; the child is its own group leader.
    pub pgid: libc::pid_t,
    pub start_time: Instant,
    /// How long the most recent incarnation ran before it exited.
    pub last_uptime: Duration,
    /// Raw exit code, or `128 + N` for death by signal `N`.
    pub last_exit_code: Option<i32>,
    /// Restart attempts since the last stability reset.
    pub restarts: u32,
    pub cgroup: Option<CgroupHandle>,
}

impl SupervisedEntry {
    pub fn new(name: impl Into<String>, command: impl Into<String>, argv: Vec<String>) -> Self {
        SupervisedEntry {
            name: name.into(),
            command: command.into(),
            argv,
            max_restarts: DEFAULT_MAX_RESTARTS,
            base_restart_delay: DEFAULT_RESTART_DELAY,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            memory_limit_bytes: None,
            cpu_quota_percent: None,
            pids_limit: None,
            state: EntryState::Stopped,
            pid: 0,
            pgid: 0,
            start_time: Instant::now(),
            last_uptime: Duration::ZERO,
            last_exit_code: None,
            restarts: 0,
            cgroup: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == EntryState::Running
    }

    /// Launches the child.  The child joins a new process group with itself
    /// as leader before `exec`, so it can never fork a grandchild outside
    /// the group; stdout and stderr are inherited from the supervisor.
    ///
    /// When `cgroups` names a usable base, a leaf cgroup is created for the
    /// entry, limits applied, and the new pid attached.  Each of those steps
    /// is best effort: a failure is logged and the child keeps running.
    pub fn spawn(&mut self, cgroups: Option<&CgroupBase>) -> Result<()> {
        self.state = EntryState::Starting;
        let mut command = Command::new(&self.command);
        command.args(&self.argv);
        unsafe {
            command.pre_exec(|| match libc::setpgid(0, 0) {
                -1 => Err(io::Error::last_os_error()),
                _ => Ok(()),
            });
        }

        let child = match command.spawn() {
            Ok(child) => child,
            Err(error) => {
                self.state = EntryState::Failed;
                self.pid = 0;
                self.pgid = 0;
                return Err(error)
                    .with_context(|| format!("{}: could not launch {:?}", self.name, self.command));
            }
        };
        let pid = child.id() as libc::pid_t;
        // The handle is not used for waiting; the reaper collects every
        // child through waitpid(-1).
        drop(child);

        self.state = EntryState::Running;
        self.pid = pid;
        self.pgid = pid;
        self.start_time = Instant::now();
        event!(Level::INFO, "{}: started as pid {pid}", self.name);

        if let Some(base) = cgroups {
            self.setup_cgroup(base, pid);
        }
        Ok(())
    }

    fn setup_cgroup(&mut self, base: &CgroupBase, pid: libc::pid_t) {
        let handle = match CgroupHandle::create(base, &self.name) {
            Ok(handle) => handle,
            Err(error) => {
                event!(Level::WARN, "{}: running without a cgroup ({error:#})", self.name);
                return;
            }
        };
        if let Some(bytes) = self.memory_limit_bytes {
            if let Err(error) = handle.set_memory_limit(bytes) {
                event!(Level::WARN, "{}: memory limit not applied ({error:#})", self.name);
            }
        }
        if let Some(percent) = self.cpu_quota_percent {
            if let Err(error) = handle.set_cpu_quota(percent) {
                event!(Level::WARN, "{}: cpu quota not applied ({error:#})", self.name);
            }
        }
        if let Some(limit) = self.pids_limit {
            if let Err(error) = handle.set_pids_limit(limit) {
                event!(Level::WARN, "{}: pids limit not applied ({error:#})", self.name);
            }
        }
        if let Err(error) = handle.attach(pid) {
            event!(Level::WARN, "{}: pid {pid} not attached to cgroup ({error:#})", self.name);
        }
        self.cgroup = Some(handle);
    }

    /// Sends `signal` to the entry's process group.  State is not touched
    /// here; transitions happen only when the child is reaped.
    pub fn signal(&self, signal: c_int) -> Result<()> {
        if self.pid == 0 {
            bail!("{}: not running", self.name);
        }
        sys::kill_group(self.pgid, signal)
            .with_context(|| format!("{}: could not signal process group {}", self.name, self.pgid))
    }

    /// Records the exit of the current incarnation.  Called by the reaper
    /// with the status from `waitpid`.  Clearing the pid here is what keeps
    /// later liveness probes off recycled pids.
    pub fn mark_exited(&mut self, status: std::process::ExitStatus, runtime: Duration) {
        self.state = EntryState::Stopped;
        self.last_uptime = runtime;
        self.last_exit_code = Some(sys::exit_code(status));
        self.pid = 0;
        self.pgid = 0;
    }
}

/// The fixed mapping from service name to entry.  Built once before the
/// event loop starts; iteration follows declaration order, which is also the
/// tie-break order for restart decisions.
#[derive(Debug)]
pub struct EntryTable {
    entries: Vec<SupervisedEntry>,
}

impl EntryTable {
    pub fn new(entries: Vec<SupervisedEntry>) -> Result<EntryTable> {
        if entries.is_empty() {
            bail!("no services to supervise");
        }
        let mut seen = HashSet::new();
        for entry in &entries {
            if entry.name.is_empty() {
                bail!("service name must not be empty");
            }
            if !seen.insert(entry.name.clone()) {
                bail!("duplicate service name {:?}", entry.name);
            }
        }
        Ok(EntryTable { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SupervisedEntry> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut SupervisedEntry> {
        self.entries.iter_mut()
    }

    pub fn get(&self, name: &str) -> Option<&SupervisedEntry> {
        self.entries.iter().find(|entry| entry.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut SupervisedEntry> {
        self.entries.iter_mut().find(|entry| entry.name == name)
    }

    /// Looks up the running entry that owns `pid`.  Entries that have been
    /// reaped hold pid 0 and can never match.
    pub fn find_by_pid_mut(&mut self, pid: libc::pid_t) -> Option<&mut SupervisedEntry> {
        self.entries
            .iter_mut()
            .find(|entry| entry.pid != 0 && entry.pid == pid)
    }
}
