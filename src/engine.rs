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

//! The supervision engine.
//!
//! A single thread owns the entry table and runs everything: reaping,
//! restart planning, timers, and shutdown.  Signals are received on a
//! dedicated bridge thread that does nothing but forward the signal number
//! over a channel; the engine thread picks them up at its next
//! `recv_timeout`, so no handler ever races another.
//!
//! Shutdown is two-phase.  Entering it cancels every pending restart timer,
//! then sends `SIGTERM` to the process group of each running entry and
//! polls at 100 ms intervals, reaping and probing liveness with signal 0.
//! Entries still alive when the 10-second deadline expires get `SIGKILL`
//! delivered to their group; the kernel then guarantees the final reap.

use anyhow::{Context, Result};
use libc::c_int;
use signal_hook::consts::signal::{SIGCHLD, SIGHUP, SIGINT, SIGTERM, SIGUSR1};
use signal_hook::iterator::Signals;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{event, Level};

use crate::cgroup::CgroupBase;
use crate::entry::{EntryState, EntryTable};
use crate::procfs;
use crate::reaper;
use crate::restart::{self, Disposition};
use crate::sys;

/// How long the polite phase of shutdown may take before escalation.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Liveness poll interval while shutting down.
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

/// Wait bound when no restart timer is pending.  Signals cut it short.
const IDLE_WAIT: Duration = Duration::from_secs(3600);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    Starting,
    Running,
    ShuttingDown,
    Halted,
}

#[derive(Debug)]
struct RestartTimer {
    due: Instant,
    name: String,
}

/// Owns the entry table and runs the event loop until told to stop.
pub struct Supervisor {
    table: EntryTable,
    cgroups: Option<CgroupBase>,
    phase: Phase,
    timers: Vec<RestartTimer>,
    signals: Receiver<c_int>,
}

impl Supervisor {
    /// Registers the signal bridge and takes ownership of the table.
    pub fn new(table: EntryTable, cgroups: Option<CgroupBase>) -> Result<Supervisor> {
        let signals = forward_signals()?;
        Ok(Supervisor {
            table,
            cgroups,
            phase: Phase::Starting,
            timers: Vec::new(),
            signals,
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Spawns every entry, runs the loop until a termination signal, then
    /// performs the shutdown sweep.  An error from the initial spawns aborts
    /// startup; nothing is allowed to half-start, so children that did come
    /// up are torn down again before the error propagates.
    pub fn run(&mut self) -> Result<()> {
        if let Err(error) = self.start_all() {
            self.shutdown();
            return Err(error);
        }
        self.phase = Phase::Running;
        event!(Level::INFO, "supervising {} service(s)", self.table.len());

        while self.phase == Phase::Running {
            self.step();
        }
        self.shutdown();
        Ok(())
    }

    fn start_all(&mut self) -> Result<()> {
        let cgroups = self.cgroups.as_ref();
        for entry in self.table.iter_mut() {
            entry.spawn(cgroups).context("startup aborted")?;
        }
        Ok(())
    }

    /// One turn of the loop: wait for a signal or the earliest timer, then
    /// fire whatever came due.
    fn step(&mut self) {
        let timeout = match self.next_deadline() {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => IDLE_WAIT,
        };
        match self.signals.recv_timeout(timeout) {
            Ok(signal) => self.handle_signal(signal),
            Err(RecvTimeoutError::Timeout) => (),
            Err(RecvTimeoutError::Disconnected) => {
                event!(Level::ERROR, "signal bridge disappeared, shutting down");
                self.phase = Phase::ShuttingDown;
            }
        }
        // A termination signal may just have been handled; a timer must not
        // spawn behind the shutdown trigger.
        if self.phase == Phase::Running {
            self.fire_due_timers();
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.timers.iter().map(|timer| timer.due).min()
    }

    fn handle_signal(&mut self, signal: c_int) {
        match signal {
            SIGCHLD => {
                for reaped in reaper::reap(&mut self.table) {
                    self.replan(&reaped.name);
                }
            }
            SIGTERM | SIGINT => {
                event!(Level::INFO, "received {}, shutting down", signal_name(signal));
                self.phase = Phase::ShuttingDown;
            }
            SIGUSR1 => self.dump_status(),
            SIGHUP => {
                event!(Level::INFO, "SIGHUP acknowledged; configuration reload is reserved");
            }
            other => event!(Level::DEBUG, "ignoring unexpected signal {other}"),
        }
    }

    /// Runs the planner over one stopped entry and schedules the resulting
    /// timer, if any.
    fn replan(&mut self, name: &str) {
        let Some(entry) = self.table.get_mut(name) else {
            return;
        };
        if entry.state != EntryState::Stopped {
            return;
        }
        match restart::plan(entry) {
            Disposition::Restart { delay } => {
                event!(
                    Level::INFO,
                    "{}: restarting in {:.1?} (attempt {} of {})",
                    entry.name,
                    delay,
                    entry.restarts,
                    entry.max_restarts
                );
                self.timers.push(RestartTimer {
                    due: Instant::now() + delay,
                    name: name.to_string(),
                });
            }
            Disposition::GiveUp => (),
        }
    }

    fn fire_due_timers(&mut self) {
        let now = Instant::now();
        let mut due = Vec::new();
        self.timers.retain(|timer| {
            if timer.due <= now {
                due.push(timer.name.clone());
                false
            } else {
                true
            }
        });
        for name in due {
            self.restart_entry(&name);
        }
    }

    /// A restart timer fired: spawn the entry again.  A failed spawn puts
    /// the entry back to `Stopped` and immediately re-plans, so the attempt
    /// still burns budget and the backoff keeps growing until exhaustion.
    fn restart_entry(&mut self, name: &str) {
        let cgroups = self.cgroups.as_ref();
        let Some(entry) = self.table.get_mut(name) else {
            return;
        };
        if entry.state != EntryState::Stopped {
            return;
        }
        if let Err(error) = entry.spawn(cgroups) {
            event!(Level::ERROR, "{error:#}");
            entry.state = EntryState::Stopped;
            self.replan(name);
        }
    }

    /// SIGUSR1: print the kernel's view of every running entry.
    fn dump_status(&self) {
        for entry in self.table.iter().filter(|entry| entry.is_running()) {
            match procfs::read_process_info(entry.pid) {
                Ok(info) => {
                    println!(
                        "{}: pid {} state {} rss {} kB vsize {} kB threads {}",
                        entry.name,
                        info.pid,
                        info.state,
                        info.vm_rss_kb,
                        info.vm_size_kb,
                        info.threads
                    );
                    for fd in &info.fds {
                        println!("  fd {:>3} -> {}", fd.fd, fd.target);
                    }
                    if let Some(cgroup) = &entry.cgroup {
                        if let Ok(bytes) = cgroup.current_memory_bytes() {
                            println!("  cgroup memory: {bytes} bytes");
                        }
                    }
                }
                Err(error) => {
                    // The process died under us; its reap is already pending.
                    event!(Level::WARN, "{}: status dump skipped ({error:#})", entry.name);
                }
            }
        }
    }

    /// The two-phase sweep.  One-way: every path ends in `Halted`.
    fn shutdown(&mut self) {
        self.phase = Phase::ShuttingDown;
        // A timer that fired after this point would spawn behind the sweep.
        self.timers.clear();

        event!(Level::INFO, "stopping {} service(s)", self.table.len());
        for entry in self.table.iter_mut() {
            if entry.is_running() {
                if let Err(error) = entry.signal(libc::SIGTERM) {
                    event!(Level::WARN, "{error:#}");
                }
            }
        }

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        loop {
            match self.signals.recv_timeout(SHUTDOWN_POLL) {
                Ok(SIGHUP) => {
                    event!(Level::INFO, "SIGHUP acknowledged during shutdown");
                }
                Ok(_) | Err(RecvTimeoutError::Timeout) => (),
                Err(RecvTimeoutError::Disconnected) => thread::sleep(SHUTDOWN_POLL),
            }
            reaper::reap(&mut self.table);
            if self.all_children_dead() {
                break;
            }
            if Instant::now() >= deadline {
                for entry in self.table.iter_mut() {
                    if entry.pid != 0 {
                        event!(
                            Level::WARN,
                            "{}: still alive after {:?}, killing its process group",
                            entry.name,
                            SHUTDOWN_GRACE
                        );
                        if let Err(error) = entry.signal(libc::SIGKILL) {
                            event!(Level::WARN, "{error:#}");
                        }
                    }
                }
                reaper::reap(&mut self.table);
                break;
            }
        }

        self.phase = Phase::Halted;
        self.teardown_cgroups();
        event!(Level::INFO, "halted");
    }

    /// Liveness is only ever probed on a pid this supervisor spawned and
    /// has not yet reaped; a reaped entry holds pid 0 and is trivially dead.
    fn all_children_dead(&self) -> bool {
        self.table
            .iter()
            .all(|entry| entry.pid == 0 || !sys::process_exists(entry.pid))
    }

    fn teardown_cgroups(&mut self) {
        for entry in self.table.iter_mut() {
            if let Some(cgroup) = entry.cgroup.take() {
                if let Err(error) = cgroup.destroy() {
                    event!(Level::WARN, "{}: cgroup not removed ({error:#})", entry.name);
                }
            }
        }
    }
}

/// Installs the handlers and spawns the queue-to-loop bridge.  The bridge
/// thread forwards raw signal numbers and touches nothing else; all state
/// belongs to the engine thread.
fn forward_signals() -> Result<Receiver<c_int>> {
    let mut signals = Signals::new([SIGCHLD, SIGTERM, SIGINT, SIGHUP, SIGUSR1])
        .context("could not install signal handlers")?;
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        for signal in signals.forever() {
            if tx.send(signal).is_err() {
                break;
            }
        }
    });
    Ok(rx)
}

fn signal_name(signal: c_int) -> &'static str {
    match signal {
        SIGTERM => "SIGTERM",
        SIGINT => "SIGINT",
        SIGHUP => "SIGHUP",
        SIGUSR1 => "SIGUSR1",
        SIGCHLD => "SIGCHLD",
        _ => "signal",
    }
}
