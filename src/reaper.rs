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

//! Collecting exited children.
//!
//! `SIGCHLD` coalesces: N simultaneous deaths can arrive as one delivery.
//! So each run of the reaper drains the kernel with a non-blocking any-child
//! wait until nothing is left, annotating the matching entry with its exit
//! status and runtime as it goes.  Policy lives elsewhere; this module only
//! records facts.

use std::time::Duration;
use tracing::{event, Level};

use crate::entry::EntryTable;
use crate::sys;

/// Emitted to the engine for every reaped child that belonged to an entry.
#[derive(Debug)]
pub struct ReapEvent {
    pub name: String,
    pub exit_code: i32,
    pub runtime: Duration,
}

/// Drains every exited child.  Pids that match no entry are logged and
/// dropped; when the supervisor runs as pid 1 it inherits reparented
/// grandchildren it never spawned.
pub fn reap(table: &mut EntryTable) -> Vec<ReapEvent> {
    let mut events = Vec::new();
    loop {
        match sys::wait_any_nohang() {
            Ok(Some((pid, status))) => match table.find_by_pid_mut(pid) {
                Some(entry) => {
                    let runtime = entry.start_time.elapsed();
                    entry.mark_exited(status, runtime);
                    let exit_code = entry.last_exit_code.unwrap_or(0);
                    event!(
                        Level::INFO,
                        "{}: pid {pid} exited with code {exit_code} after {runtime:.1?}",
                        entry.name
                    );
                    events.push(ReapEvent {
                        name: entry.name.clone(),
                        exit_code,
                        runtime,
                    });
                }
                None => {
                    event!(Level::DEBUG, "reaped unknown pid {pid} (inherited child)");
                }
            },
            Ok(None) => break,
            Err(error) => {
                // The next SIGCHLD retries; nothing to do now.
                event!(Level::WARN, "waitpid failed ({error})");
                break;
            }
        }
    }
    events
}
