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

//! A Linux process supervisor.
//!
//! `warden` is a long-running parent process that spawns a fixed table of
//! user-declared services, keeps them alive across crashes according to a
//! bounded exponential-backoff restart policy, constrains their resource use
//! through the cgroup v2 filesystem, and on shutdown propagates termination
//! to every process subtree so that no orphans or zombies remain.
//!
//! The pieces, leaves first:
//!
//!   - [`procfs`] reads `/proc/<pid>/{status,fd,maps}` into an in-memory
//!     [`ProcessInfo`] record for introspection.
//!
//!   - [`cgroup`] creates one leaf control group per service under a base
//!     directory, applies memory/CPU/PID limits, and moves the child into it.
//!     Every per-service cgroup operation is best effort: a service still
//!     runs if its limits could not be applied.
//!
//!   - [`entry`] holds the per-service state machine.  Each child is made a
//!     process-group leader before `exec`, so signals sent to the negative
//!     pid reach the entire subtree, grandchildren included.
//!
//!   - [`reaper`] drains exited children with a non-blocking any-child wait,
//!     since `SIGCHLD` deliveries coalesce.
//!
//!   - [`restart`] decides whether and when an exited service comes back:
//!     a stability reset after 60 s of clean runtime, a hard budget of
//!     attempts, and exponential backoff between them.
//!
//!   - [`engine`] ties it together in a strictly single-threaded event loop
//!     over signal arrivals and restart timers, and owns the two-phase
//!     shutdown: polite `SIGTERM` to every process group, then `SIGKILL`
//!     after a 10-second deadline.
//!
//! The [`config`] module decodes the JSON service file and builds the entry
//! table; the `warden` binary wires it all to a command line.

pub mod cgroup;
pub mod config;
pub mod engine;
pub mod entry;
pub mod procfs;
pub mod reaper;
pub mod restart;
pub mod sys;

pub use cgroup::{CgroupBase, CgroupHandle};
pub use engine::Supervisor;
pub use entry::{EntryState, EntryTable, SupervisedEntry};
pub use procfs::{read_process_info, ProcessInfo};
