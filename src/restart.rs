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

//! The restart decision.
//!
//! An entry that ran for longer than [`STABILITY_THRESHOLD`] before dying is
//! treated as a fresh incident: its attempt counter resets, so a service
//! that crashes once a day never exhausts its budget.  Within an incident,
//! attempts are bounded by `max_restarts` and spaced by
//! `base_restart_delay * backoff_factor^(n-1)`, which makes consecutive
//! delays non-decreasing for any factor >= 1.

use std::time::Duration;
use tracing::{event, Level};

use crate::entry::{EntryState, SupervisedEntry};

/// Minimum runtime after which the most recent incarnation counts as stable
/// and the attempt counter resets.
pub const STABILITY_THRESHOLD: Duration = Duration::from_secs(60);

/// Outcome of one planning pass over a stopped entry.
#[derive(Debug, PartialEq)]
pub enum Disposition {
    /// Spawn again after `delay`.
    Restart { delay: Duration },
    /// Budget exhausted; the entry has been moved to `Failed`.
    GiveUp,
}

/// Decides the fate of a `Stopped` entry.  Mutates the attempt counter and,
/// on exhaustion, the state; scheduling the actual timer is the engine's
/// job.  Deterministic given the entry's fields.
pub fn plan(entry: &mut SupervisedEntry) -> Disposition {
    if entry.last_uptime > STABILITY_THRESHOLD && entry.restarts > 0 {
        event!(
            Level::INFO,
            "{}: ran {:.0?} before exiting, treating as a fresh incident",
            entry.name,
            entry.last_uptime
        );
        entry.restarts = 0;
    }

    if entry.restarts >= entry.max_restarts {
        entry.state = EntryState::Failed;
        event!(
            Level::ERROR,
            "{}: gave up after {} restart(s), not restarting",
            entry.name,
            entry.restarts
        );
        return Disposition::GiveUp;
    }

    entry.restarts += 1;
    let delay = entry
        .base_restart_delay
        .mul_f64(entry.backoff_factor.powi(entry.restarts as i32 - 1));
    Disposition::Restart { delay }
}
