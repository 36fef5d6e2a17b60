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

//! System call wrappers.

use libc::{self, c_int};
use std::io::Error;
use std::os::unix::prelude::*;
use std::process::ExitStatus;

/// Sends `signal` to the single process `pid`.  `signal` may be 0 to probe
/// for existence without delivering anything.
pub fn kill(pid: libc::pid_t, signal: c_int) -> Result<(), Error> {
    match unsafe { libc::kill(pid, signal) } {
        -1 => Err(Error::last_os_error()),
        _ => Ok(()),
    }
}

/// Sends `signal` to every member of the process group led by `pgid`.
pub fn kill_group(pgid: libc::pid_t, signal: c_int) -> Result<(), Error> {
    kill(-pgid, signal)
}

/// Probes `pid` with signal 0.  Only `ESRCH` proves absence; any other
/// error (`EPERM` in particular) means the process is still there.
pub fn process_exists(pid: libc::pid_t) -> bool {
    match kill(pid, 0) {
        Ok(()) => true,
        Err(error) => error.raw_os_error() != Some(libc::ESRCH),
    }
}

/// Non-blocking wait for any exited child.  Returns `Ok(Some((pid, status)))`
/// for one reaped child, or `Ok(None)` when no child is waiting to be reaped
/// (including when there are no children at all).
pub fn wait_any_nohang() -> Result<Option<(libc::pid_t, ExitStatus)>, Error> {
    loop {
        let mut status = 0;
        let retval = unsafe { libc::waitpid(-1, &mut status as *mut c_int, libc::WNOHANG) };
        if retval > 0 {
            return Ok(Some((retval, ExitStatus::from_raw(status))));
        }
        if retval == 0 {
            return Ok(None);
        }
        let error = Error::last_os_error();
        match error.raw_os_error() {
            Some(libc::ECHILD) => return Ok(None),
            Some(libc::EINTR) => (),
            _ => return Err(error),
        }
    }
}

/// Collapses an [`ExitStatus`] into the shell convention: the raw code for a
/// normal exit, `128 + N` for death by signal `N`.
pub fn exit_code(status: ExitStatus) -> i32 {
    match status.signal() {
        Some(signal) => 128 + signal,
        None => status.code().unwrap_or(0),
    }
}
