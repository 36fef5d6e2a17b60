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

//! End-to-end tests against the real `warden` binary.  Supervised children
//! drop their own pid into a file so the tests can find and probe them.

use anyhow::{anyhow, Result};
use std::fs::File;
use std::io::ErrorKind;
use std::os::raw::c_int;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Mutex;
use std::time::{Duration, Instant};

fn warden_command() -> Command {
    Command::new(env!("CARGO_BIN_EXE_warden"))
}

enum Completion<T> {
    Incomplete,
    Complete(T),
}
use Completion::*;

/// Repeatedly evaluates `condition`, sleeping a bit between calls, until it
/// yields Complete(value), then returns Ok(value).  After a while, however,
/// give up and return an error instead.  The budget comfortably covers the
/// supervisor's 10-second kill escalation.
fn wait_until<T, F>(mut condition: F) -> Result<T>
where
    F: FnMut() -> Completion<T>,
{
    for i in 0..20 {
        if let Complete(result) = condition() {
            return Ok(result);
        }
        let ms = match i {
            0 => 10,
            1 => 100,
            _ => 1000,
        };
        std::thread::sleep(Duration::from_millis(ms));
    }
    Err(anyhow!("wait_until timed out"))
}

fn remove_if_exists<P: AsRef<Path>>(path: P) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e)?,
    }
}

fn unique_filename(extension: &str) -> Result<PathBuf> {
    static COUNTER: Mutex<usize> = Mutex::new(0);
    let count = match *COUNTER.lock().unwrap() {
        ref mut counter => {
            *counter += 1;
            *counter
        }
    };

    let pid = std::process::id();
    let path = std::env::temp_dir().join(format!("warden-test{pid}.{count}.{extension}"));
    remove_if_exists(&path)?;
    Ok(path)
}

fn write_config(services_json: &str) -> Result<PathBuf> {
    let path = unique_filename("json")?;
    std::fs::write(&path, format!("{{\"services\": [{services_json}]}}"))?;
    Ok(path)
}

fn send_signal(pid: libc::pid_t, signal: c_int) -> Result<(), std::io::Error> {
    if unsafe { libc::kill(pid, signal) } < 0 {
        Err(std::io::Error::last_os_error())?
    } else {
        Ok(())
    }
}

fn process_exists(pid: libc::pid_t) -> Result<(), std::io::Error> {
    send_signal(pid, 0)
}

fn read_pidfile<P>(path: P) -> Result<libc::pid_t>
where
    P: AsRef<Path>,
{
    let pidfile_string = String::from_utf8(std::fs::read(path)?)?;
    Ok(pidfile_string.trim().parse()?)
}

/// Pids appended to `path`, one per line, oldest first.
fn read_pid_lines<P: AsRef<Path>>(path: P) -> Vec<libc::pid_t> {
    let text = std::fs::read_to_string(path).unwrap_or_default();
    text.lines().filter_map(|line| line.trim().parse().ok()).collect()
}

/// Wait until `path` exists.
fn wait_until_file_exists<P>(path: P) -> Result<()>
where
    P: AsRef<Path>,
{
    wait_until(|| match path.as_ref().exists() {
        true => Complete(()),
        false => Incomplete,
    })?;
    Ok(())
}

/// This won't work if `pid` is our direct child.  Use `wait_for_child_to_die`
/// in that case.
fn wait_for_process_to_die(pid: libc::pid_t) -> Result<()> {
    wait_until(|| match process_exists(pid) {
        Ok(()) => Incomplete,
        Err(_) => Complete(()),
    })
}

/// Waits for `child` to die, and returns:
///    - `Ok(Ok(status))`: Child exited with `status`.
///    - `Ok(Err(e))`: System reported error waiting for `child`.
///    - `Err(e)`: Timeout.
fn wait_for_child_to_die(child: &mut Child) -> Result<Result<ExitStatus>> {
    match wait_until(|| match child.try_wait() {
        Ok(Some(status)) => Complete(Ok(status)),
        Ok(None) => Incomplete,
        Err(e) => Complete(Err(e)),
    }) {
        Ok(Ok(result)) => Ok(Ok(result)),
        Ok(Err(error)) => Ok(Err(error.into())),
        Err(error) => Err(error),
    }
}

/// Kill the supervisor politely and insist on a clean exit.
fn terminate_supervisor(child: &mut Child) -> Result<()> {
    send_signal(child.id() as libc::pid_t, libc::SIGTERM)?;
    let status = wait_for_child_to_die(child)??;
    match status.code() {
        Some(0) => Ok(()),
        other => Err(anyhow!("supervisor exited with {other:?}")),
    }
}

#[test]
fn restart_after_kill() -> Result<()> {
    // One service that records each incarnation's pid, then sleeps.
    let pidfile = unique_filename("pids")?;
    let config = write_config(&format!(
        r#"{{"name": "web", "command": "sh",
             "args": ["-c", "echo $$ >> {}; exec sleep 30"],
             "max_restarts": 3}}"#,
        pidfile.display()
    ))?;
    let mut supervisor = warden_command()
        .arg("--config")
        .arg(&config)
        .arg("--no-cgroup")
        .spawn()?;

    wait_until_file_exists(&pidfile)?;
    let first_pid = read_pidfile(&pidfile)?;
    process_exists(first_pid)?;

    // The child must lead its own process group, so that group-wide signals
    // reach the whole subtree.
    assert_eq!(unsafe { libc::getpgid(first_pid) }, first_pid);

    // Kill the incarnation's process group, as an external actor would.
    send_signal(-first_pid, libc::SIGTERM)?;
    wait_for_process_to_die(first_pid)?;

    // A replacement shows up after the 1-second base delay.
    let second_pid = wait_until(|| match read_pid_lines(&pidfile).as_slice() {
        [_, second] => Complete(*second),
        _ => Incomplete,
    })?;
    assert_ne!(first_pid, second_pid);
    process_exists(second_pid)?;

    // Shut down and verify the replacement did not leak.
    terminate_supervisor(&mut supervisor)?;
    wait_for_process_to_die(second_pid)?;
    Ok(())
}

#[test]
fn graceful_shutdown_leaves_no_orphans() -> Result<()> {
    let pidfile = unique_filename("pid")?;
    let config = write_config(&format!(
        r#"{{"name": "web", "command": "sh",
             "args": ["-c", "echo $$ > {}; exec sleep 3600"]}}"#,
        pidfile.display()
    ))?;
    let mut supervisor = warden_command()
        .arg("--config")
        .arg(&config)
        .arg("--no-cgroup")
        .spawn()?;

    wait_until_file_exists(&pidfile)?;
    let service_pid = read_pidfile(&pidfile)?;
    process_exists(service_pid)?;

    // `exec` replaced the shell with sleep, so plain SIGTERM suffices and
    // shutdown finishes well inside the 10-second escalation window.
    let start = Instant::now();
    terminate_supervisor(&mut supervisor)?;
    assert!(start.elapsed() < Duration::from_secs(5));
    wait_for_process_to_die(service_pid)?;
    Ok(())
}

#[test]
fn stubborn_child_is_killed_at_the_deadline() -> Result<()> {
    // The shell ignores SIGTERM and keeps respawning sleeps, so only the
    // SIGKILL escalation can end it.
    let pidfile = unique_filename("pid")?;
    let config = write_config(&format!(
        r#"{{"name": "stubborn", "command": "sh",
             "args": ["-c", "echo $$ > {}; trap '' TERM; while :; do sleep 1; done"]}}"#,
        pidfile.display()
    ))?;
    let mut supervisor = warden_command()
        .arg("--config")
        .arg(&config)
        .arg("--no-cgroup")
        .spawn()?;

    wait_until_file_exists(&pidfile)?;
    let service_pid = read_pidfile(&pidfile)?;
    process_exists(service_pid)?;

    let start = Instant::now();
    terminate_supervisor(&mut supervisor)?;
    // Not before the deadline, but still a clean exit 0.
    assert!(start.elapsed() >= Duration::from_millis(9500));
    wait_for_process_to_die(service_pid)?;
    Ok(())
}

#[test]
fn restart_budget_is_exhausted() -> Result<()> {
    // Crashes instantly every time: the initial run plus two restarts
    // (after 1 s and 2 s), and then nothing.
    let runfile = unique_filename("runs")?;
    let config = write_config(&format!(
        r#"{{"name": "flaky", "command": "sh",
             "args": ["-c", "echo $$ >> {}; exit 7"],
             "max_restarts": 2}}"#,
        runfile.display()
    ))?;
    let mut supervisor = warden_command()
        .arg("--config")
        .arg(&config)
        .arg("--no-cgroup")
        .spawn()?;

    wait_until(|| match read_pid_lines(&runfile).len() {
        3 => Complete(()),
        _ => Incomplete,
    })?;

    // Give a fourth incarnation ample time to (wrongly) appear.
    std::thread::sleep(Duration::from_secs(4));
    assert_eq!(read_pid_lines(&runfile).len(), 3);

    // A supervisor whose only service failed still shuts down cleanly.
    terminate_supervisor(&mut supervisor)?;
    Ok(())
}

#[test]
fn startup_failure_aborts_and_sweeps() -> Result<()> {
    // The second service cannot launch, so startup must fail with exit 1
    // and the service that did start must be torn down again.
    let pidfile = unique_filename("pid")?;
    let config = write_config(&format!(
        r#"{{"name": "good", "command": "sh",
             "args": ["-c", "echo $$ > {}; exec sleep 3600"]}},
           {{"name": "bad", "command": "/no/such/warden-binary"}}"#,
        pidfile.display()
    ))?;
    let mut supervisor = warden_command()
        .arg("--config")
        .arg(&config)
        .arg("--no-cgroup")
        .spawn()?;

    let status = wait_for_child_to_die(&mut supervisor)??;
    assert_eq!(status.code(), Some(1));

    if let Ok(pid) = read_pidfile(&pidfile) {
        wait_for_process_to_die(pid)?;
    }
    Ok(())
}

#[test]
fn bad_configuration_exits_nonzero() -> Result<()> {
    let config = unique_filename("json")?;
    std::fs::write(&config, "{ not json")?;
    let mut supervisor = warden_command().arg("--config").arg(&config).spawn()?;
    assert_eq!(wait_for_child_to_die(&mut supervisor)??.code(), Some(1));

    // A missing file is the same kind of failure.
    let missing = unique_filename("json")?;
    let mut supervisor = warden_command().arg("--config").arg(&missing).spawn()?;
    assert_eq!(wait_for_child_to_die(&mut supervisor)??.code(), Some(1));
    Ok(())
}

#[test]
fn sigusr1_dumps_running_processes() -> Result<()> {
    let pidfile = unique_filename("pid")?;
    let outfile = unique_filename("out")?;
    let config = write_config(&format!(
        r#"{{"name": "web", "command": "sh",
             "args": ["-c", "echo $$ > {}; exec sleep 3600"]}}"#,
        pidfile.display()
    ))?;
    let mut supervisor = warden_command()
        .arg("--config")
        .arg(&config)
        .arg("--no-cgroup")
        .stdout(Stdio::from(File::create(&outfile)?))
        .spawn()?;

    wait_until_file_exists(&pidfile)?;
    let service_pid = read_pidfile(&pidfile)?;

    send_signal(supervisor.id() as libc::pid_t, libc::SIGUSR1)?;
    let output = wait_until(|| {
        let text = std::fs::read_to_string(&outfile).unwrap_or_default();
        match text.contains("fd") {
            true => Complete(text),
            false => Incomplete,
        }
    })?;

    // Pid, state letter, resident set, and one line per descriptor.
    assert!(output.contains(&format!("web: pid {service_pid} state ")));
    assert!(output.contains(" rss "));
    assert!(output.contains(" -> "));

    terminate_supervisor(&mut supervisor)?;
    Ok(())
}

#[test]
fn single_command_mode_supervises_an_ad_hoc_command() -> Result<()> {
    let pidfile = unique_filename("pid")?;
    let mut supervisor = warden_command()
        .arg("--command")
        .arg(format!("echo $$ > {}; exec sleep 3600", pidfile.display()))
        .arg("--no-cgroup")
        .spawn()?;

    wait_until_file_exists(&pidfile)?;
    let service_pid = read_pidfile(&pidfile)?;
    process_exists(service_pid)?;

    terminate_supervisor(&mut supervisor)?;
    wait_for_process_to_die(service_pid)?;
    Ok(())
}
