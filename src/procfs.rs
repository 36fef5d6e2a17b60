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

//! Read-only introspection over `/proc/<pid>`.
//!
//! [`read_process_info`] is a pure function of the kernel's current view of
//! one process: the parsed `status` record, the open file descriptors with
//! their symlink targets, and the memory map.  It fails only when the pid
//! directory itself is gone; a sub-read that races the process's exit
//! degrades to an empty list instead of failing the whole call.

use anyhow::{bail, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Snapshot of one process, assembled from `status`, `fd/`, and `maps`.
#[derive(Debug, Default)]
pub struct ProcessInfo {
    pub pid: libc::pid_t,
    /// Executable name from the `Name:` field.
    pub name: String,
    /// State letter: R, S, D, Z, T, or X.
    pub state: char,
    pub parent_pid: libc::pid_t,
    pub threads: u64,
    /// Resident set size in kilobytes.  0 for kernel threads and zombies,
    /// which have no `VmRSS` field.
    pub vm_rss_kb: u64,
    /// Virtual size in kilobytes.
    pub vm_size_kb: u64,
    pub fds: Vec<FdEntry>,
    pub maps: Vec<MemoryMapping>,
}

/// One open descriptor: the number and the symlink target verbatim, which
/// is a path, `socket:[inode]`, `pipe:[inode]`, or an anon-inode label.
#[derive(Debug, PartialEq, Eq)]
pub struct FdEntry {
    pub fd: i32,
    pub target: String,
}

/// One line of the memory map.  Anonymous mappings keep an empty pathname.
#[derive(Debug, PartialEq, Eq)]
pub struct MemoryMapping {
    pub start: u64,
    pub end: u64,
    pub perms: String,
    pub pathname: String,
}

/// Reads the kernel's view of `pid`.
pub fn read_process_info(pid: libc::pid_t) -> Result<ProcessInfo> {
    let proc_dir = PathBuf::from(format!("/proc/{pid}"));
    if !proc_dir.exists() {
        bail!("no such process: {pid}");
    }
    let mut info = parse_status(&fs::read_to_string(proc_dir.join("status")).unwrap_or_default());
    info.pid = pid;
    info.fds = read_fd_table(&proc_dir);
    info.maps = match fs::read_to_string(proc_dir.join("maps")) {
        Ok(text) => parse_maps(&text),
        Err(_) => Vec::new(),
    };
    Ok(info)
}

/// Parses the key/value `status` record.  Unknown keys are skipped, and a
/// malformed numeric field reads as zero.
fn parse_status(text: &str) -> ProcessInfo {
    let mut info = ProcessInfo {
        state: '?',
        ..Default::default()
    };
    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key {
            "Name" => info.name = value.to_string(),
            "State" => info.state = value.chars().next().unwrap_or('?'),
            "PPid" => info.parent_pid = number(value) as libc::pid_t,
            "Threads" => info.threads = number(value),
            "VmRSS" => info.vm_rss_kb = number(value),
            "VmSize" => info.vm_size_kb = number(value),
            _ => (),
        }
    }
    info
}

/// First whitespace-separated field as a number; 0 on anything malformed.
fn number(value: &str) -> u64 {
    value
        .split_whitespace()
        .next()
        .and_then(|field| field.parse().ok())
        .unwrap_or(0)
}

/// Resolves every entry of `fd/`.  Descriptors that close between the
/// directory listing and the link read are simply skipped.
fn read_fd_table(proc_dir: &Path) -> Vec<FdEntry> {
    let dirents = match fs::read_dir(proc_dir.join("fd")) {
        Ok(dirents) => dirents,
        Err(_) => return Vec::new(),
    };
    let mut fds = Vec::new();
    for dirent in dirents.flatten() {
        let Ok(fd) = dirent.file_name().to_string_lossy().parse() else {
            continue;
        };
        let Ok(target) = fs::read_link(dirent.path()) else {
            continue;
        };
        fds.push(FdEntry {
            fd,
            target: target.to_string_lossy().into_owned(),
        });
    }
    fds.sort_by_key(|entry| entry.fd);
    fds
}

fn parse_maps(text: &str) -> Vec<MemoryMapping> {
    text.lines().filter_map(parse_maps_line).collect()
}

/// `start-end perms offset dev inode [pathname]`.  The first five fields are
/// single-space separated; the pathname, when present, follows alignment
/// padding and may itself contain spaces.
fn parse_maps_line(line: &str) -> Option<MemoryMapping> {
    let mut fields = line.splitn(6, ' ');
    let range = fields.next()?;
    let perms = fields.next()?.to_string();
    let _offset = fields.next()?;
    let _device = fields.next()?;
    let _inode = fields.next()?;
    let pathname = fields.next().unwrap_or("").trim_start().to_string();

    let (start, end) = range.split_once('-')?;
    Some(MemoryMapping {
        start: u64::from_str_radix(start, 16).ok()?,
        end: u64::from_str_radix(end, 16).ok()?,
        perms,
        pathname,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATUS: &str = "\
Name:\tnginx
Umask:\t0022
State:\tS (sleeping)
Tgid:\t4242
Pid:\t4242
PPid:\t1
TracerPid:\t0
VmPeak:\t  151444 kB
VmSize:\t  150996 kB
VmRSS:\t    5112 kB
Threads:\t3
SigQ:\t0/62432
";

    #[test]
    fn status_extracts_the_tracked_fields() {
        let info = parse_status(STATUS);
        assert_eq!(info.name, "nginx");
        assert_eq!(info.state, 'S');
        assert_eq!(info.parent_pid, 1);
        assert_eq!(info.threads, 3);
        assert_eq!(info.vm_rss_kb, 5112);
        assert_eq!(info.vm_size_kb, 150996);
    }

    #[test]
    fn status_tolerates_junk() {
        let info = parse_status("Name:\tx\nVmRSS:\tgarbage kB\nnot a line\nState:\n");
        assert_eq!(info.name, "x");
        assert_eq!(info.vm_rss_kb, 0);
        assert_eq!(info.state, '?');
    }

    #[test]
    fn maps_lines_parse() {
        let mapping = parse_maps_line(
            "7f2c4a600000-7f2c4a622000 r-xp 00000000 08:01 1048601                    /usr/lib/libc.so.6",
        )
        .unwrap();
        assert_eq!(mapping.start, 0x7f2c4a600000);
        assert_eq!(mapping.end, 0x7f2c4a622000);
        assert_eq!(mapping.perms, "r-xp");
        assert_eq!(mapping.pathname, "/usr/lib/libc.so.6");

        // Anonymous mappings have no pathname at all.
        let anonymous =
            parse_maps_line("7ffd1c9e2000-7ffd1ca03000 rw-p 00000000 00:00 0").unwrap();
        assert_eq!(anonymous.pathname, "");

        assert!(parse_maps_line("").is_none());
        assert!(parse_maps_line("junk").is_none());
    }

    #[test]
    fn own_process_is_readable() {
        let info = read_process_info(std::process::id() as libc::pid_t).unwrap();
        assert_eq!(info.pid, std::process::id() as libc::pid_t);
        assert!(!info.name.is_empty());
        assert!("RSD".contains(info.state));
        assert!(info.parent_pid > 0);
        assert!(info.threads >= 1);
        assert!(info.vm_rss_kb > 0);
        // At least the standard descriptors are open.
        assert!(!info.fds.is_empty());
        assert!(!info.maps.is_empty());
    }

    #[test]
    fn missing_process_is_an_error() {
        assert!(read_process_info(libc::pid_t::MAX).is_err());
    }

    // Back-to-back reads of the same process may disagree on transients
    // (state letter, resident set) but never on identity.
    #[test]
    fn repeated_reads_agree_on_identity() {
        let pid = std::process::id() as libc::pid_t;
        let first = read_process_info(pid).unwrap();
        let second = read_process_info(pid).unwrap();
        assert_eq!(first.pid, second.pid);
        assert_eq!(first.name, second.name);
        assert_eq!(first.parent_pid, second.parent_pid);
    }
}
