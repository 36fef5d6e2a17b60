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

//! Decoding the service file into an [`EntryTable`].
//!
//! The file is a JSON document:
//!
//! ```json
//! {
//!   "services": [
//!     { "name": "web", "command": "sh", "args": ["-c", "exec nginx"],
//!       "max_restarts": 5, "memory_limit_mb": 64, "cpu_percent": 50,
//!       "pids_limit": 16 }
//!   ]
//! }
//! ```
//!
//! A missing limit means no limit.  `max_restarts` of 0 (or absent) selects
//! the default budget of 3, matching the historical behavior scripts depend
//! on.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::entry::{EntryTable, SupervisedEntry};

#[derive(Debug, Deserialize)]
pub struct Config {
    pub services: Vec<ServiceConfig>,
}

#[derive(Debug, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// 0 means the default budget.
    #[serde(default)]
    pub max_restarts: u32,
    pub memory_limit_mb: Option<u64>,
    pub cpu_percent: Option<u64>,
    pub pids_limit: Option<u64>,
}

/// Reads and decodes `path`, then builds the validated table.
pub fn load(path: &Path) -> Result<EntryTable> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("{}: could not read configuration", path.display()))?;
    let config: Config = serde_json::from_str(&text)
        .with_context(|| format!("{}: malformed configuration", path.display()))?;
    build_table(config)
}

/// Turns decoded configuration into supervised entries.  Names must be
/// non-empty and unique; commands must be non-empty.
pub fn build_table(config: Config) -> Result<EntryTable> {
    let mut entries = Vec::with_capacity(config.services.len());
    for service in config.services {
        let ServiceConfig {
            name,
            command,
            args,
            max_restarts,
            memory_limit_mb,
            cpu_percent,
            pids_limit,
        } = service;
        if command.is_empty() {
            bail!("service {name:?} has an empty command");
        }
        let mut entry = SupervisedEntry::new(name, command, args);
        if max_restarts > 0 {
            entry.max_restarts = max_restarts;
        }
        entry.memory_limit_bytes = memory_limit_mb.map(|mb| mb * 1024 * 1024);
        entry.cpu_quota_percent = cpu_percent;
        entry.pids_limit = pids_limit;
        entries.push(entry);
    }
    EntryTable::new(entries)
}

/// A table holding one ad-hoc shell command, for `--command`.
pub fn single_command(command: &str) -> Result<EntryTable> {
    EntryTable::new(vec![SupervisedEntry::new(
        "cmd",
        "sh",
        vec!["-c".to_string(), command.to_string()],
    )])
}

/// The built-in pair of entries used when no configuration is given.
pub fn demo() -> Result<EntryTable> {
    let ticker = SupervisedEntry::new(
        "ticker",
        "sh",
        vec!["-c".to_string(), "while :; do date; sleep 5; done".to_string()],
    );
    let mut sleeper = SupervisedEntry::new(
        "sleeper",
        "sh",
        vec!["-c".to_string(), "exec sleep 300".to_string()],
    );
    sleeper.memory_limit_bytes = Some(64 * 1024 * 1024);
    EntryTable::new(vec![ticker, sleeper])
}
