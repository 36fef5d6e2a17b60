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

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::process::exit;
use tracing::{event, Level};

use warden::cgroup::CgroupBase;
use warden::{config, Supervisor};

#[derive(Parser, Debug)]
#[clap(version, about)]
struct Args {
    /// JSON file describing the services to supervise
    #[clap(long, conflicts_with = "command")]
    config: Option<PathBuf>,

    /// A single shell command to supervise instead of a config file
    #[clap(long)]
    command: Option<String>,

    /// Run children without cgroup limits
    #[clap(long)]
    no_cgroup: bool,
}

fn main() {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();
    let args = Args::parse();
    if let Err(error) = run(args) {
        event!(Level::ERROR, "{error:#}");
        exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let table = match (&args.config, &args.command) {
        (Some(path), _) => config::load(path)?,
        (None, Some(command)) => config::single_command(command)?,
        (None, None) => {
            event!(Level::INFO, "no configuration given, supervising the demo services");
            config::demo()?
        }
    };

    let cgroups = if args.no_cgroup {
        None
    } else {
        match CgroupBase::bootstrap("warden") {
            Ok(base) => Some(base),
            Err(error) => {
                event!(Level::WARN, "running without resource limits ({error:#})");
                None
            }
        }
    };

    Supervisor::new(table, cgroups)?.run()
}
