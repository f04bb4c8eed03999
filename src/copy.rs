/*
 * Copyright 2025 Luc Lenôtre
 *
 * This file is part of medarc.
 *
 * medarc is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * medarc is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * medarc. If not, see <https://www.gnu.org/licenses/>.
 */

//! The `copy` command runs the copy/dedup engine over one medium.

use anyhow::Context;
use engine::config::Config;
use engine::supervisor::{RunOutcome, run_copy};
use std::env::ArgsOs;
use std::path::PathBuf;
use std::process::exit;

/// Exit code when the medium is already marked complete.
const EXIT_NOTHING_TO_DO: i32 = 2;

/// Structure storing command line arguments.
#[derive(Default)]
struct Args {
    /// If true, print command line help.
    help: bool,
    /// Alternate configuration file.
    config_path: Option<PathBuf>,
    /// Override of the worker count.
    workers: Option<usize>,
    /// Override of the claim batch size.
    batch_size: Option<usize>,
    /// If true, scan and report without mutating anything.
    dry_run: bool,
    /// The medium to drain.
    medium: Option<String>,
}

fn parse_args(args: ArgsOs) -> Args {
    let mut res: Args = Default::default();
    let mut args = args;
    while let Some(arg) = args.next() {
        match arg.to_str() {
            Some("-h" | "--help") => res.help = true,
            Some("-n" | "--dry-run") => res.dry_run = true,
            Some("-c" | "--config") => {
                res.config_path = args.next().map(PathBuf::from);
                if res.config_path.is_none() {
                    engine::error("medarc copy", "a file must follow -c");
                }
            }
            Some("-w" | "--workers") => {
                res.workers = args
                    .next()
                    .and_then(|s| s.to_str().and_then(|s| s.parse().ok()));
                if res.workers.is_none() {
                    engine::error("medarc copy", "a worker count must follow -w");
                }
            }
            Some("-b" | "--batch-size") => {
                res.batch_size = args
                    .next()
                    .and_then(|s| s.to_str().and_then(|s| s.parse().ok()));
                if res.batch_size.is_none() {
                    engine::error("medarc copy", "a batch size must follow -b");
                }
            }
            _ => match (&res.medium, arg.into_string()) {
                (None, Ok(medium)) => res.medium = Some(medium),
                _ => {
                    print_usage();
                    exit(1);
                }
            },
        }
    }
    res
}

/// Prints command usage.
fn print_usage() {
    eprintln!("medarc copy: bad usage");
    eprintln!("Try 'medarc copy --help' for more information.");
}

/// Prints command help.
fn print_help() {
    println!();
    println!("Usage:");
    println!(" medarc copy [options] <medium_hash>");
    println!();
    println!("Drains the medium's work queue: fingerprints every file, stores each unique");
    println!("content once under the by-hash tree and hardlinks it back at every original");
    println!("path under the archive tree.");
    println!();
    println!("Options:");
    println!(" -h, --help:\t\tprints this help");
    println!(" -c, --config FILE:\treads configuration from FILE");
    println!(" -w, --workers N:\toverrides the number of parallel workers");
    println!(" -b, --batch-size N:\toverrides the number of inodes per claim");
    println!(" -n, --dry-run:\t\tscans and reports without mutating anything");
}

fn run(args: &Args, medium: &str) -> anyhow::Result<i32> {
    let mut config =
        Config::load(args.config_path.as_deref()).context("loading configuration")?;
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    if args.dry_run {
        config.dry_run = true;
    }
    config.check()?;
    match run_copy(config, medium).context("running the copy engine")? {
        RunOutcome::NothingToDo => {
            println!("medium {medium}: already marked complete");
            Ok(EXIT_NOTHING_TO_DO)
        }
        RunOutcome::Completed {
            stats,
            workers_failed,
            drained,
        } => {
            println!(
                "medium {medium}: {} claimed, {} files copied, {} non-files, {} failed, {} skipped",
                stats.claimed, stats.succeeded, stats.nonfiles, stats.failed, stats.skipped
            );
            println!(
                "store: {} new blobs, {} hardlinks, {} bytes hashed",
                stats.new_blobs, stats.links_created, stats.bytes_hashed
            );
            if workers_failed > 0 {
                eprintln!("medarc copy: {workers_failed} worker(s) failed");
                return Ok(1);
            }
            if drained {
                println!("medium {medium}: copy done");
            }
            Ok(0)
        }
    }
}

pub fn main(args: ArgsOs) {
    let args = parse_args(args);
    if args.help {
        print_help();
        exit(0);
    }
    let Some(medium) = &args.medium else {
        print_usage();
        exit(1);
    };
    match run(&args, medium) {
        Ok(code) => exit(code),
        Err(e) => engine::error("medarc copy", format_args!("{e:#}")),
    }
}
