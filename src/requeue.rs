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

//! The `requeue` command readmits failed inodes to the work queue after the
//! operator fixed the root cause (remount, different partition selection,
//! adjusted permissions).

use anyhow::Context;
use engine::config::Config;
use engine::db;
use std::env::ArgsOs;
use std::path::PathBuf;
use std::process::exit;

/// Structure storing command line arguments.
#[derive(Default)]
struct Args {
    /// If true, print command line help.
    help: bool,
    /// Alternate configuration file.
    config_path: Option<PathBuf>,
    /// If true, also readmit sentinel-tagged permanent failures.
    permanent: bool,
    /// The medium whose failures are readmitted.
    medium: Option<String>,
}

fn parse_args(args: ArgsOs) -> Args {
    let mut res: Args = Default::default();
    let mut args = args;
    while let Some(arg) = args.next() {
        match arg.to_str() {
            Some("-h" | "--help") => res.help = true,
            Some("-p" | "--permanent") => res.permanent = true,
            Some("-c" | "--config") => {
                res.config_path = args.next().map(PathBuf::from);
                if res.config_path.is_none() {
                    engine::error("medarc requeue", "a file must follow -c");
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
    eprintln!("medarc requeue: bad usage");
    eprintln!("Try 'medarc requeue --help' for more information.");
}

/// Prints command help.
fn print_help() {
    println!();
    println!("Usage:");
    println!(" medarc requeue [options] <medium_hash>");
    println!();
    println!("Resets the medium's failed_retryable inodes back to pending so the next copy");
    println!("run picks them up. The failure history is kept.");
    println!();
    println!("Options:");
    println!(" -h, --help:\t\tprints this help");
    println!(" -c, --config FILE:\treads configuration from FILE");
    println!(" -p, --permanent:\talso readmits failed_permanent inodes");
}

fn run(args: &Args, medium: &str) -> anyhow::Result<()> {
    let config = Config::load(args.config_path.as_deref()).context("loading configuration")?;
    let conn = db::open(&config.db_path).context("opening the database")?;
    if db::get_medium(&conn, medium)?.is_none() {
        anyhow::bail!("unknown medium {medium}");
    }
    let n = db::requeue(&conn, medium, args.permanent)?;
    println!("medium {medium}: {n} inode(s) readmitted");
    Ok(())
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
    if let Err(e) = run(&args, medium) {
        engine::error("medarc requeue", format_args!("{e:#}"));
    }
}
