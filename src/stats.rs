//! The `stats` command prints work queue counters.

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
    /// If true, rebuild the counters from a full scan first.
    recompute: bool,
    /// Restrict the output to one medium.
    medium: Option<String>,
}

fn parse_args(args: ArgsOs) -> Args {
    let mut res: Args = Default::default();
    let mut args = args;
    while let Some(arg) = args.next() {
        match arg.to_str() {
            Some("-h" | "--help") => res.help = true,
            Some("-r" | "--recompute") => res.recompute = true,
            Some("-c" | "--config") => {
                res.config_path = args.next().map(PathBuf::from);
                if res.config_path.is_none() {
                    engine::error("medarc stats", "a file must follow -c");
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
    eprintln!("medarc stats: bad usage");
    eprintln!("Try 'medarc stats --help' for more information.");
}

/// Prints command help.
fn print_help() {
    println!();
    println!("Usage:");
    println!(" medarc stats [options] [medium_hash]");
    println!();
    println!("Prints the unclaimed-work counter of every medium, or the per-status inode");
    println!("breakdown of one medium. The counters are maintained by triggers and are");
    println!("monitoring hints; --recompute rebuilds them from a full scan.");
    println!();
    println!("Options:");
    println!(" -h, --help:\t\tprints this help");
    println!(" -c, --config FILE:\treads configuration from FILE");
    println!(" -r, --recompute:\trebuilds the counters by scan before printing");
}

fn run(args: &Args) -> anyhow::Result<()> {
    let config = Config::load(args.config_path.as_deref()).context("loading configuration")?;
    let mut conn = db::open(&config.db_path).context("opening the database")?;
    if args.recompute {
        db::recompute_queue_stats(&mut conn)?;
    }
    match &args.medium {
        Some(medium) => {
            if db::get_medium(&conn, medium)?.is_none() {
                anyhow::bail!("unknown medium {medium}");
            }
            println!("STATUS\tCOUNT");
            for (status, count) in db::status_breakdown(&conn, medium)? {
                println!("{status}\t{count}");
            }
            println!();
            println!("unclaimed: {}", db::queue_count(&conn, medium)?);
        }
        None => {
            println!("MEDIUM\tUNCLAIMED");
            for (medium, unclaimed) in db::queue_counts(&conn)? {
                println!("{medium}\t{unclaimed}");
            }
        }
    }
    Ok(())
}

pub fn main(args: ArgsOs) {
    let args = parse_args(args);
    if args.help {
        print_help();
        exit(0);
    }
    if let Err(e) = run(&args) {
        engine::error("medarc stats", format_args!("{e:#}"));
    }
}
