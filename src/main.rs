//! Main of the `medarc` media archiver.

mod copy;
mod requeue;
mod stats;

use engine::error;
use std::env;
use std::process::exit;
use tracing_subscriber::EnvFilter;

/// Prints the command line usage.
fn print_usage() {
    eprintln!("Usage:");
    eprintln!(" medarc copy [options] <medium_hash>");
    eprintln!(" medarc requeue [options] <medium_hash>");
    eprintln!(" medarc stats [options] [medium_hash]");
    eprintln!();
    eprintln!("Commands:");
    eprintln!(" copy:\t\truns the copy/dedup engine over one medium");
    eprintln!(" requeue:\treadmits failed inodes to the work queue");
    eprintln!(" stats:\t\tprints work queue counters");
    eprintln!();
    eprintln!("See `medarc <command> --help` for command options.");
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let mut args = env::args_os();
    args.next();
    let Some(cmd) = args.next().and_then(|s| s.into_string().ok()) else {
        print_usage();
        exit(1);
    };
    match cmd.as_str() {
        "copy" => copy::main(args),
        "requeue" => requeue::main(args),
        "stats" => stats::main(args),
        "-h" | "--help" => print_usage(),
        _ => error("medarc", format_args!("unknown command `{cmd}`")),
    }
}
