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

//! The worker supervisor: preflight checks, the worker pool and shutdown.
//!
//! Workers share nothing in process; the database and the filesystems are
//! the only coordination points, so a worker is just a thread with its own
//! connection. The first stop signal asks workers to finish their current
//! batch; a second one terminates the process outright.

use crate::error::{EngineError, Result};
use crate::worker::{self, WorkerStats};
use crate::{Context, config::Config, db};
use std::mem::MaybeUninit;
use std::ptr::null_mut;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Free-space floor under which the run starts with a warning.
const FREE_SPACE_FLOOR: u64 = 64 << 20;

/// Soft-stop flag polled by the workers between inodes and batches.
static STOP: AtomicBool = AtomicBool::new(false);

/// Stop signals received so far.
static STOP_SIGNALS: AtomicUsize = AtomicUsize::new(0);

extern "C" fn on_stop_signal(_sig: libc::c_int) {
    if STOP_SIGNALS.fetch_add(1, Ordering::SeqCst) >= 1 {
        // Hard stop: the grace period is over
        unsafe {
            libc::_exit(130);
        }
    }
    STOP.store(true, Ordering::SeqCst);
}

/// Installs the SIGINT/SIGTERM soft-stop handlers.
fn install_signal_handlers() {
    unsafe {
        let mut sa: libc::sigaction = MaybeUninit::zeroed().assume_init();
        sa.sa_sigaction = on_stop_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaction(libc::SIGINT, &sa, null_mut());
        libc::sigaction(libc::SIGTERM, &sa, null_mut());
    }
}

/// How a copy run ended.
#[derive(Debug)]
pub enum RunOutcome {
    /// The run executed; the medium may or may not be fully drained.
    Completed {
        /// Aggregated counters of all workers.
        stats: WorkerStats,
        /// Workers that exited with a fatal error.
        workers_failed: usize,
        /// Every inode reached a terminal state and `copy_done` was set.
        drained: bool,
    },
    /// The medium was already marked complete; nothing ran.
    NothingToDo,
}

/// Runs the copy engine over one medium.
pub fn run_copy(config: Config, medium_hash: &str) -> Result<RunOutcome> {
    let ctx = Context::new(config, medium_hash.to_string())?;
    let mut conn = ctx.open_db()?;
    let medium = db::get_medium(&conn, medium_hash)?
        .ok_or_else(|| EngineError::UnknownMedium(medium_hash.to_string()))?;
    if medium.copy_done.is_some() {
        info!(medium = medium_hash, "copy already done, nothing to do");
        return Ok(RunOutcome::NothingToDo);
    }
    if medium.enum_done.is_none() {
        warn!(
            medium = medium_hash,
            "enumeration is not marked done; the queue may still be filling"
        );
    }
    let mount = ctx.mount_dir();
    if !mount.is_dir() {
        return Err(EngineError::MountMissing(mount));
    }
    if ctx.config.dry_run {
        let stats = worker::run_dry_scan(&ctx, &conn)?;
        info!(
            medium = medium_hash,
            scanned = stats.claimed,
            hashable = stats.succeeded,
            would_store = stats.new_blobs,
            "dry run complete"
        );
        return Ok(RunOutcome::Completed {
            stats,
            workers_failed: 0,
            drained: false,
        });
    }
    install_signal_handlers();
    let swept = ctx.cas.sweep_tmp()?;
    if swept > 0 {
        info!(swept, "removed stale staging files from an earlier run");
    }
    let free = ctx.cas.free_space()?;
    if free < FREE_SPACE_FLOOR {
        warn!(free, "content store is low on space");
    }
    // Non-files first: cheap, single-threaded, and it puts the directory
    // skeleton in place before the file links land
    let mut stats = worker::run_nonfile_pass(&ctx, &mut conn, "nonfile-pass", &STOP)?;
    let workers_failed = AtomicUsize::new(0);
    let pooled = thread::scope(|s| {
        let handles: Vec<_> = (0..ctx.config.workers)
            .map(|i| {
                let tag = worker_tag(i);
                let ctx = &ctx;
                let workers_failed = &workers_failed;
                s.spawn(move || match worker::run_worker(ctx, &tag, &STOP) {
                    Ok(stats) => stats,
                    Err(e) => {
                        error!(worker = %tag, error = %e, "worker failed");
                        workers_failed.fetch_add(1, Ordering::SeqCst);
                        WorkerStats::default()
                    }
                })
            })
            .collect();
        let mut pooled = WorkerStats::default();
        for handle in handles {
            match handle.join() {
                Ok(s) => pooled.merge(&s),
                Err(_) => {
                    workers_failed.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
        pooled
    });
    stats.merge(&pooled);
    let workers_failed = workers_failed.load(Ordering::SeqCst);
    let mut drained = false;
    if workers_failed == 0 && !STOP.load(Ordering::SeqCst) {
        // Unrecoverable inodes do not block completion: the medium is
        // drained once nothing claimable is left
        if db::claimable_remaining(&conn, medium_hash)? == 0 {
            db::set_copy_done(&conn, medium_hash)?;
            drained = true;
            info!(medium = medium_hash, "medium drained, copy done");
        } else {
            warn!(
                medium = medium_hash,
                remaining = db::claimable_remaining(&conn, medium_hash)?,
                "run ended with retryable inodes left in the queue"
            );
        }
    }
    info!(
        medium = medium_hash,
        claimed = stats.claimed,
        succeeded = stats.succeeded,
        nonfiles = stats.nonfiles,
        failed = stats.failed,
        skipped = stats.skipped,
        new_blobs = stats.new_blobs,
        links = stats.links_created,
        bytes = stats.bytes_hashed,
        workers_failed,
        "run finished"
    );
    Ok(RunOutcome::Completed {
        stats,
        workers_failed,
        drained,
    })
}

/// Builds a claim tag unique to one worker of one engine invocation.
fn worker_tag(index: usize) -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("w{}-{index}-{}", std::process::id(), &uuid[..8])
}
