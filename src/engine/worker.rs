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

//! One worker's claim-analyze-execute loop.
//!
//! Per inode the order is read → hash → store commit → archive hardlinks,
//! and per batch the database commit comes strictly last, so no row ever
//! claims a success whose filesystem state is not already durable.

use crate::Context;
use crate::archive::{Materialized, PathError};
use crate::claim;
use crate::commit::{self, Outcome};
use crate::db;
use crate::diagnostic::{DiagAction, DiagnosticService};
use crate::error::{EngineError, InodeFailure, Result, RetryDecision, decide, store_fatal};
use crate::hasher::{self, ReadError};
use crate::model::{ClaimedInode, FsType};
use rusqlite::{Connection, params};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

/// Counters aggregated over one worker's run.
#[derive(Debug, Default, Clone)]
pub struct WorkerStats {
    /// Inodes claimed.
    pub claimed: u64,
    /// File inodes fingerprinted and materialized.
    pub succeeded: u64,
    /// Inodes that failed this run (retryable or permanent).
    pub failed: u64,
    /// Inodes force-skipped by the diagnostic service.
    pub skipped: u64,
    /// Non-file inodes handled.
    pub nonfiles: u64,
    /// Content bytes read and fingerprinted.
    pub bytes_hashed: u64,
    /// New physical copies stored.
    pub new_blobs: u64,
    /// Archive hardlinks created.
    pub links_created: u64,
    /// Archive locations occupied by unrelated objects.
    pub path_collisions: u64,
}

impl WorkerStats {
    /// Folds another worker's counters into this one.
    pub fn merge(&mut self, other: &Self) {
        self.claimed += other.claimed;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.nonfiles += other.nonfiles;
        self.bytes_hashed += other.bytes_hashed;
        self.new_blobs += other.new_blobs;
        self.links_created += other.links_created;
        self.path_collisions += other.path_collisions;
    }
}

/// Runs one file-inode attempt end to end, filesystem side only.
///
/// `Ok(Err(_))` is a failure scoped to the inode; `Err(_)` means the store
/// or archive side is broken and the worker must stop.
fn try_file(
    ctx: &Context,
    medium_partial: bool,
    inode: &ClaimedInode,
    stats: &mut WorkerStats,
) -> Result<std::result::Result<Outcome, InodeFailure>> {
    let mut stage = ctx.cas.stage()?;
    let content = match hasher::read_inode(
        &ctx.mount_dir(),
        inode,
        medium_partial,
        Some(&mut stage),
    ) {
        Ok(content) => content,
        Err(ReadError::Inode(failure)) => return Ok(Err(failure)),
        Err(ReadError::Fatal(e)) => return Err(e),
    };
    stats.bytes_hashed += content.size;
    if ctx.cas.commit(stage, &content.fingerprint)? {
        stats.new_blobs += 1;
    }
    let blob = ctx.cas.blob_path(&content.fingerprint);
    let mut new_links = 0i64;
    let mut expected_links = 0i64;
    let mut path_errors = Vec::new();
    for entry in inode.live_paths() {
        expected_links += 1;
        let dest = match ctx.archive.resolve(&ctx.medium_hash, &entry.path) {
            Ok(dest) => dest,
            Err(e) => {
                path_errors.push(e.to_string());
                continue;
            }
        };
        match ctx.archive.link_file(&blob, &dest) {
            Ok(Materialized::Created) => {
                new_links += 1;
                stats.links_created += 1;
            }
            Ok(Materialized::AlreadyPresent) => {}
            Err(PathError::Collision(p)) => {
                stats.path_collisions += 1;
                path_errors.push(format!("collision at {}", p.display()));
            }
            Err(PathError::Unsafe(msg)) => path_errors.push(msg),
            Err(PathError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                // The blob vanished between commit and link; re-staging on a
                // retry is cheap
                return Ok(Err(InodeFailure::hash(format!(
                    "stored blob vanished: {e}"
                ))));
            }
            Err(PathError::Io(e)) => return Err(store_fatal(e)),
        }
    }
    Ok(Ok(Outcome::FileSuccess {
        ino: inode.ino,
        fingerprint: content.fingerprint,
        mime: content.mime.map(str::to_string),
        new_links,
        expected_links,
        path_errors,
    }))
}

/// Processes one claimed file inode, including the in-place retry and the
/// diagnostic decision.
fn process_file(
    ctx: &Context,
    medium_partial: bool,
    inode: &ClaimedInode,
    diag: &mut DiagnosticService,
    stats: &mut WorkerStats,
) -> Result<Outcome> {
    let mut retried = false;
    loop {
        let failure = match try_file(ctx, medium_partial, inode, stats)? {
            Ok(outcome) => {
                diag.mark_terminal(&ctx.medium_hash, inode.ino);
                stats.succeeded += 1;
                return Ok(outcome);
            }
            Err(failure) => failure,
        };
        let attempts = inode.attempts() + 1;
        debug!(
            medium = %ctx.medium_hash,
            ino = inode.ino,
            kind = failure.kind.as_db_str(),
            attempts,
            msg = %failure.msg,
            "inode failed"
        );
        let mut history = inode.errors.clone();
        history.push(format!("{}: {}", failure.kind.as_db_str(), failure.msg));
        match diag.record_failure(
            &ctx.medium_hash,
            inode.ino,
            failure.kind,
            &failure.msg,
            attempts,
        ) {
            DiagAction::ForceSkip(reason) => {
                stats.failed += 1;
                stats.skipped += 1;
                return Ok(Outcome::Failure {
                    ino: inode.ino,
                    kind: failure.kind,
                    history,
                    force_skip: Some(reason),
                });
            }
            DiagAction::Continue => {}
        }
        if decide(failure.kind, attempts, ctx.config.max_retries) == RetryDecision::RetryNow
            && !retried
        {
            retried = true;
            continue;
        }
        stats.failed += 1;
        return Ok(Outcome::Failure {
            ino: inode.ino,
            kind: failure.kind,
            history,
            force_skip: None,
        });
    }
}

/// Materializes one claimed non-file inode.
fn process_nonfile(ctx: &Context, inode: &ClaimedInode, stats: &mut WorkerStats) -> Result<Outcome> {
    let fail = |failure: InodeFailure| {
        let mut history = inode.errors.clone();
        history.push(format!("{}: {}", failure.kind.as_db_str(), failure.msg));
        Outcome::Failure {
            ino: inode.ino,
            kind: failure.kind,
            history,
            force_skip: None,
        }
    };
    // Symlink targets come off the mount; dirs and specials need no read
    let target = match inode.fs_type {
        FsType::Symlink => match hasher::read_link_target(&ctx.mount_dir(), inode) {
            Ok(target) => Some(target),
            Err(failure) => {
                stats.failed += 1;
                return Ok(fail(failure));
            }
        },
        _ => None,
    };
    for entry in inode.live_paths() {
        let dest = match ctx.archive.resolve(&ctx.medium_hash, &entry.path) {
            Ok(dest) => dest,
            Err(e) => {
                stats.failed += 1;
                return Ok(fail(InodeFailure::path(e.to_string())));
            }
        };
        let result = match inode.fs_type {
            FsType::Dir => ctx.archive.make_dir(&dest),
            FsType::Symlink => ctx
                .archive
                .make_symlink(target.as_deref().unwrap_or_default(), &dest),
            // Sockets, pipes and devices are not restorable content; the
            // row alone records their existence
            _ => Ok(Materialized::AlreadyPresent),
        };
        match result {
            Ok(_) => {}
            Err(PathError::Collision(p)) => {
                stats.failed += 1;
                stats.path_collisions += 1;
                return Ok(fail(InodeFailure::path(format!(
                    "collision at {}",
                    p.display()
                ))));
            }
            Err(PathError::Unsafe(msg)) => {
                stats.failed += 1;
                return Ok(fail(InodeFailure::path(msg)));
            }
            Err(PathError::Io(e)) => return Err(store_fatal(e)),
        }
    }
    stats.nonfiles += 1;
    Ok(Outcome::NonFileSuccess { ino: inode.ino })
}

/// Drains the medium's non-file inodes.
///
/// Runs before the file workers start; directories, symlinks and specials
/// have no bytes to fingerprint and only need their archive artifacts.
pub fn run_nonfile_pass(
    ctx: &Context,
    conn: &mut Connection,
    worker: &str,
    shutdown: &AtomicBool,
) -> Result<WorkerStats> {
    let mut stats = WorkerStats::default();
    while !shutdown.load(Ordering::Relaxed) {
        let batch = claim::claim_nonfile_batch(conn, &ctx.config, &ctx.medium_hash, worker)?;
        if batch.is_empty() {
            break;
        }
        stats.claimed += batch.len() as u64;
        let mut outcomes = Vec::with_capacity(batch.len());
        for inode in &batch {
            outcomes.push(process_nonfile(ctx, inode, &mut stats)?);
        }
        commit::commit_batch(conn, &ctx.config, &ctx.medium_hash, &outcomes)?;
    }
    claim::release_claims(conn, &ctx.medium_hash, worker)?;
    Ok(stats)
}

/// Runs one worker until the medium's file queue is drained or a stop is
/// requested.
pub fn run_worker(ctx: &Context, worker: &str, shutdown: &AtomicBool) -> Result<WorkerStats> {
    let mut conn = ctx.open_db()?;
    let medium = db::get_medium(&conn, &ctx.medium_hash)?
        .ok_or_else(|| EngineError::UnknownMedium(ctx.medium_hash.clone()))?;
    let medium_partial = medium.is_partial();
    let mut diag = DiagnosticService::new(ctx.config.diagnostic_threshold);
    let mut stats = WorkerStats::default();
    while !shutdown.load(Ordering::Relaxed) {
        let batch = claim::claim_batch(&mut conn, &ctx.config, &ctx.medium_hash, worker)?;
        if batch.is_empty() {
            break;
        }
        stats.claimed += batch.len() as u64;
        let mut outcomes = Vec::with_capacity(batch.len());
        for inode in &batch {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            outcomes.push(process_file(ctx, medium_partial, inode, &mut diag, &mut stats)?);
        }
        commit::commit_batch(&mut conn, &ctx.config, &ctx.medium_hash, &outcomes)?;
        info!(
            worker,
            medium = %ctx.medium_hash,
            claimed = stats.claimed,
            succeeded = stats.succeeded,
            failed = stats.failed,
            bytes = stats.bytes_hashed,
            "batch committed"
        );
    }
    // Anything claimed but not committed goes back to the pool right away
    claim::release_claims(&conn, &ctx.medium_hash, worker)?;
    diag.flush(&conn, &ctx.medium_hash);
    Ok(stats)
}

/// Scans the medium without mutating anything.
///
/// The dry run walks the eligible set with a cursor instead of claiming,
/// hashes without staging and only reports what a real run would do; the
/// database, store and archive are untouched afterwards.
pub fn run_dry_scan(ctx: &Context, conn: &Connection) -> Result<WorkerStats> {
    let medium = db::get_medium(conn, &ctx.medium_hash)?
        .ok_or_else(|| EngineError::UnknownMedium(ctx.medium_hash.clone()))?;
    let mut stats = WorkerStats::default();
    let mut cursor = i64::MIN;
    loop {
        let mut stmt = conn.prepare_cached(
            "SELECT ino, size, nlink, mtime, fs_type, errors FROM inode
             WHERE medium_hash = ?1 AND status IN ('pending', 'failed_retryable')
               AND ino > ?2
             ORDER BY ino LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(
                params![ctx.medium_hash, cursor, ctx.config.batch_size as i64],
                |row| {
                    Ok(ClaimedInode {
                        ino: row.get(0)?,
                        size: row.get(1)?,
                        nlink: row.get(2)?,
                        mtime: row.get(3)?,
                        fs_type: FsType::from_char(
                            row.get::<_, String>(4)?.chars().next().unwrap_or('?'),
                        ),
                        errors: serde_json::from_str(&row.get::<_, String>(5)?)
                            .unwrap_or_default(),
                        paths: vec![],
                    })
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        if rows.is_empty() {
            break;
        }
        for mut inode in rows {
            cursor = cursor.max(inode.ino);
            let mut pstmt = conn.prepare_cached(
                "SELECT path, exclude_reason FROM path
                 WHERE medium_hash = ?1 AND ino = ?2 ORDER BY path",
            )?;
            inode.paths = pstmt
                .query_map(params![ctx.medium_hash, inode.ino], |r| {
                    Ok(crate::model::PathEntry {
                        path: r.get(0)?,
                        exclude_reason: r.get(1)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            stats.claimed += 1;
            if !inode.fs_type.is_file() {
                stats.nonfiles += 1;
                info!(ino = inode.ino, fs_type = %inode.fs_type, "dry-run: would materialize");
                continue;
            }
            match hasher::read_inode(&ctx.mount_dir(), &inode, medium.is_partial(), None) {
                Ok(content) => {
                    stats.succeeded += 1;
                    stats.bytes_hashed += content.size;
                    let stored = ctx.cas.contains(&content.fingerprint);
                    if !stored {
                        stats.new_blobs += 1;
                    }
                    info!(
                        ino = inode.ino,
                        fingerprint = %content.fingerprint,
                        size = content.size,
                        already_stored = stored,
                        links = inode.live_paths().count(),
                        "dry-run: would commit"
                    );
                }
                Err(ReadError::Inode(failure)) => {
                    stats.failed += 1;
                    info!(
                        ino = inode.ino,
                        kind = failure.kind.as_db_str(),
                        msg = %failure.msg,
                        "dry-run: would fail"
                    );
                }
                Err(ReadError::Fatal(e)) => return Err(e),
            }
        }
    }
    Ok(stats)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Config;
    use crate::db::testutil::*;
    use std::fs;
    use std::os::unix::fs::MetadataExt;
    use std::path::Path;
    use std::sync::atomic::AtomicBool;

    const MEDIUM_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const MEDIUM_B: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    struct Fixture {
        _dir: tempfile::TempDir,
        config: Config,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let config = Config {
                workers: 1,
                batch_size: 8,
                sample_size: 64,
                cas_root: dir.path().join("by-hash"),
                archive_root: dir.path().join("archived"),
                mount_root: dir.path().join("mnt"),
                db_path: dir.path().join("medarc.db"),
                ..Default::default()
            };
            Self { _dir: dir, config }
        }

        fn context(&self, medium_hash: &str) -> Context {
            Context::new(self.config.clone(), medium_hash.to_string()).unwrap()
        }

        /// Seeds a medium with a mounted file and its queue rows.
        fn seed_file(&self, medium_hash: &str, ino: i64, rel: &str, content: &[u8]) {
            let conn = db::open(&self.config.db_path).unwrap();
            if db::get_medium(&conn, medium_hash).unwrap().is_none() {
                add_medium(&conn, medium_hash, "ok");
            }
            let mount = self.config.mount_root.join(medium_hash);
            let file = mount.join(rel);
            fs::create_dir_all(file.parent().unwrap()).unwrap();
            fs::write(&file, content).unwrap();
            add_inode(&conn, medium_hash, ino, 'f', content.len() as i64);
            add_path(&conn, medium_hash, ino, format!("/{rel}").as_bytes());
        }

        fn run(&self, medium_hash: &str) -> WorkerStats {
            let ctx = self.context(medium_hash);
            run_worker(&ctx, "w0", &AtomicBool::new(false)).unwrap()
        }

        fn inode_status(&self, medium_hash: &str, ino: i64) -> (String, Option<String>, Option<String>) {
            let conn = db::open(&self.config.db_path).unwrap();
            conn.query_row(
                "SELECT status, fingerprint, claimed_by FROM inode
                 WHERE medium_hash = ?1 AND ino = ?2",
                params![medium_hash, ino],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap()
        }
    }

    fn count_files(root: &Path) -> usize {
        let mut n = 0;
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            for ent in fs::read_dir(dir).unwrap() {
                let ent = ent.unwrap();
                if ent.file_type().unwrap().is_dir() {
                    stack.push(ent.path());
                } else {
                    n += 1;
                }
            }
        }
        n
    }

    #[test]
    fn dedups_across_media() {
        let f = Fixture::new();
        f.seed_file(MEDIUM_A, 11, "a/b/c", b"hello");
        f.seed_file(MEDIUM_B, 22, "a/b/c", b"hello");
        f.run(MEDIUM_A);
        f.run(MEDIUM_B);
        let hex = blake3::hash(b"hello").to_hex().to_string();
        let ctx = f.context(MEDIUM_A);
        let blob = ctx.cas.blob_path(&hex);
        assert_eq!(fs::read(&blob).unwrap(), b"hello");
        // One store copy plus one archive link per medium
        assert_eq!(fs::metadata(&blob).unwrap().nlink(), 3);
        // Exactly one physical file in the whole store
        assert_eq!(count_files(&f.config.cas_root), 1);
        for (m, ino) in [(MEDIUM_A, 11), (MEDIUM_B, 22)] {
            let (status, fingerprint, _) = f.inode_status(m, ino);
            assert_eq!(status, "success");
            assert_eq!(fingerprint.as_deref(), Some(hex.as_str()));
        }
        let conn = db::open(&f.config.db_path).unwrap();
        let (n, expected): (i64, i64) = conn
            .query_row(
                "SELECT n_hardlinks, expected_hardlinks FROM blobs WHERE fingerprint = ?1",
                params![hex],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!((n, expected), (2, 2));
    }

    #[test]
    fn hardlinked_paths_share_one_inode_row() {
        let f = Fixture::new();
        f.seed_file(MEDIUM_A, 11, "x", b"shared content");
        // A second recorded path to the same inode, as enumeration produces
        // for an on-medium hardlink
        let conn = db::open(&f.config.db_path).unwrap();
        let mount = f.config.mount_root.join(MEDIUM_A);
        fs::hard_link(mount.join("x"), mount.join("y")).unwrap();
        add_path(&conn, MEDIUM_A, 11, b"/y");
        drop(conn);
        f.run(MEDIUM_A);
        let hex = blake3::hash(b"shared content").to_hex().to_string();
        let ctx = f.context(MEDIUM_A);
        assert_eq!(
            fs::metadata(ctx.cas.blob_path(&hex)).unwrap().nlink(),
            3
        );
        let conn = db::open(&f.config.db_path).unwrap();
        let n: i64 = conn
            .query_row(
                "SELECT n_hardlinks FROM blobs WHERE fingerprint = ?1",
                params![hex],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(n, 2);
    }

    #[test]
    fn second_run_is_a_no_op() {
        let f = Fixture::new();
        f.seed_file(MEDIUM_A, 11, "f1", b"once");
        let first = f.run(MEDIUM_A);
        assert_eq!(first.succeeded, 1);
        let second = f.run(MEDIUM_A);
        assert_eq!(second.claimed, 0);
        assert_eq!(second.new_blobs, 0);
        assert_eq!(count_files(&f.config.cas_root), 1);
    }

    #[test]
    fn resumes_after_crash_between_store_and_db() {
        let f = Fixture::new();
        f.seed_file(MEDIUM_A, 11, "f1", b"crashed");
        let ctx = f.context(MEDIUM_A);
        // Simulate the crash window: the blob landed in the store but the
        // database still says pending under a stale claim
        let hex = blake3::hash(b"crashed").to_hex().to_string();
        let mut stage = ctx.cas.stage().unwrap();
        stage.write_all(b"crashed").unwrap();
        assert!(ctx.cas.commit(stage, &hex).unwrap());
        let conn = db::open(&f.config.db_path).unwrap();
        conn.execute(
            "UPDATE inode SET claimed_by = 'dead', claimed_at = datetime('now', '-1 day')
             WHERE medium_hash = ?1",
            params![MEDIUM_A],
        )
        .unwrap();
        drop(conn);
        let stats = f.run(MEDIUM_A);
        assert_eq!(stats.succeeded, 1);
        // No duplicate copy, and the archive link exists
        assert_eq!(stats.new_blobs, 0);
        assert_eq!(count_files(&f.config.cas_root), 1);
        assert_eq!(
            fs::metadata(ctx.cas.blob_path(&hex)).unwrap().nlink(),
            2
        );
        let (status, _, _) = f.inode_status(MEDIUM_A, 11);
        assert_eq!(status, "success");
    }

    #[test]
    fn nonfile_pass_materializes_dirs_and_symlinks() {
        let f = Fixture::new();
        let conn = db::open(&f.config.db_path).unwrap();
        add_medium(&conn, MEDIUM_A, "ok");
        let mount = f.config.mount_root.join(MEDIUM_A);
        fs::create_dir_all(mount.join("d")).unwrap();
        std::os::unix::fs::symlink("d/elsewhere", mount.join("l")).unwrap();
        add_inode(&conn, MEDIUM_A, 1, 'd', 0);
        add_path(&conn, MEDIUM_A, 1, b"/d");
        add_inode(&conn, MEDIUM_A, 2, 'l', 0);
        add_path(&conn, MEDIUM_A, 2, b"/l");
        add_inode(&conn, MEDIUM_A, 3, 's', 0);
        add_path(&conn, MEDIUM_A, 3, b"/sock");
        drop(conn);
        let ctx = f.context(MEDIUM_A);
        let mut conn = ctx.open_db().unwrap();
        let stats =
            run_nonfile_pass(&ctx, &mut conn, "w0", &AtomicBool::new(false)).unwrap();
        assert_eq!(stats.nonfiles, 3);
        let medium_dir = ctx.archive.medium_dir(MEDIUM_A);
        assert!(medium_dir.join("d").is_dir());
        assert_eq!(
            fs::read_link(medium_dir.join("l")).unwrap(),
            Path::new("d/elsewhere")
        );
        // Specials leave no artifact but their row is terminal
        assert!(!medium_dir.join("sock").exists());
        for ino in [1, 2, 3] {
            let (status, fingerprint, _) = f.inode_status(MEDIUM_A, ino);
            assert_eq!(status, "success");
            assert!(fingerprint.is_none());
        }
        // Nothing went near the content store
        assert_eq!(count_files(&f.config.cas_root.join("tmp")), 0);
    }

    #[test]
    fn excluded_paths_are_not_materialized() {
        let f = Fixture::new();
        f.seed_file(MEDIUM_A, 11, "keep", b"partly excluded");
        let conn = db::open(&f.config.db_path).unwrap();
        let mount = f.config.mount_root.join(MEDIUM_A);
        fs::hard_link(mount.join("keep"), mount.join("skipme")).unwrap();
        conn.execute(
            "INSERT INTO path (medium_hash, ino, path, exclude_reason)
             VALUES (?1, 11, X'2F736B69706D65', 'cache')",
            params![MEDIUM_A],
        )
        .unwrap();
        drop(conn);
        f.run(MEDIUM_A);
        let hex = blake3::hash(b"partly excluded").to_hex().to_string();
        let ctx = f.context(MEDIUM_A);
        let medium_dir = ctx.archive.medium_dir(MEDIUM_A);
        assert!(medium_dir.join("keep").exists());
        assert!(!medium_dir.join("skipme").exists());
        let conn = db::open(&f.config.db_path).unwrap();
        let (n, expected): (i64, i64) = conn
            .query_row(
                "SELECT n_hardlinks, expected_hardlinks FROM blobs WHERE fingerprint = ?1",
                params![hex],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!((n, expected), (1, 1));
        // The excluded path keeps a NULL fingerprint
        let excluded_fp: Option<String> = conn
            .query_row(
                "SELECT fingerprint FROM path
                 WHERE medium_hash = ?1 AND exclude_reason IS NOT NULL",
                params![MEDIUM_A],
                |row| row.get(0),
            )
            .unwrap();
        assert!(excluded_fp.is_none());
    }

    #[test]
    fn beyond_eof_is_diagnosed_and_skipped() {
        let f = Fixture::new();
        let mut config = f.config.clone();
        config.diagnostic_threshold = 3;
        let conn = db::open(&config.db_path).unwrap();
        add_medium(&conn, MEDIUM_A, "partial");
        let mount = config.mount_root.join(MEDIUM_A);
        fs::create_dir_all(&mount).unwrap();
        // The image only delivers 8 of the 10 recorded bytes
        fs::write(mount.join("truncated"), b"8 bytes!").unwrap();
        add_inode(&conn, MEDIUM_A, 11, 'f', 10);
        add_path(&conn, MEDIUM_A, 11, b"/truncated");
        drop(conn);
        let ctx = Context::new(config, MEDIUM_A.to_string()).unwrap();
        let stats = run_worker(&ctx, "w0", &AtomicBool::new(false)).unwrap();
        assert_eq!(stats.skipped, 1);
        let (status, fingerprint, claimed_by) = f.inode_status(MEDIUM_A, 11);
        assert_eq!(status, "failed_permanent");
        assert!(fingerprint.is_none());
        assert_eq!(claimed_by.as_deref(), Some("DIAGNOSTIC_SKIP:BEYOND_EOF"));
        let conn = db::open(&f.config.db_path).unwrap();
        let error_type: String = conn
            .query_row(
                "SELECT error_type FROM inode WHERE medium_hash = ?1 AND ino = 11",
                params![MEDIUM_A],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(error_type, "io_error");
        // No store entry and no archive link were produced
        assert_eq!(count_files(&f.config.cas_root), 0);
        assert!(!ctx.archive.medium_dir(MEDIUM_A).join("truncated").exists());
        // The skip is visible in the medium's problem notes
        let m = db::get_medium(&conn, MEDIUM_A).unwrap().unwrap();
        assert_eq!(m.problems["auto_skips"], 1);
    }

    #[test]
    fn concurrent_workers_dedup_identical_content() {
        let f = Fixture::new();
        let conn = db::open(&f.config.db_path).unwrap();
        add_medium(&conn, MEDIUM_A, "ok");
        let mount = f.config.mount_root.join(MEDIUM_A);
        fs::create_dir_all(&mount).unwrap();
        let n = 40;
        for ino in 1..=n {
            fs::write(mount.join(format!("f{ino}")), b"X").unwrap();
            add_inode(&conn, MEDIUM_A, ino, 'f', 1);
            add_path(&conn, MEDIUM_A, ino, format!("/f{ino}").as_bytes());
        }
        drop(conn);
        let shutdown = AtomicBool::new(false);
        let merged = std::thread::scope(|s| {
            let handles: Vec<_> = (0..2)
                .map(|i| {
                    let ctx = f.context(MEDIUM_A);
                    let shutdown = &shutdown;
                    s.spawn(move || run_worker(&ctx, &format!("w{i}"), shutdown).unwrap())
                })
                .collect();
            let mut merged = WorkerStats::default();
            for h in handles {
                merged.merge(&h.join().unwrap());
            }
            merged
        });
        assert_eq!(merged.claimed, n as u64);
        assert_eq!(merged.succeeded, n as u64);
        // Both workers raced on the same content; one physical copy won
        assert_eq!(merged.new_blobs, 1);
        assert_eq!(count_files(&f.config.cas_root), 1);
        let hex = blake3::hash(b"X").to_hex().to_string();
        let ctx = f.context(MEDIUM_A);
        assert_eq!(
            fs::metadata(ctx.cas.blob_path(&hex)).unwrap().nlink() as i64,
            n + 1
        );
        let conn = db::open(&f.config.db_path).unwrap();
        let links: i64 = conn
            .query_row(
                "SELECT n_hardlinks FROM blobs WHERE fingerprint = ?1",
                params![hex],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(links, n);
    }

    #[test]
    fn dry_run_mutates_nothing() {
        let f = Fixture::new();
        f.seed_file(MEDIUM_A, 11, "f1", b"untouched");
        f.seed_file(MEDIUM_A, 12, "f2", b"also untouched");
        let ctx = f.context(MEDIUM_A);
        let conn = ctx.open_db().unwrap();
        let stats = run_dry_scan(&ctx, &conn).unwrap();
        assert_eq!(stats.claimed, 2);
        assert_eq!(stats.succeeded, 2);
        assert_eq!(stats.new_blobs, 2);
        // Statuses untouched, store and archive empty
        for ino in [11, 12] {
            let (status, fingerprint, claimed_by) = f.inode_status(MEDIUM_A, ino);
            assert_eq!(status, "pending");
            assert!(fingerprint.is_none());
            assert!(claimed_by.is_none());
        }
        assert_eq!(count_files(&f.config.cas_root), 0);
        assert!(!ctx.archive.medium_dir(MEDIUM_A).exists());
        let blobs: i64 = conn
            .query_row("SELECT count(*) FROM blobs", [], |row| row.get(0))
            .unwrap();
        assert_eq!(blobs, 0);
    }
}
