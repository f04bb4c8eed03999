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

//! The work claimant: reserves batches of unprocessed inodes for one worker.
//!
//! A claim is a single `UPDATE … RETURNING` over a sampled, re-randomized
//! window of the eligible set, run inside an immediate transaction. Once the
//! statement returns, every returned row carries this worker's tag and no
//! concurrent claimant will see it as claimable again until the tag is
//! cleared or goes stale.

use crate::config::Config;
use crate::db::with_busy_retry;
use crate::error::Result;
use crate::model::{ClaimedInode, FsType, PathEntry};
use rusqlite::{Connection, TransactionBehavior, named_params, params};

/// Claim attempts against transient database contention.
const CLAIM_RETRIES: usize = 5;

/// Row produced by the claim statement, before paths are attached.
struct ClaimedRow {
    ino: i64,
    size: i64,
    nlink: i64,
    mtime: Option<i64>,
    fs_type: FsType,
    errors: Vec<String>,
}

fn run_claim(
    conn: &mut Connection,
    medium_hash: &str,
    worker: &str,
    fs_filter: &str,
    batch: usize,
    sample: usize,
    stale: &str,
) -> rusqlite::Result<Vec<ClaimedRow>> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let rows = {
        // The inner LIMIT bounds the scan; the re-randomization spreads
        // concurrent workers away from clustered ino runs
        let mut stmt = tx.prepare_cached(&format!(
            "UPDATE inode SET claimed_by = :worker, claimed_at = datetime('now')
             WHERE medium_hash = :medium AND ino IN (
                 SELECT ino FROM (
                     SELECT ino FROM inode
                     WHERE medium_hash = :medium
                       AND fs_type {fs_filter} 'f'
                       AND status IN ('pending', 'failed_retryable')
                       AND (claimed_by IS NULL OR claimed_at < datetime('now', :stale))
                     LIMIT :sample
                 )
                 ORDER BY random()
                 LIMIT :batch
             )
             RETURNING ino, size, nlink, mtime, fs_type, errors"
        ))?;
        let rows = stmt.query_map(
            named_params! {
                ":worker": worker,
                ":medium": medium_hash,
                ":stale": stale,
                ":sample": sample as i64,
                ":batch": batch as i64,
            },
            |row| {
                Ok(ClaimedRow {
                    ino: row.get(0)?,
                    size: row.get(1)?,
                    nlink: row.get(2)?,
                    mtime: row.get(3)?,
                    fs_type: FsType::from_char(
                        row.get::<_, String>(4)?.chars().next().unwrap_or('?'),
                    ),
                    errors: serde_json::from_str(&row.get::<_, String>(5)?)
                        .unwrap_or_default(),
                })
            },
        )?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
    };
    tx.commit()?;
    Ok(rows)
}

/// Attaches the inode's path rows to a claimed row.
fn attach_paths(conn: &Connection, medium_hash: &str, row: ClaimedRow) -> Result<ClaimedInode> {
    let mut stmt = conn.prepare_cached(
        "SELECT path, exclude_reason FROM path
         WHERE medium_hash = ?1 AND ino = ?2 ORDER BY path",
    )?;
    let paths = stmt
        .query_map(params![medium_hash, row.ino], |r| {
            Ok(PathEntry {
                path: r.get(0)?,
                exclude_reason: r.get(1)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(ClaimedInode {
        ino: row.ino,
        size: row.size,
        nlink: row.nlink,
        mtime: row.mtime,
        fs_type: row.fs_type,
        errors: row.errors,
        paths,
    })
}

/// Claims up to `batch_size` file inodes for `worker`.
///
/// An empty result means the medium's file queue is drained (up to claims
/// currently held by other workers) and the caller should exit.
pub fn claim_batch(
    conn: &mut Connection,
    config: &Config,
    medium_hash: &str,
    worker: &str,
) -> Result<Vec<ClaimedInode>> {
    let stale = config.stale_modifier();
    let rows = with_busy_retry(CLAIM_RETRIES, || {
        run_claim(
            conn,
            medium_hash,
            worker,
            "=",
            config.batch_size,
            config.sample_size,
            &stale,
        )
    })?;
    rows.into_iter()
        .map(|row| attach_paths(conn, medium_hash, row))
        .collect()
}

/// Claims up to `batch_size` pending non-file inodes.
///
/// Directories, symlinks and specials have no bytes to fingerprint; they go
/// through a lightweight materialization pass instead of the full pipeline.
pub fn claim_nonfile_batch(
    conn: &mut Connection,
    config: &Config,
    medium_hash: &str,
    worker: &str,
) -> Result<Vec<ClaimedInode>> {
    let stale = config.stale_modifier();
    let rows = with_busy_retry(CLAIM_RETRIES, || {
        run_claim(
            conn,
            medium_hash,
            worker,
            "<>",
            config.batch_size,
            config.sample_size,
            &stale,
        )
    })?;
    rows.into_iter()
        .map(|row| attach_paths(conn, medium_hash, row))
        .collect()
}

/// Releases the still-unprocessed claims held by `worker`.
///
/// Called on soft stop so interrupted work returns to the pool immediately
/// instead of waiting out the stale-claim TTL.
pub fn release_claims(conn: &Connection, medium_hash: &str, worker: &str) -> Result<usize> {
    let n = conn.execute(
        "UPDATE inode SET claimed_by = NULL, claimed_at = NULL
         WHERE medium_hash = ?1 AND claimed_by = ?2
           AND status IN ('pending', 'failed_retryable')",
        params![medium_hash, worker],
    )?;
    Ok(n)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::db::testutil::*;
    use crate::db::{open, queue_count};
    use std::collections::HashSet;

    fn setup(n_files: i64) -> (tempfile::TempDir, Connection, Config) {
        let dir = tempfile::tempdir().unwrap();
        let conn = open(&dir.path().join("t.db")).unwrap();
        add_medium(&conn, "m1", "ok");
        for ino in 1..=n_files {
            add_inode(&conn, "m1", ino, 'f', 1);
            add_path(&conn, "m1", ino, format!("/f{ino}").as_bytes());
        }
        (dir, conn, Config::default())
    }

    #[test]
    fn claims_do_not_overlap() {
        let (dir, mut conn, mut config) = setup(30);
        config.batch_size = 10;
        let mut second = open(&dir.path().join("t.db")).unwrap();
        let a = claim_batch(&mut conn, &config, "m1", "wa").unwrap();
        let b = claim_batch(&mut second, &config, "m1", "wb").unwrap();
        let c = claim_batch(&mut conn, &config, "m1", "wa").unwrap();
        let d = claim_batch(&mut conn, &config, "m1", "wa").unwrap();
        assert_eq!(a.len(), 10);
        assert_eq!(b.len(), 10);
        assert_eq!(c.len(), 10);
        // Queue exhausted
        assert!(d.is_empty());
        let all: HashSet<i64> = a
            .iter()
            .chain(&b)
            .chain(&c)
            .map(|inode| inode.ino)
            .collect();
        assert_eq!(all.len(), 30);
        assert_eq!(queue_count(&conn, "m1").unwrap(), 0);
    }

    #[test]
    fn claims_attach_paths() {
        let (_dir, mut conn, config) = setup(2);
        add_path(&conn, "m1", 1, b"/hardlink-to-f1");
        let batch = claim_batch(&mut conn, &config, "m1", "w").unwrap();
        let first = batch.iter().find(|i| i.ino == 1).unwrap();
        assert_eq!(first.paths.len(), 2);
        let second = batch.iter().find(|i| i.ino == 2).unwrap();
        assert_eq!(second.paths.len(), 1);
    }

    #[test]
    fn nonfiles_are_not_claimable_as_files() {
        let (_dir, mut conn, config) = setup(1);
        add_inode(&conn, "m1", 100, 'd', 0);
        add_inode(&conn, "m1", 101, 'l', 0);
        let files = claim_batch(&mut conn, &config, "m1", "w").unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].ino, 1);
        let nonfiles = claim_nonfile_batch(&mut conn, &config, "m1", "w").unwrap();
        let inos: HashSet<i64> = nonfiles.iter().map(|i| i.ino).collect();
        assert_eq!(inos, HashSet::from([100, 101]));
    }

    #[test]
    fn terminal_rows_are_not_claimable() {
        let (_dir, mut conn, config) = setup(3);
        conn.execute(
            "UPDATE inode SET status = 'success', claimed_by = NULL WHERE ino = 1",
            [],
        )
        .unwrap();
        conn.execute(
            "UPDATE inode SET status = 'failed_permanent',
                    claimed_by = 'MAX_RETRIES_EXCEEDED' WHERE ino = 2",
            [],
        )
        .unwrap();
        let batch = claim_batch(&mut conn, &config, "m1", "w").unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].ino, 3);
    }

    #[test]
    fn stale_claims_are_reclaimable() {
        let (_dir, mut conn, mut config) = setup(1);
        conn.execute(
            "UPDATE inode SET claimed_by = 'dead-worker',
                    claimed_at = datetime('now', '-2 days') WHERE ino = 1",
            [],
        )
        .unwrap();
        // A fresh claim by a live worker shields the row…
        config.stale_claim_ttl_secs = 3 * 24 * 3600;
        assert!(claim_batch(&mut conn, &config, "m1", "w").unwrap().is_empty());
        // …until it outlives the TTL
        config.stale_claim_ttl_secs = 3600;
        let batch = claim_batch(&mut conn, &config, "m1", "w").unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn release_returns_claims_to_the_pool() {
        let (_dir, mut conn, config) = setup(5);
        let batch = claim_batch(&mut conn, &config, "m1", "w").unwrap();
        assert_eq!(batch.len(), 5);
        assert_eq!(queue_count(&conn, "m1").unwrap(), 0);
        assert_eq!(release_claims(&conn, "m1", "w").unwrap(), 5);
        assert_eq!(queue_count(&conn, "m1").unwrap(), 5);
    }

    #[test]
    fn failed_retryable_rows_are_eligible_again() {
        let (_dir, mut conn, config) = setup(1);
        conn.execute(
            "UPDATE inode SET status = 'failed_retryable', claimed_by = NULL,
                    errors = '[\"io_error: boom\"]' WHERE ino = 1",
            [],
        )
        .unwrap();
        let batch = claim_batch(&mut conn, &config, "m1", "w").unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].attempts(), 1);
    }
}
