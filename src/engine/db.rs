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

//! Database layer: schema, connection setup and row accessors.
//!
//! The schema is forward-only SQL executed at open time; every statement is
//! idempotent. All composite keys lead with `medium_hash` so each medium's
//! rows form one contiguous key range, and the claim path only ever touches
//! one such range.

use crate::error::Result;
use crate::model::Medium;
use rusqlite::{Connection, OptionalExtension, params};
use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;

/// Statements a fresh or already-initialized database accepts.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS medium (
    medium_hash TEXT PRIMARY KEY,
    medium_human TEXT NOT NULL DEFAULT '',
    added_at TEXT NOT NULL DEFAULT (datetime('now')),
    health TEXT NOT NULL DEFAULT 'unknown',
    image_path TEXT,
    enum_done TEXT,
    copy_done TEXT,
    problems TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS inode (
    medium_hash TEXT NOT NULL REFERENCES medium(medium_hash) ON DELETE CASCADE,
    ino INTEGER NOT NULL,
    nlink INTEGER NOT NULL DEFAULT 1,
    size INTEGER NOT NULL DEFAULT 0,
    mtime INTEGER,
    fingerprint TEXT,
    fs_type TEXT NOT NULL CHECK (fs_type IN ('f','d','l','s','p','b','c','?')),
    mime_type TEXT,
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending','success','failed_retryable','failed_permanent')),
    error_type TEXT
        CHECK (error_type IS NULL OR error_type IN
            ('path_error','io_error','hash_error','permission_error','unknown')),
    errors TEXT NOT NULL DEFAULT '[]',
    claimed_by TEXT,
    claimed_at TEXT,
    processed_at TEXT,
    PRIMARY KEY (medium_hash, ino)
);

CREATE INDEX IF NOT EXISTS inode_claimable ON inode (medium_hash, ino)
    WHERE (status = 'pending' OR status = 'failed_retryable') AND claimed_by IS NULL;

CREATE TABLE IF NOT EXISTS path (
    medium_hash TEXT NOT NULL,
    ino INTEGER NOT NULL,
    path BLOB NOT NULL,
    exclude_reason TEXT,
    fingerprint TEXT,
    PRIMARY KEY (medium_hash, path),
    FOREIGN KEY (medium_hash, ino) REFERENCES inode(medium_hash, ino) ON DELETE CASCADE
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS path_by_ino ON path (medium_hash, ino);

CREATE TABLE IF NOT EXISTS blobs (
    fingerprint TEXT PRIMARY KEY,
    n_hardlinks INTEGER NOT NULL DEFAULT 0,
    expected_hardlinks INTEGER NOT NULL DEFAULT 0,
    external_copied TEXT,
    external_copy_failed TEXT,
    external_last_checked TEXT,
    remote_copied TEXT,
    remote_copy_failed TEXT,
    remote_last_checked TEXT
);

CREATE TABLE IF NOT EXISTS queue_stat (
    medium_hash TEXT PRIMARY KEY,
    n_unclaimed INTEGER NOT NULL DEFAULT 0
);

CREATE TRIGGER IF NOT EXISTS queue_stat_ins AFTER INSERT ON inode
WHEN new.status IN ('pending','failed_retryable') AND new.claimed_by IS NULL
BEGIN
    INSERT INTO queue_stat (medium_hash, n_unclaimed) VALUES (new.medium_hash, 1)
    ON CONFLICT (medium_hash) DO UPDATE SET n_unclaimed = n_unclaimed + 1;
END;

CREATE TRIGGER IF NOT EXISTS queue_stat_upd AFTER UPDATE ON inode
BEGIN
    UPDATE queue_stat SET n_unclaimed = max(0, n_unclaimed - 1)
    WHERE medium_hash = old.medium_hash
      AND old.status IN ('pending','failed_retryable') AND old.claimed_by IS NULL
      AND NOT (new.status IN ('pending','failed_retryable') AND new.claimed_by IS NULL);
    INSERT INTO queue_stat (medium_hash, n_unclaimed)
    SELECT new.medium_hash, 1
    WHERE new.status IN ('pending','failed_retryable') AND new.claimed_by IS NULL
      AND NOT (old.status IN ('pending','failed_retryable') AND old.claimed_by IS NULL)
    ON CONFLICT (medium_hash) DO UPDATE SET n_unclaimed = n_unclaimed + 1;
END;

CREATE TRIGGER IF NOT EXISTS queue_stat_del AFTER DELETE ON inode
WHEN old.status IN ('pending','failed_retryable') AND old.claimed_by IS NULL
BEGIN
    UPDATE queue_stat SET n_unclaimed = max(0, n_unclaimed - 1)
    WHERE medium_hash = old.medium_hash;
END;
"#;

/// Opens a connection and initializes the schema.
///
/// Each worker thread opens its own connection. WAL keeps readers off the
/// writer's lock; the busy timeout covers the short writer bursts of claim
/// and commit.
pub fn open(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(Duration::from_secs(30))?;
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}

/// Runs `f`, retrying on transient database contention with bounded
/// exponential backoff. Non-transient errors return immediately.
pub fn with_busy_retry<T>(
    attempts: usize,
    mut f: impl FnMut() -> rusqlite::Result<T>,
) -> rusqlite::Result<T> {
    let mut delay = Duration::from_millis(50);
    let mut n = 0;
    loop {
        match f() {
            Ok(v) => return Ok(v),
            Err(e) if is_transient(&e) && n + 1 < attempts => {
                n += 1;
                tracing::debug!(attempt = n, error = %e, "database busy, backing off");
                thread::sleep(delay);
                delay = (delay * 2).min(Duration::from_secs(2));
            }
            Err(e) => return Err(e),
        }
    }
}

/// Tells whether a database error is worth retrying.
fn is_transient(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked)
    )
}

/// Fetches a medium row.
pub fn get_medium(conn: &Connection, medium_hash: &str) -> Result<Option<Medium>> {
    let row = conn
        .query_row(
            "SELECT medium_hash, medium_human, health, image_path, enum_done, copy_done, problems
             FROM medium WHERE medium_hash = ?1",
            params![medium_hash],
            |row| {
                Ok(Medium {
                    medium_hash: row.get(0)?,
                    medium_human: row.get(1)?,
                    health: row.get(2)?,
                    image_path: row.get(3)?,
                    enum_done: row.get(4)?,
                    copy_done: row.get(5)?,
                    problems: serde_json::from_str(&row.get::<_, String>(6)?)
                        .unwrap_or(serde_json::Value::Null),
                })
            },
        )
        .optional()?;
    Ok(row)
}

/// Marks the medium as drained by the copy engine.
pub fn set_copy_done(conn: &Connection, medium_hash: &str) -> Result<()> {
    conn.execute(
        "UPDATE medium SET copy_done = datetime('now') WHERE medium_hash = ?1",
        params![medium_hash],
    )?;
    Ok(())
}

/// Merges a JSON object into the medium's `problems` field.
///
/// Arrays are appended, numbers added, everything else overwritten. The
/// caller treats this as best-effort operator telemetry.
pub fn merge_problems(
    conn: &Connection,
    medium_hash: &str,
    patch: &serde_json::Value,
) -> Result<()> {
    let current: String = conn.query_row(
        "SELECT problems FROM medium WHERE medium_hash = ?1",
        params![medium_hash],
        |row| row.get(0),
    )?;
    let mut current: serde_json::Value =
        serde_json::from_str(&current).unwrap_or_else(|_| serde_json::json!({}));
    if !current.is_object() {
        current = serde_json::json!({});
    }
    if let (Some(cur), Some(new)) = (current.as_object_mut(), patch.as_object()) {
        for (key, val) in new {
            match (cur.get_mut(key), val) {
                (Some(serde_json::Value::Array(a)), serde_json::Value::Array(b)) => {
                    a.extend(b.iter().cloned());
                }
                (Some(serde_json::Value::Number(a)), serde_json::Value::Number(b)) => {
                    let sum = a.as_i64().unwrap_or(0) + b.as_i64().unwrap_or(0);
                    cur.insert(key.clone(), serde_json::json!(sum));
                }
                _ => {
                    cur.insert(key.clone(), val.clone());
                }
            }
        }
    }
    conn.execute(
        "UPDATE medium SET problems = ?2 WHERE medium_hash = ?1",
        params![medium_hash, current.to_string()],
    )?;
    Ok(())
}

/// Counts the inodes of a medium still eligible for a claim, regardless of
/// filesystem type. Zero means every inode reached a terminal state.
pub fn claimable_remaining(conn: &Connection, medium_hash: &str) -> Result<i64> {
    let n = conn.query_row(
        "SELECT count(*) FROM inode
         WHERE medium_hash = ?1 AND status IN ('pending','failed_retryable')",
        params![medium_hash],
        |row| row.get(0),
    )?;
    Ok(n)
}

/// Reads the unclaimed-work counter for one medium.
pub fn queue_count(conn: &Connection, medium_hash: &str) -> Result<i64> {
    let n = conn
        .query_row(
            "SELECT n_unclaimed FROM queue_stat WHERE medium_hash = ?1",
            params![medium_hash],
            |row| row.get(0),
        )
        .optional()?;
    Ok(n.unwrap_or(0))
}

/// Reads the unclaimed-work counters for all media.
pub fn queue_counts(conn: &Connection) -> Result<Vec<(String, i64)>> {
    let mut stmt = conn.prepare(
        "SELECT medium_hash, n_unclaimed FROM queue_stat ORDER BY medium_hash",
    )?;
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Rebuilds the queue counters from a full scan. The triggers keep them
/// close to the truth; this is the recovery path when drift is detected.
pub fn recompute_queue_stats(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM queue_stat", [])?;
    tx.execute(
        "INSERT INTO queue_stat (medium_hash, n_unclaimed)
         SELECT medium_hash, count(*) FROM inode
         WHERE status IN ('pending','failed_retryable') AND claimed_by IS NULL
         GROUP BY medium_hash",
        [],
    )?;
    tx.commit()?;
    Ok(())
}

/// Per-status inode counts for one medium.
pub fn status_breakdown(conn: &Connection, medium_hash: &str) -> Result<Vec<(String, i64)>> {
    let mut stmt = conn.prepare(
        "SELECT status, count(*) FROM inode WHERE medium_hash = ?1
         GROUP BY status ORDER BY status",
    )?;
    let rows = stmt
        .query_map(params![medium_hash], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Bulk-resets failed inodes of a medium back to `pending` after the
/// operator fixed the root cause. With `include_permanent`, sentinel-tagged
/// terminal rows are re-admitted too. The error history is kept.
pub fn requeue(conn: &Connection, medium_hash: &str, include_permanent: bool) -> Result<usize> {
    let n = conn.execute(
        "UPDATE inode SET status = 'pending', error_type = NULL,
                claimed_by = NULL, claimed_at = NULL
         WHERE medium_hash = ?1
           AND (status = 'failed_retryable' OR (?2 AND status = 'failed_permanent'))",
        params![medium_hash, include_permanent],
    )?;
    if n > 0 {
        conn.execute(
            "UPDATE medium SET copy_done = NULL WHERE medium_hash = ?1",
            params![medium_hash],
        )?;
    }
    Ok(n)
}


#[cfg(test)]
mod test {
    use super::testutil::*;
    use super::*;

    fn open_temp() -> (tempfile::TempDir, Connection) {
        let dir = tempfile::tempdir().unwrap();
        let conn = open(&dir.path().join("t.db")).unwrap();
        (dir, conn)
    }

    #[test]
    fn schema_is_idempotent() {
        let (dir, conn) = open_temp();
        drop(conn);
        // A second open over the same file re-runs the DDL
        let conn = open(&dir.path().join("t.db")).unwrap();
        add_medium(&conn, "m1", "ok");
        assert!(get_medium(&conn, "m1").unwrap().is_some());
        assert!(get_medium(&conn, "nope").unwrap().is_none());
    }

    #[test]
    fn queue_stat_follows_inode_changes() {
        let (_dir, conn) = open_temp();
        add_medium(&conn, "m1", "ok");
        add_inode(&conn, "m1", 1, 'f', 10);
        add_inode(&conn, "m1", 2, 'f', 10);
        assert_eq!(queue_count(&conn, "m1").unwrap(), 2);
        // Claiming removes from the counter
        conn.execute(
            "UPDATE inode SET claimed_by = 'w' WHERE medium_hash = 'm1' AND ino = 1",
            [],
        )
        .unwrap();
        assert_eq!(queue_count(&conn, "m1").unwrap(), 1);
        // Releasing the claim restores it
        conn.execute(
            "UPDATE inode SET claimed_by = NULL WHERE medium_hash = 'm1' AND ino = 1",
            [],
        )
        .unwrap();
        assert_eq!(queue_count(&conn, "m1").unwrap(), 2);
        // A terminal transition removes it for good
        conn.execute(
            "UPDATE inode SET status = 'success' WHERE medium_hash = 'm1' AND ino = 2",
            [],
        )
        .unwrap();
        assert_eq!(queue_count(&conn, "m1").unwrap(), 1);
        // Deleting the last eligible row drains the counter
        conn.execute("DELETE FROM inode WHERE medium_hash = 'm1' AND ino = 1", [])
            .unwrap();
        assert_eq!(queue_count(&conn, "m1").unwrap(), 0);
    }

    #[test]
    fn recompute_matches_triggers() {
        let (_dir, mut conn) = open_temp();
        add_medium(&conn, "m1", "ok");
        for ino in 0..20 {
            add_inode(&conn, "m1", ino, 'f', 1);
        }
        conn.execute(
            "UPDATE inode SET status = 'success' WHERE medium_hash = 'm1' AND ino < 5",
            [],
        )
        .unwrap();
        let by_trigger = queue_count(&conn, "m1").unwrap();
        // Poison the counter, then rebuild by scan
        conn.execute("UPDATE queue_stat SET n_unclaimed = 999", [])
            .unwrap();
        recompute_queue_stats(&mut conn).unwrap();
        assert_eq!(queue_count(&conn, "m1").unwrap(), by_trigger);
        assert_eq!(by_trigger, 15);
    }

    #[test]
    fn requeue_readmits_failures() {
        let (_dir, conn) = open_temp();
        add_medium(&conn, "m1", "ok");
        add_inode(&conn, "m1", 1, 'f', 1);
        add_inode(&conn, "m1", 2, 'f', 1);
        conn.execute(
            "UPDATE inode SET status = 'failed_retryable', error_type = 'io_error'
             WHERE ino = 1",
            [],
        )
        .unwrap();
        conn.execute(
            "UPDATE inode SET status = 'failed_permanent',
                    claimed_by = 'DIAGNOSTIC_SKIP:BEYOND_EOF' WHERE ino = 2",
            [],
        )
        .unwrap();
        set_copy_done(&conn, "m1").unwrap();
        assert_eq!(requeue(&conn, "m1", false).unwrap(), 1);
        assert_eq!(requeue(&conn, "m1", true).unwrap(), 1);
        let m = get_medium(&conn, "m1").unwrap().unwrap();
        assert!(m.copy_done.is_none());
        assert_eq!(claimable_remaining(&conn, "m1").unwrap(), 2);
    }

    #[test]
    fn problems_merge_appends_and_sums() {
        let (_dir, conn) = open_temp();
        add_medium(&conn, "m1", "ok");
        merge_problems(
            &conn,
            "m1",
            &serde_json::json!({"auto_skips": 2, "events": ["a"]}),
        )
        .unwrap();
        merge_problems(
            &conn,
            "m1",
            &serde_json::json!({"auto_skips": 3, "events": ["b"], "cond": "BEYOND_EOF"}),
        )
        .unwrap();
        let m = get_medium(&conn, "m1").unwrap().unwrap();
        assert_eq!(m.problems["auto_skips"], 5);
        assert_eq!(m.problems["events"], serde_json::json!(["a", "b"]));
        assert_eq!(m.problems["cond"], "BEYOND_EOF");
    }

    #[test]
    fn path_bytes_round_trip() {
        let (_dir, conn) = open_temp();
        add_medium(&conn, "m1", "ok");
        add_inode(&conn, "m1", 1, 'f', 1);
        let raw: &[u8] = b"/weird\x5c\x1cname\xffbytes";
        add_path(&conn, "m1", 1, raw);
        let got: Vec<u8> = conn
            .query_row(
                "SELECT path FROM path WHERE medium_hash = 'm1' AND ino = 1",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(got, raw);
    }
}
