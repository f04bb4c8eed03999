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

//! The transaction committer: persists a batch's outcomes in one database
//! transaction.
//!
//! This is the only writer of inode outcomes and of the `blobs` table on the
//! copy path, and it runs strictly after the filesystem side-effects: a
//! crash between store commit and database commit leaves a claimed row that
//! a later run re-processes against an idempotent store and archive.

use crate::config::Config;
use crate::db::with_busy_retry;
use crate::error::{ErrorKind, Result, RetryDecision, decide};
use crate::model::Status;
use rusqlite::{Connection, Transaction, TransactionBehavior, params};

/// Sentinel claim tag of an inode whose retry budget ran out.
pub const MAX_RETRIES_TAG: &str = "MAX_RETRIES_EXCEEDED";

/// Prefix of the sentinel claim tag written on a diagnostic force-skip.
pub const DIAGNOSTIC_SKIP_PREFIX: &str = "DIAGNOSTIC_SKIP:";

/// Result of processing one inode, ready to be persisted.
#[derive(Debug)]
pub enum Outcome {
    /// A file inode was fingerprinted and materialized.
    FileSuccess {
        /// Inode number.
        ino: i64,
        /// Hex fingerprint of the content.
        fingerprint: String,
        /// Sniffed content-type tag, if any.
        mime: Option<String>,
        /// Archive hardlinks created by this processing.
        new_links: i64,
        /// Non-excluded paths referencing the inode.
        expected_links: i64,
        /// Per-path collisions recorded without failing the inode.
        path_errors: Vec<String>,
    },
    /// A directory, symlink or special inode was handled.
    NonFileSuccess {
        /// Inode number.
        ino: i64,
    },
    /// The inode failed; the retry machinery decides its fate.
    Failure {
        /// Inode number.
        ino: i64,
        /// Failure classification.
        kind: ErrorKind,
        /// Full failure history including the current message.
        history: Vec<String>,
        /// Sentinel reason set when the diagnostic service force-skips.
        force_skip: Option<String>,
    },
}

fn apply_outcome(
    tx: &Transaction<'_>,
    config: &Config,
    medium_hash: &str,
    outcome: &Outcome,
) -> rusqlite::Result<()> {
    match outcome {
        Outcome::FileSuccess {
            ino,
            fingerprint,
            mime,
            new_links,
            expected_links,
            path_errors,
        } => {
            tx.execute(
                "UPDATE inode SET status = 'success', fingerprint = ?3,
                        mime_type = ?4, error_type = NULL,
                        processed_at = datetime('now'),
                        claimed_by = NULL, claimed_at = NULL
                 WHERE medium_hash = ?1 AND ino = ?2",
                params![medium_hash, ino, fingerprint, mime],
            )?;
            if !path_errors.is_empty() {
                append_errors(tx, medium_hash, *ino, path_errors)?;
            }
            tx.execute(
                "UPDATE path SET fingerprint = ?3
                 WHERE medium_hash = ?1 AND ino = ?2 AND exclude_reason IS NULL",
                params![medium_hash, ino, fingerprint],
            )?;
            // Upsert: losing the first-observation race to another worker
            // only means crediting an existing row instead
            tx.execute(
                "INSERT INTO blobs (fingerprint, n_hardlinks, expected_hardlinks)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT (fingerprint) DO UPDATE SET
                     n_hardlinks = n_hardlinks + excluded.n_hardlinks,
                     expected_hardlinks = expected_hardlinks + excluded.expected_hardlinks",
                params![fingerprint, new_links, expected_links],
            )?;
        }
        Outcome::NonFileSuccess { ino } => {
            tx.execute(
                "UPDATE inode SET status = 'success', error_type = NULL,
                        processed_at = datetime('now'),
                        claimed_by = NULL, claimed_at = NULL
                 WHERE medium_hash = ?1 AND ino = ?2",
                params![medium_hash, ino],
            )?;
        }
        Outcome::Failure {
            ino,
            kind,
            history,
            force_skip,
        } => {
            let decision = match force_skip {
                Some(_) => RetryDecision::FailPermanent,
                None => match decide(*kind, history.len(), config.max_retries) {
                    // In-place retries are resolved by the worker; one that
                    // leaks through waits for the next cycle
                    RetryDecision::RetryNow => RetryDecision::RetryLater,
                    d => d,
                },
            };
            let (status, claimed_by) = match (decision, force_skip) {
                (RetryDecision::FailPermanent, Some(reason)) => (
                    Status::FailedPermanent,
                    Some(format!("{DIAGNOSTIC_SKIP_PREFIX}{reason}")),
                ),
                (RetryDecision::FailPermanent, None) => {
                    (Status::FailedPermanent, Some(MAX_RETRIES_TAG.to_string()))
                }
                _ => (Status::FailedRetryable, None),
            };
            let history = serde_json::to_string(history)
                .unwrap_or_else(|_| "[]".to_string());
            // A failed inode never keeps a fingerprint
            tx.execute(
                "UPDATE inode SET status = ?3, error_type = ?4, errors = ?5,
                        fingerprint = NULL, processed_at = NULL,
                        claimed_by = ?6,
                        claimed_at = CASE WHEN ?6 IS NULL THEN NULL
                                          ELSE datetime('now') END
                 WHERE medium_hash = ?1 AND ino = ?2",
                params![
                    medium_hash,
                    ino,
                    status.as_str(),
                    kind.as_db_str(),
                    history,
                    claimed_by
                ],
            )?;
        }
    }
    Ok(())
}

/// Appends messages to an inode's error history inside the transaction.
fn append_errors(
    tx: &Transaction<'_>,
    medium_hash: &str,
    ino: i64,
    msgs: &[String],
) -> rusqlite::Result<()> {
    let current: String = tx.query_row(
        "SELECT errors FROM inode WHERE medium_hash = ?1 AND ino = ?2",
        params![medium_hash, ino],
        |row| row.get(0),
    )?;
    let mut history: Vec<String> = serde_json::from_str(&current).unwrap_or_default();
    history.extend(msgs.iter().cloned());
    tx.execute(
        "UPDATE inode SET errors = ?3 WHERE medium_hash = ?1 AND ino = ?2",
        params![
            medium_hash,
            ino,
            serde_json::to_string(&history).unwrap_or_else(|_| "[]".to_string())
        ],
    )?;
    Ok(())
}

/// Persists a whole batch, or nothing.
///
/// Transient contention retries the same prepared batch up to
/// `commit_retries` times; the updates are idempotent so a replay after a
/// half-applied rollback is safe.
pub fn commit_batch(
    conn: &mut Connection,
    config: &Config,
    medium_hash: &str,
    outcomes: &[Outcome],
) -> Result<()> {
    if outcomes.is_empty() {
        return Ok(());
    }
    with_busy_retry(config.commit_retries, || {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        for outcome in outcomes {
            apply_outcome(&tx, config, medium_hash, outcome)?;
        }
        tx.commit()
    })?;
    Ok(())
}
