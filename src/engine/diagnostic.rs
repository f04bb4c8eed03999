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

//! The diagnostic service: spots inodes that keep failing despite retries,
//! emits structured checkpoints for the operator and force-skips the ones
//! whose failure signature is known to be unrecoverable, so one bad file
//! cannot stall a worker for its whole retry budget.

use crate::db;
use crate::error::ErrorKind;
use rusqlite::Connection;
use std::collections::{BTreeSet, HashMap, VecDeque};
use tracing::warn;

/// Bound on tracked inodes per worker.
const MAX_ENTRIES: usize = 4096;

/// Recent error messages kept per inode.
const RECENT_MSGS: usize = 3;

/// Per-inode failure tracking.
#[derive(Debug, Default)]
struct InodeDiag {
    attempts: usize,
    beyond_eof: usize,
    recent: VecDeque<String>,
}

/// What the worker should do with the failing inode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiagAction {
    /// Let the retry machinery run its course.
    Continue,
    /// Force the inode out of the claim pool with the given sentinel reason.
    ForceSkip(String),
}

/// Per-worker diagnostic state.
///
/// Entries are evicted once their inode reaches a terminal state and the
/// map is size-capped; what falls off either way is spilled into the
/// deferred event list rather than lost.
#[derive(Debug)]
pub struct DiagnosticService {
    threshold: usize,
    entries: HashMap<(String, i64), InodeDiag>,
    events: Vec<serde_json::Value>,
    auto_skips: i64,
    conditions: BTreeSet<String>,
}

impl DiagnosticService {
    /// Creates the service with the configured checkpoint threshold.
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            entries: HashMap::new(),
            events: Vec::new(),
            auto_skips: 0,
            conditions: BTreeSet::new(),
        }
    }

    /// Records one failure and decides whether the inode is worth keeping in
    /// the retry pool.
    ///
    /// `attempts` is the persisted history length including the current
    /// failure, so checkpoints fire at the right count even when earlier
    /// attempts happened in previous engine invocations.
    pub fn record_failure(
        &mut self,
        medium_hash: &str,
        ino: i64,
        kind: ErrorKind,
        msg: &str,
        attempts: usize,
    ) -> DiagAction {
        let key = (medium_hash.to_string(), ino);
        if !self.entries.contains_key(&key) && self.entries.len() >= MAX_ENTRIES {
            self.spill_one();
        }
        let entry = self.entries.entry(key).or_default();
        entry.attempts = entry.attempts.max(attempts);
        if kind.is_beyond_eof() {
            entry.beyond_eof += 1;
        }
        if entry.recent.len() == RECENT_MSGS {
            entry.recent.pop_front();
        }
        entry.recent.push_back(msg.to_string());
        if entry.attempts < self.threshold {
            return DiagAction::Continue;
        }
        // Checkpoint reached: summarize the pattern for the operator
        let recent: Vec<&String> = entry.recent.iter().collect();
        warn!(
            medium = medium_hash,
            ino,
            attempts = entry.attempts,
            kind = kind.as_db_str(),
            ?recent,
            "DIAGNOSTIC CHECKPOINT"
        );
        self.events.push(serde_json::json!({
            "ino": ino,
            "attempts": entry.attempts,
            "kind": kind.as_db_str(),
            "recent": entry.recent.iter().collect::<Vec<_>>(),
        }));
        if entry.beyond_eof > 0 {
            // A partial image cannot grow the missing bytes back; retrying
            // would burn the whole budget on a known-lost range
            self.auto_skips += 1;
            self.conditions.insert("BEYOND_EOF".to_string());
            self.entries.remove(&(medium_hash.to_string(), ino));
            return DiagAction::ForceSkip("BEYOND_EOF".to_string());
        }
        DiagAction::Continue
    }

    /// Drops the tracking entry of an inode that reached a terminal state.
    pub fn mark_terminal(&mut self, medium_hash: &str, ino: i64) {
        self.entries.remove(&(medium_hash.to_string(), ino));
    }

    /// Evicts one entry into the deferred event list to respect the cap.
    fn spill_one(&mut self) {
        if let Some(key) = self.entries.keys().next().cloned() {
            let entry = self.entries.remove(&key).unwrap();
            self.events.push(serde_json::json!({
                "ino": key.1,
                "attempts": entry.attempts,
                "evicted": true,
            }));
        }
    }

    /// Tells whether anything is waiting to be flushed.
    pub fn has_events(&self) -> bool {
        !self.events.is_empty() || self.auto_skips > 0
    }

    /// Flushes the deferred events into the medium's problem notes.
    ///
    /// Best-effort operator telemetry: runs off the commit path, on worker
    /// shutdown, and a failure to write only logs.
    pub fn flush(&mut self, conn: &Connection, medium_hash: &str) {
        if !self.has_events() {
            return;
        }
        let patch = serde_json::json!({
            "diagnostic_events": std::mem::take(&mut self.events),
            "auto_skips": std::mem::replace(&mut self.auto_skips, 0),
            "conditions": self.conditions.iter().collect::<Vec<_>>(),
        });
        if let Err(e) = db::merge_problems(conn, medium_hash, &patch) {
            warn!(medium = medium_hash, error = %e, "could not flush diagnostics");
        }
        self.conditions.clear();
    }
}
