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

//! Engine configuration.
//!
//! Options come from a TOML file; every key has a default so an empty (or
//! absent) file is valid. Command-line flags override file values; the
//! `MEDARC_CONFIG` environment variable names an alternate file.

use crate::error::{EngineError, Result};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/medarc.toml";

/// Recognized configuration options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Number of parallel workers per medium.
    pub workers: usize,
    /// Inodes per claim call.
    pub batch_size: usize,
    /// Claim-stage sampling window over the eligible set.
    pub sample_size: usize,
    /// Per-inode retry budget across worker invocations.
    pub max_retries: usize,
    /// Recorded failures before a diagnostic checkpoint is emitted.
    pub diagnostic_threshold: usize,
    /// Age after which a claim without forward progress is reclaimable.
    pub stale_claim_ttl_secs: u64,
    /// Attempts for a batch commit hitting transient database contention.
    pub commit_retries: usize,
    /// Root of the `by-hash` content store.
    pub cas_root: PathBuf,
    /// Root of the per-medium archive trees.
    pub archive_root: PathBuf,
    /// Directory under which per-medium mounts appear.
    pub mount_root: PathBuf,
    /// Path of the SQLite database.
    pub db_path: PathBuf,
    /// When true, no filesystem mutation and no database write happens.
    pub dry_run: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 4,
            batch_size: 50,
            sample_size: 1000,
            max_retries: 50,
            diagnostic_threshold: 10,
            stale_claim_ttl_secs: 21600,
            commit_retries: 5,
            cas_root: PathBuf::from("/var/lib/medarc/by-hash"),
            archive_root: PathBuf::from("/var/lib/medarc/archived"),
            mount_root: PathBuf::from("/mnt/medarc"),
            db_path: PathBuf::from("/var/lib/medarc/medarc.db"),
            dry_run: false,
        }
    }
}

impl Config {
    /// Loads the configuration.
    ///
    /// `path` is the file given on the command line, if any; otherwise the
    /// `MEDARC_CONFIG` environment variable, then [`DEFAULT_CONFIG_PATH`],
    /// are consulted. A missing default file yields the built-in defaults; a
    /// file named explicitly must exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let env_path = env::var_os("MEDARC_CONFIG").map(PathBuf::from);
        let (path, explicit) = match (path, &env_path) {
            (Some(p), _) => (p, true),
            (None, Some(p)) => (p.as_path(), true),
            (None, None) => (Path::new(DEFAULT_CONFIG_PATH), false),
        };
        let buf = match fs::read_to_string(path) {
            Ok(buf) => buf,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !explicit => {
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(EngineError::Config(format!(
                    "cannot read {}: {e}",
                    path.display()
                )));
            }
        };
        let config: Self = toml::from_str(&buf)
            .map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))?;
        config.check()?;
        Ok(config)
    }

    /// Validates option ranges.
    pub fn check(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(EngineError::Config("workers must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(EngineError::Config("batch_size must be at least 1".into()));
        }
        if self.sample_size < self.batch_size {
            return Err(EngineError::Config(
                "sample_size must be at least batch_size".into(),
            ));
        }
        if self.commit_retries == 0 {
            return Err(EngineError::Config(
                "commit_retries must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Returns the SQLite datetime modifier matching the stale-claim TTL.
    pub fn stale_modifier(&self) -> String {
        format!("-{} seconds", self.stale_claim_ttl_secs)
    }
}
