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

//! Copy/dedup engine of the `medarc` media archiver.
//!
//! The engine drains the per-medium queue of enumerated inodes: each file's
//! content is read off the mounted image, fingerprinted, stored exactly once
//! in the `by-hash` content store and hardlinked back at every original path
//! under the per-medium archive tree. The database keeps the queue, the
//! outcome of every inode and the hardlink accounting per unique content.

use std::fmt;
use std::path::PathBuf;
use std::process::exit;

pub mod archive;
pub mod cas;
pub mod claim;
pub mod commit;
pub mod config;
pub mod db;
pub mod diagnostic;
pub mod error;
pub mod hasher;
pub mod model;
pub mod supervisor;
pub mod worker;

use archive::ArchiveTree;
use cas::CasStore;
use config::Config;
use error::Result;
use rusqlite::Connection;

/// Everything a worker needs to run, passed explicitly.
pub struct Context {
    /// Engine configuration.
    pub config: Config,
    /// The medium being drained.
    pub medium_hash: String,
    /// Handle on the content store.
    pub cas: CasStore,
    /// Handle on the archive tree.
    pub archive: ArchiveTree,
}

impl Context {
    /// Builds the shared context for one medium run.
    pub fn new(config: Config, medium_hash: String) -> Result<Self> {
        let cas = CasStore::open(&config.cas_root)?;
        let archive = ArchiveTree::open(&config.archive_root)?;
        Ok(Self {
            config,
            medium_hash,
            cas,
            archive,
        })
    }

    /// Returns the directory under which the medium's filesystem is mounted.
    pub fn mount_dir(&self) -> PathBuf {
        self.config.mount_root.join(&self.medium_hash)
    }

    /// Opens a database connection for one worker.
    pub fn open_db(&self) -> Result<Connection> {
        db::open(&self.config.db_path)
    }
}

/// Writes an error to stderr, then exits.
pub fn error<M: fmt::Display>(bin: &str, msg: M) -> ! {
    eprintln!("{bin}: error: {msg}");
    exit(1);
}
