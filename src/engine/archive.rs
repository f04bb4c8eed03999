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

//! The archive tree: a per-medium mirror of the original paths, populated
//! with hardlinks into the content store.
//!
//! Paths are raw byte sequences and pass through unaltered; the only
//! interpretation applied is splitting on `/` to defend against escapes from
//! the archive root.

use std::ffi::OsStr;
use std::fs::{self, DirBuilder};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, symlink};
use std::path::{Path, PathBuf};

/// Mode of created directories.
const DIR_MODE: u32 = 0o755;

/// Result of materializing one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Materialized {
    /// A new filesystem object was created.
    Created,
    /// The object was already in place from an earlier run.
    AlreadyPresent,
}

/// A failure scoped to a single path of an inode.
#[derive(Debug)]
pub enum PathError {
    /// The raw bytes escape the archive root.
    Unsafe(String),
    /// The archive location is occupied by an unrelated object.
    Collision(PathBuf),
    /// Any other I/O failure on the archive tree.
    Io(io::Error),
}

impl std::fmt::Display for PathError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unsafe(msg) => write!(f, "unsafe path: {msg}"),
            Self::Collision(p) => write!(f, "collision at {}", p.display()),
            Self::Io(e) => write!(f, "{e}"),
        }
    }
}

impl From<io::Error> for PathError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Joins raw path bytes under a base directory.
///
/// Leading separators anchor the path at the base. Empty and `.` components
/// collapse; a `..` component or an empty result is rejected so no path can
/// escape the base.
pub fn join_raw(base: &Path, raw: &[u8]) -> Result<PathBuf, PathError> {
    let mut out = base.to_path_buf();
    let mut depth = 0usize;
    for comp in raw.split(|b| *b == b'/') {
        match comp {
            b"" | b"." => continue,
            b".." => {
                return Err(PathError::Unsafe(format!(
                    "`..` component in {}",
                    String::from_utf8_lossy(raw)
                )));
            }
            comp => {
                out.push(OsStr::from_bytes(comp));
                depth += 1;
            }
        }
    }
    if depth == 0 {
        return Err(PathError::Unsafe("empty path".into()));
    }
    Ok(out)
}

/// Handle on the archive tree root.
#[derive(Debug, Clone)]
pub struct ArchiveTree {
    root: PathBuf,
}

impl ArchiveTree {
    /// Opens the archive tree, creating the root if needed.
    pub fn open(root: &Path) -> io::Result<Self> {
        DirBuilder::new()
            .recursive(true)
            .mode(DIR_MODE)
            .create(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Returns the archive directory of one medium.
    pub fn medium_dir(&self, medium_hash: &str) -> PathBuf {
        self.root.join(medium_hash)
    }

    /// Joins raw path bytes under the medium's archive directory.
    pub fn resolve(&self, medium_hash: &str, raw: &[u8]) -> Result<PathBuf, PathError> {
        join_raw(&self.medium_dir(medium_hash), raw)
    }

    /// Creates the missing parent directories of an archive location.
    ///
    /// A parent component occupied by a non-directory is a collision scoped
    /// to this path, like a collision at the destination itself.
    fn make_parents(&self, dest: &Path) -> Result<(), PathError> {
        let Some(parent) = dest.parent() else {
            return Ok(());
        };
        DirBuilder::new()
            .recursive(true)
            .mode(DIR_MODE)
            .create(parent)
            .map_err(|e| match e.raw_os_error() {
                Some(libc::ENOTDIR) | Some(libc::EEXIST) => {
                    PathError::Collision(parent.to_path_buf())
                }
                _ => PathError::Io(e),
            })
    }

    /// Hardlinks a stored blob to an archive location.
    ///
    /// Idempotent: a destination that already shares the blob's underlying
    /// storage object is left alone. A destination occupied by anything else
    /// is a collision scoped to this path alone.
    pub fn link_file(&self, blob: &Path, dest: &Path) -> Result<Materialized, PathError> {
        self.make_parents(dest)?;
        match fs::hard_link(blob, dest) {
            Ok(()) => Ok(Materialized::Created),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let a = fs::metadata(blob)?;
                let b = fs::symlink_metadata(dest)?;
                if a.dev() == b.dev() && a.ino() == b.ino() {
                    Ok(Materialized::AlreadyPresent)
                } else {
                    Err(PathError::Collision(dest.to_path_buf()))
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Creates a directory at an archive location.
    pub fn make_dir(&self, dest: &Path) -> Result<Materialized, PathError> {
        if dest.is_dir() {
            return Ok(Materialized::AlreadyPresent);
        }
        DirBuilder::new()
            .recursive(true)
            .mode(DIR_MODE)
            .create(dest)?;
        Ok(Materialized::Created)
    }

    /// Recreates a symlink with its original target bytes.
    pub fn make_symlink(&self, target: &[u8], dest: &Path) -> Result<Materialized, PathError> {
        self.make_parents(dest)?;
        let target = OsStr::from_bytes(target);
        match symlink(target, dest) {
            Ok(()) => Ok(Materialized::Created),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                match fs::read_link(dest) {
                    Ok(existing) if existing.as_os_str() == target => {
                        Ok(Materialized::AlreadyPresent)
                    }
                    _ => Err(PathError::Collision(dest.to_path_buf())),
                }
            }
            Err(e) => Err(e.into()),
        }
    }
}
