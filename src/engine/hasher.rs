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

//! The reader/hasher: streams an inode's bytes off the mounted medium,
//! fingerprints them in a single pass and (unless running dry) stages them
//! for the content store at the same time.

use crate::archive::{PathError, join_raw};
use crate::cas::Stage;
use crate::error::{EngineError, ErrorKind, InodeFailure, store_fatal};
use crate::model::ClaimedInode;
use std::fs::File;
use std::io::Read;
use std::os::unix::ffi::OsStringExt;
use std::path::{Path, PathBuf};

/// Read buffer size for sequential scans of the mounted image.
const READ_BUF_SIZE: usize = 256 * 1024;

/// What the reader produced for one file inode.
#[derive(Debug, Clone)]
pub struct HashedContent {
    /// Lowercase hex fingerprint of the content.
    pub fingerprint: String,
    /// Number of bytes actually delivered by the medium.
    pub size: u64,
    /// Coarse content-type tag sniffed from the first bytes.
    pub mime: Option<&'static str>,
}

/// A reader failure, split by who is at fault.
#[derive(Debug)]
pub enum ReadError {
    /// The medium (or its mount) failed; scoped to the inode.
    Inode(InodeFailure),
    /// The store side failed; fatal to the worker.
    Fatal(EngineError),
}

impl From<InodeFailure> for ReadError {
    fn from(f: InodeFailure) -> Self {
        Self::Inode(f)
    }
}

/// Resolves one recorded path under the medium's mount directory.
fn mount_path(mount_dir: &Path, raw: &[u8]) -> Result<PathBuf, InodeFailure> {
    join_raw(mount_dir, raw).map_err(|e| match e {
        PathError::Unsafe(msg) => InodeFailure::path(msg),
        e => InodeFailure::path(e.to_string()),
    })
}

/// Opens the inode's byte stream, falling through the alternate paths.
///
/// Hardlinks share content, so any recorded path will do; a path that fails
/// to resolve does not condemn the inode while a sibling may still be
/// reachable. Non-resolution failures (I/O, permission) abort the walk
/// immediately since every hardlink would hit the same condition.
fn open_any_path(mount_dir: &Path, inode: &ClaimedInode) -> Result<File, InodeFailure> {
    let mut last: Option<InodeFailure> = None;
    for entry in &inode.paths {
        let path = match mount_path(mount_dir, &entry.path) {
            Ok(p) => p,
            Err(e) => {
                last = Some(e);
                continue;
            }
        };
        match File::open(&path) {
            Ok(f) => return Ok(f),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                last = Some(InodeFailure::from_read(&e, &path.display().to_string()));
            }
            Err(e) => {
                return Err(InodeFailure::from_read(&e, &path.display().to_string()));
            }
        }
    }
    Err(last.unwrap_or_else(|| InodeFailure::path("no recorded path")))
}

/// Reads a file inode off the mount, fingerprinting it in one pass.
///
/// When `stage` is given, every chunk is appended to it so the staged file
/// is ready for a store commit the moment the digest is final. A short
/// delivery against the recorded size is a read failure; on a known-partial
/// image it carries the beyond-end-of-media annotation so the diagnostic
/// service can recognize the signature.
pub fn read_inode(
    mount_dir: &Path,
    inode: &ClaimedInode,
    medium_partial: bool,
    mut stage: Option<&mut Stage>,
) -> Result<HashedContent, ReadError> {
    let mut file = open_any_path(mount_dir, inode)?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];
    let mut size = 0u64;
    let mut mime = None;
    loop {
        let n = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(InodeFailure::from_read(&e, "read").into());
            }
        };
        if size == 0 {
            mime = sniff_mime(&buf[..n]);
        }
        hasher.update(&buf[..n]);
        if let Some(stage) = stage.as_deref_mut() {
            stage
                .write_all(&buf[..n])
                .map_err(|e| ReadError::Fatal(store_fatal(e)))?;
        }
        size += n as u64;
    }
    if size < inode.size as u64 {
        if medium_partial {
            return Err(InodeFailure::beyond_eof(inode.size, size).into());
        }
        return Err(InodeFailure {
            kind: ErrorKind::Io { beyond_eof: false },
            msg: format!("short read: {size} of {} recorded bytes", inode.size),
        }
        .into());
    }
    if size > inode.size as u64 {
        // The mount delivered more than enumeration recorded; the snapshot
        // and the image disagree, which a retry may resolve
        return Err(InodeFailure::hash(format!(
            "size mismatch: read {size}, recorded {}",
            inode.size
        ))
        .into());
    }
    Ok(HashedContent {
        fingerprint: hasher.finalize().to_hex().to_string(),
        size,
        mime,
    })
}

/// Reads a symlink inode's target bytes off the mount.
pub fn read_link_target(mount_dir: &Path, inode: &ClaimedInode) -> Result<Vec<u8>, InodeFailure> {
    let mut last: Option<InodeFailure> = None;
    for entry in &inode.paths {
        let path = match mount_path(mount_dir, &entry.path) {
            Ok(p) => p,
            Err(e) => {
                last = Some(e);
                continue;
            }
        };
        match std::fs::read_link(&path) {
            Ok(target) => return Ok(target.into_os_string().into_vec()),
            Err(e) => {
                let failure = InodeFailure::from_read(&e, &path.display().to_string());
                if e.kind() == std::io::ErrorKind::NotFound {
                    last = Some(failure);
                } else {
                    return Err(failure);
                }
            }
        }
    }
    Err(last.unwrap_or_else(|| InodeFailure::path("no recorded path")))
}

/// Sniffs a coarse MIME tag from the first bytes of the content.
fn sniff_mime(head: &[u8]) -> Option<&'static str> {
    match head {
        [0x7f, b'E', b'L', b'F', ..] => Some("application/x-executable"),
        [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, ..] => Some("image/png"),
        [0xff, 0xd8, 0xff, ..] => Some("image/jpeg"),
        [b'G', b'I', b'F', b'8', ..] => Some("image/gif"),
        [b'%', b'P', b'D', b'F', ..] => Some("application/pdf"),
        [0x1f, 0x8b, ..] => Some("application/gzip"),
        [b'P', b'K', 0x03, 0x04, ..] | [b'P', b'K', 0x05, 0x06, ..] => Some("application/zip"),
        [b'B', b'Z', b'h', ..] => Some("application/x-bzip2"),
        [0xfd, b'7', b'z', b'X', b'Z', 0x00, ..] => Some("application/x-xz"),
        _ if !head.is_empty() && head.iter().all(|b| !b.is_ascii_control() || b" \t\r\n".contains(b)) => {
            Some("text/plain")
        }
        _ => None,
    }
}
