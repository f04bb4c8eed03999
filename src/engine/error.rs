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

//! Error taxonomy of the engine.
//!
//! Failures come in two shapes: [`EngineError`] aborts a worker (or the whole
//! run), while [`InodeFailure`] is scoped to the inode being processed and
//! feeds the retry machinery. Classification happens where the raw error is
//! first observed; the retry decision is a pure function over the
//! classification and the recorded attempt count.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that abort a worker or the whole run.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Database errors that survived the bounded retry.
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    /// Invalid configuration value or file.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// The medium is not present in the database.
    #[error("unknown medium {0}")]
    UnknownMedium(String),
    /// No mounted filesystem for the medium.
    #[error("no mounted filesystem at {0}")]
    MountMissing(PathBuf),
    /// The content store filesystem is full.
    #[error("content store is out of space")]
    StoreFull,
    /// The content store root is not writable.
    #[error("content store is not writable: {0}")]
    StoreAccess(io::Error),
    /// Staging area and blob directory are on different filesystems.
    #[error("content store spans filesystems; staging and blobs must share one")]
    StoreCrossDevice,
    /// Any other I/O error outside the mount-read path.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Engine result type.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Classification of a failure scoped to one inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A recorded path does not resolve under the medium's mount.
    Path,
    /// The medium returned a hardware-style read failure.
    Io {
        /// The recorded size exceeds what the image can deliver.
        beyond_eof: bool,
    },
    /// Access denied on the mount.
    Permission,
    /// The fingerprint could not be obtained, or the byte count disagreed
    /// with the recorded size in a way that suggests transient trouble.
    Hash,
    /// Anything uncategorized.
    Unknown,
}

impl ErrorKind {
    /// Returns the `error_type` tag stored on the inode row.
    pub fn as_db_str(self) -> &'static str {
        match self {
            Self::Path => "path_error",
            Self::Io { .. } => "io_error",
            Self::Permission => "permission_error",
            Self::Hash => "hash_error",
            Self::Unknown => "unknown",
        }
    }

    /// Tells whether the failure carries the beyond-end-of-media annotation.
    pub fn is_beyond_eof(self) -> bool {
        matches!(self, Self::Io { beyond_eof: true })
    }
}

/// A non-fatal failure attached to the inode being processed.
#[derive(Debug, Clone)]
pub struct InodeFailure {
    /// Failure classification.
    pub kind: ErrorKind,
    /// Short operator-facing message, appended to the inode's history.
    pub msg: String,
}

impl InodeFailure {
    /// Builds a failure from a raw I/O error observed while reading the
    /// mount, classifying it in place.
    pub fn from_read(err: &io::Error, what: &str) -> Self {
        Self {
            kind: classify_read(err),
            msg: format!("{what}: {err}"),
        }
    }

    /// Builds a beyond-end-of-media failure.
    pub fn beyond_eof(expected: i64, got: u64) -> Self {
        Self {
            kind: ErrorKind::Io { beyond_eof: true },
            msg: format!("BEYOND_EOF: read {got} of {expected} recorded bytes"),
        }
    }

    /// Builds a hash-kind failure.
    pub fn hash(msg: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Hash,
            msg: msg.into(),
        }
    }

    /// Builds a path-kind failure.
    pub fn path(msg: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Path,
            msg: msg.into(),
        }
    }
}

/// Classifies a raw I/O error observed while reading from the mount.
pub fn classify_read(err: &io::Error) -> ErrorKind {
    match err.kind() {
        io::ErrorKind::NotFound => ErrorKind::Path,
        io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        io::ErrorKind::UnexpectedEof => ErrorKind::Io { beyond_eof: false },
        _ => match err.raw_os_error() {
            Some(libc::EIO) | Some(libc::ENXIO) | Some(libc::ENODEV) => {
                ErrorKind::Io { beyond_eof: false }
            }
            Some(libc::ELOOP) | Some(libc::ENOTDIR) => ErrorKind::Path,
            _ => ErrorKind::Unknown,
        },
    }
}

/// Converts a raw I/O error observed while writing to the content store into
/// the matching fatal error. Store writes never fail an inode: the store
/// being broken stops the worker.
pub fn store_fatal(err: io::Error) -> EngineError {
    match err.raw_os_error() {
        Some(libc::ENOSPC) => EngineError::StoreFull,
        Some(libc::EACCES) | Some(libc::EPERM) => EngineError::StoreAccess(err),
        Some(libc::EXDEV) => EngineError::StoreCrossDevice,
        _ => EngineError::Io(err),
    }
}

/// What to do with an inode after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry within the current batch, without releasing the claim.
    RetryNow,
    /// Release the claim; a later claim cycle may pick the inode up again.
    RetryLater,
    /// Transition to `failed_permanent` and leave the claim pool.
    FailPermanent,
}

/// Decides the fate of an inode after a failure, given the number of
/// attempts recorded so far (including the current one).
///
/// A first hash failure is retried in place: the usual cause is a blob that
/// vanished between staging and linking, and re-staging is cheap. Everything
/// else waits for the next claim cycle until the retry budget runs out.
pub fn decide(kind: ErrorKind, attempts: usize, max_retries: usize) -> RetryDecision {
    if attempts >= max_retries {
        return RetryDecision::FailPermanent;
    }
    match kind {
        ErrorKind::Hash if attempts <= 1 => RetryDecision::RetryNow,
        _ => RetryDecision::RetryLater,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn classify_common_read_errors() {
        let nf = io::Error::from(io::ErrorKind::NotFound);
        assert_eq!(classify_read(&nf), ErrorKind::Path);
        let pd = io::Error::from(io::ErrorKind::PermissionDenied);
        assert_eq!(classify_read(&pd), ErrorKind::Permission);
        let eio = io::Error::from_raw_os_error(libc::EIO);
        assert_eq!(classify_read(&eio), ErrorKind::Io { beyond_eof: false });
        let other = io::Error::other("weird");
        assert_eq!(classify_read(&other), ErrorKind::Unknown);
    }

    #[test]
    fn store_errors_are_fatal() {
        assert!(matches!(
            store_fatal(io::Error::from_raw_os_error(libc::ENOSPC)),
            EngineError::StoreFull
        ));
        assert!(matches!(
            store_fatal(io::Error::from_raw_os_error(libc::EACCES)),
            EngineError::StoreAccess(_)
        ));
        assert!(matches!(
            store_fatal(io::Error::from_raw_os_error(libc::EXDEV)),
            EngineError::StoreCrossDevice
        ));
    }

    #[test]
    fn budget_exhaustion_is_permanent() {
        assert_eq!(
            decide(ErrorKind::Path, 50, 50),
            RetryDecision::FailPermanent
        );
        assert_eq!(
            decide(ErrorKind::Io { beyond_eof: true }, 51, 50),
            RetryDecision::FailPermanent
        );
        assert_eq!(decide(ErrorKind::Path, 3, 50), RetryDecision::RetryLater);
    }

    #[test]
    fn first_hash_failure_retries_in_place() {
        assert_eq!(decide(ErrorKind::Hash, 1, 50), RetryDecision::RetryNow);
        assert_eq!(decide(ErrorKind::Hash, 2, 50), RetryDecision::RetryLater);
    }

    #[test]
    fn db_tags_match_taxonomy() {
        assert_eq!(ErrorKind::Path.as_db_str(), "path_error");
        assert_eq!(
            ErrorKind::Io { beyond_eof: true }.as_db_str(),
            "io_error"
        );
        assert_eq!(ErrorKind::Permission.as_db_str(), "permission_error");
        assert_eq!(ErrorKind::Hash.as_db_str(), "hash_error");
        assert_eq!(ErrorKind::Unknown.as_db_str(), "unknown");
    }
}
