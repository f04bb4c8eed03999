//! Row types shared by the database layer and the pipeline stages.

use std::fmt;

/// Filesystem-type tag of an inode, as recorded by the enumeration stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsType {
    /// Regular file.
    File,
    /// Directory.
    Dir,
    /// Symbolic link.
    Symlink,
    /// Unix socket.
    Socket,
    /// Named pipe.
    Pipe,
    /// Block device.
    BlockDev,
    /// Character device.
    CharDev,
    /// Anything the enumeration could not identify.
    Unknown,
}

impl FsType {
    /// Returns the single-character tag stored in the database.
    pub fn as_char(self) -> char {
        match self {
            Self::File => 'f',
            Self::Dir => 'd',
            Self::Symlink => 'l',
            Self::Socket => 's',
            Self::Pipe => 'p',
            Self::BlockDev => 'b',
            Self::CharDev => 'c',
            Self::Unknown => '?',
        }
    }

    /// Parses the database tag. Unrecognized tags map to [`FsType::Unknown`].
    pub fn from_char(c: char) -> Self {
        match c {
            'f' => Self::File,
            'd' => Self::Dir,
            'l' => Self::Symlink,
            's' => Self::Socket,
            'p' => Self::Pipe,
            'b' => Self::BlockDev,
            'c' => Self::CharDev,
            _ => Self::Unknown,
        }
    }

    /// Tells whether the inode carries content to be fingerprinted.
    pub fn is_file(self) -> bool {
        self == Self::File
    }
}

impl fmt::Display for FsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// Processing status of an inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Inserted by the loader, not processed yet.
    Pending,
    /// Content committed (files) or materialized (non-files).
    Success,
    /// Failed, eligible for another claim cycle.
    FailedRetryable,
    /// Failed terminally; removed from the claim pool.
    FailedPermanent,
}

impl Status {
    /// Returns the tag stored in the database.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::FailedRetryable => "failed_retryable",
            Self::FailedPermanent => "failed_permanent",
        }
    }

    /// Parses the database tag.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "success" => Some(Self::Success),
            "failed_retryable" => Some(Self::FailedRetryable),
            "failed_permanent" => Some(Self::FailedPermanent),
            _ => None,
        }
    }
}

/// A path row attached to a claimed inode.
///
/// Path bytes are raw: they may contain any byte except NUL, including
/// separators and invalid UTF-8, and must round-trip unchanged.
#[derive(Debug, Clone)]
pub struct PathEntry {
    /// Raw path bytes as recorded on the medium.
    pub path: Vec<u8>,
    /// Set when the loader matched the path against an ignore pattern.
    pub exclude_reason: Option<String>,
}

impl PathEntry {
    /// Tells whether the path is excluded from materialization.
    pub fn is_excluded(&self) -> bool {
        self.exclude_reason.is_some()
    }
}

/// Snapshot of an inode claimed for processing, with its paths attached.
#[derive(Debug, Clone)]
pub struct ClaimedInode {
    /// Inode number on the medium.
    pub ino: i64,
    /// Recorded content size in bytes.
    pub size: i64,
    /// Recorded hardlink count on the medium.
    pub nlink: i64,
    /// Recorded modification time, seconds since the epoch.
    pub mtime: Option<i64>,
    /// Filesystem-type tag.
    pub fs_type: FsType,
    /// Append-only failure history from previous attempts.
    pub errors: Vec<String>,
    /// All paths referencing the inode on its medium.
    pub paths: Vec<PathEntry>,
}

impl ClaimedInode {
    /// Number of failed attempts recorded so far.
    pub fn attempts(&self) -> usize {
        self.errors.len()
    }

    /// Iterates over the paths eligible for materialization.
    pub fn live_paths(&self) -> impl Iterator<Item = &PathEntry> {
        self.paths.iter().filter(|p| !p.is_excluded())
    }
}

/// A row of the `medium` table.
#[derive(Debug, Clone)]
pub struct Medium {
    /// 32-hex-character identity derived from the physical medium.
    pub medium_hash: String,
    /// Operator-assigned label.
    pub medium_human: String,
    /// Health state reported by the imaging stage.
    pub health: String,
    /// Path of the disk image, when one exists.
    pub image_path: Option<String>,
    /// Set when enumeration completed.
    pub enum_done: Option<String>,
    /// Set when the copy engine drained the medium.
    pub copy_done: Option<String>,
    /// Free-form structured problem notes.
    pub problems: serde_json::Value,
}

impl Medium {
    /// Tells whether the image behind the medium is known to be incomplete.
    pub fn is_partial(&self) -> bool {
        self.health == "partial"
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fs_type_tags_round_trip() {
        for c in ['f', 'd', 'l', 's', 'p', 'b', 'c', '?'] {
            assert_eq!(FsType::from_char(c).as_char(), c);
        }
        assert_eq!(FsType::from_char('z'), FsType::Unknown);
    }

    #[test]
    fn status_tags_round_trip() {
        for s in [
            Status::Pending,
            Status::Success,
            Status::FailedRetryable,
            Status::FailedPermanent,
        ] {
            assert_eq!(Status::from_str(s.as_str()), Some(s));
        }
        assert_eq!(Status::from_str("bogus"), None);
    }

    #[test]
    fn live_paths_skips_excluded() {
        let inode = ClaimedInode {
            ino: 1,
            size: 0,
            nlink: 2,
            mtime: None,
            fs_type: FsType::File,
            errors: vec![],
            paths: vec![
                PathEntry {
                    path: b"/keep".to_vec(),
                    exclude_reason: None,
                },
                PathEntry {
                    path: b"/skip".to_vec(),
                    exclude_reason: Some("cache".to_string()),
                },
            ],
        };
        let live: Vec<_> = inode.live_paths().collect();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].path, b"/keep");
    }
}
