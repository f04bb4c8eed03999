//! The commit-once content store.
//!
//! Blobs live at `by-hash/<aa>/<bb>/<hex>` where `hex` is the fingerprint of
//! the content and `aa`/`bb` its first two byte pairs. At most one physical
//! copy per fingerprint is ever stored: content is staged to a temp file on
//! the same filesystem, then linked into place with a no-clobber operation.
//! Losing the race against another worker is not an error.

use crate::error::{EngineError, Result, store_fatal};
use std::ffi::CString;
use std::fs::{self, File};
use std::io::{self, Write};
use std::mem::MaybeUninit;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Name of the staging directory under the store root.
const TMP_DIR: &str = "tmp";

/// Handle on the `by-hash` tree.
#[derive(Debug, Clone)]
pub struct CasStore {
    root: PathBuf,
}

/// A blob staged on the store's filesystem, pending commit.
///
/// The backing file is removed on drop, so an abandoned stage (error path,
/// worker shutdown) leaves nothing behind.
#[derive(Debug)]
pub struct Stage {
    path: PathBuf,
    file: Option<File>,
}

impl Stage {
    /// Appends content bytes.
    pub fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.file.as_mut().expect("stage already closed").write_all(buf)
    }

    /// Flushes the staged bytes to stable storage and closes the file.
    fn finish(&mut self) -> io::Result<()> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        Ok(())
    }
}

impl Drop for Stage {
    fn drop(&mut self) {
        self.file.take();
        let _ = fs::remove_file(&self.path);
    }
}

impl CasStore {
    /// Opens the store, creating the root and staging directory if needed.
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root.join(TMP_DIR)).map_err(store_fatal)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Returns the store root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the destination path of a fingerprint.
    pub fn blob_path(&self, hex: &str) -> PathBuf {
        self.root.join(&hex[..2]).join(&hex[2..4]).join(hex)
    }

    /// Tells whether a fingerprint is already stored.
    pub fn contains(&self, hex: &str) -> bool {
        self.blob_path(hex).exists()
    }

    /// Returns the on-disk hardlink count of a stored blob.
    pub fn observed_links(&self, hex: &str) -> io::Result<u64> {
        Ok(fs::metadata(self.blob_path(hex))?.nlink())
    }

    /// Creates a staging file on the store's filesystem.
    pub fn stage(&self) -> Result<Stage> {
        let path = self
            .root
            .join(TMP_DIR)
            .join(format!("{}.tmp", Uuid::new_v4().simple()));
        let file = File::create(&path).map_err(store_fatal)?;
        Ok(Stage {
            path,
            file: Some(file),
        })
    }

    /// Commits a staged blob under its fingerprint.
    ///
    /// Returns `true` when this call stored a new physical copy, `false`
    /// when the content already existed (including losing a commit race to
    /// another worker). Either way the staging file is gone afterwards.
    pub fn commit(&self, mut stage: Stage, hex: &str) -> Result<bool> {
        let dest = self.blob_path(hex);
        if dest.exists() {
            // Content already stored; the drop of `stage` removes the temp
            return Ok(false);
        }
        stage.finish().map_err(store_fatal)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(store_fatal)?;
        }
        // No-clobber: a link never replaces an existing destination, so a
        // lost race surfaces as AlreadyExists rather than an overwrite
        match fs::hard_link(&stage.path, &dest) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(store_fatal(e)),
        }
    }

    /// Removes leftover staging files from an earlier crash.
    ///
    /// Staged content is garbage by construction: the database only ever
    /// references blobs that were fully committed.
    pub fn sweep_tmp(&self) -> io::Result<usize> {
        let mut n = 0;
        for ent in fs::read_dir(self.root.join(TMP_DIR))? {
            let ent = ent?;
            if ent.file_type()?.is_file() {
                fs::remove_file(ent.path())?;
                n += 1;
            }
        }
        Ok(n)
    }

    /// Returns the free space in bytes on the store's filesystem.
    pub fn free_space(&self) -> Result<u64> {
        let path = CString::new(self.root.as_os_str().as_bytes())
            .map_err(|_| EngineError::StoreAccess(io::Error::other("NUL in store path")))?;
        let mut out: libc::statvfs = unsafe { MaybeUninit::zeroed().assume_init() };
        let ret = unsafe { libc::statvfs(path.as_ptr(), &mut out) };
        if ret < 0 {
            return Err(EngineError::Io(io::Error::last_os_error()));
        }
        Ok(out.f_bavail as u64 * out.f_frsize as u64)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn store() -> (tempfile::TempDir, CasStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CasStore::open(&dir.path().join("by-hash")).unwrap();
        (dir, store)
    }

    fn stage_bytes(store: &CasStore, content: &[u8]) -> (Stage, String) {
        let mut stage = store.stage().unwrap();
        stage.write_all(content).unwrap();
        let hex = blake3::hash(content).to_hex().to_string();
        (stage, hex)
    }

    #[test]
    fn blob_path_fan_out() {
        let (_dir, store) = store();
        let hex = blake3::hash(b"hello").to_hex().to_string();
        let p = store.blob_path(&hex);
        let rel = p.strip_prefix(store.root()).unwrap();
        assert_eq!(
            rel,
            Path::new(&hex[..2]).join(&hex[2..4]).join(&hex).as_path()
        );
        assert_eq!(hex.len(), 64);
    }

    #[test]
    fn commit_stores_once() {
        let (_dir, store) = store();
        let (stage, hex) = stage_bytes(&store, b"hello");
        assert!(store.commit(stage, &hex).unwrap());
        assert!(store.contains(&hex));
        assert_eq!(fs::read(store.blob_path(&hex)).unwrap(), b"hello");
        // Second commit of the same content is a no-op, not an error
        let (stage, _) = stage_bytes(&store, b"hello");
        assert!(!store.commit(stage, &hex).unwrap());
        assert_eq!(store.observed_links(&hex).unwrap(), 1);
    }

    #[test]
    fn lost_race_discards_temp() {
        let (_dir, store) = store();
        let (first, hex) = stage_bytes(&store, b"racy");
        let (second, _) = stage_bytes(&store, b"racy");
        assert!(store.commit(first, &hex).unwrap());
        // The destination appeared between the second worker's stage and
        // commit; the second commit must lose cleanly
        assert!(!store.commit(second, &hex).unwrap());
        assert_eq!(store.observed_links(&hex).unwrap(), 1);
        assert_eq!(store.sweep_tmp().unwrap(), 0);
    }

    #[test]
    fn abandoned_stage_cleans_up() {
        let (_dir, store) = store();
        let (stage, _) = stage_bytes(&store, b"leftover");
        drop(stage);
        assert_eq!(store.sweep_tmp().unwrap(), 0);
    }

    #[test]
    fn sweep_removes_crash_leftovers() {
        let (_dir, store) = store();
        // Simulate a crash: a temp file nobody owns
        fs::write(store.root().join(TMP_DIR).join("dead.tmp"), b"x").unwrap();
        assert_eq!(store.sweep_tmp().unwrap(), 1);
    }

    #[test]
    fn free_space_is_nonzero() {
        let (_dir, store) = store();
        assert!(store.free_space().unwrap() > 0);
    }
}
