//! # Cachetable and Cachefiles
//!
//! The cachetable maps file ids to open dictionary files. The rollback core
//! consumes a deliberately small slice of it:
//!
//! - lookup by file id (fdelete, fcreate, redirect, descriptor rollback)
//!   or by internal name (load rollback),
//! - `mark_unlink_on_close`: the file must disappear, but not while any
//!   pin (a checkpoint in flight, a live dictionary handle) still
//!   references it, so the unlink is deferred to the last unpin after
//!   close,
//! - a best-effort unlink for files whose cachefile was never opened.
//!
//! ## Unlink Protocol
//!
//! ```text
//!  mark_unlink_on_close      close()           last unpin
//!        │                     │                   │
//!        ▼                     ▼                   ▼
//!   [marked] ────────► [marked, closed] ────► remove_file
//! ```
//!
//! Close with no pins outstanding unlinks immediately. A marked file is
//! unlinked exactly once: the mark is consumed by whichever of close/unpin
//! runs last.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{trace, warn};

use super::tree::FractalTree;
use crate::types::FileId;

pub struct CacheFile {
    file_id: FileId,
    iname: String,
    path: Option<PathBuf>,
    unlink_on_close: AtomicBool,
    closed: AtomicBool,
    pin_count: AtomicU32,
    tree: Mutex<Option<Arc<FractalTree>>>,
}

impl CacheFile {
    fn new(file_id: FileId, iname: String, path: Option<PathBuf>) -> Self {
        Self {
            file_id,
            iname,
            path,
            unlink_on_close: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            pin_count: AtomicU32::new(0),
            tree: Mutex::new(None),
        }
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn iname(&self) -> &str {
        &self.iname
    }

    /// Mark the file for unlink once the last reference is gone. Safe to
    /// call repeatedly; the mark is consumed exactly once.
    pub fn mark_unlink_on_close(&self) {
        trace!(file_id = self.file_id, iname = %self.iname, "unlink on close");
        self.unlink_on_close.store(true, Ordering::Release);
    }

    pub fn is_unlink_on_close(&self) -> bool {
        self.unlink_on_close.load(Ordering::Acquire)
    }

    /// Attach the opened dictionary for this file.
    pub fn set_tree(&self, tree: Arc<FractalTree>) {
        *self.tree.lock() = Some(tree);
    }

    pub fn tree(&self) -> Option<Arc<FractalTree>> {
        self.tree.lock().clone()
    }

    /// Pin against close-time unlink (checkpoint references, dictionary
    /// handles).
    pub fn pin(&self) {
        self.pin_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn unpin(&self) {
        let prev = self.pin_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unpin called on unpinned cachefile");

        if prev == 1 && self.closed.load(Ordering::Acquire) {
            if let Err(err) = self.finalize() {
                warn!(file_id = self.file_id, %err, "deferred unlink failed");
            }
        }
    }

    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    /// Unlink the backing file if marked. Runs once the file is closed and
    /// unpinned.
    fn finalize(&self) -> Result<()> {
        if !self.unlink_on_close.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let Some(path) = &self.path else {
            return Ok(());
        };

        match fs::remove_file(path) {
            Ok(()) => {
                trace!(file_id = self.file_id, path = %path.display(), "unlinked");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err)
                .wrap_err_with(|| format!("failed to unlink '{}'", path.display())),
        }
    }
}

pub struct Cachetable {
    base_dir: Option<PathBuf>,
    files: Mutex<HashMap<FileId, Arc<CacheFile>>>,
}

impl Default for Cachetable {
    fn default() -> Self {
        Self::new()
    }
}

impl Cachetable {
    /// A cachetable with no backing directory; unlinks become no-ops.
    pub fn new() -> Self {
        Self {
            base_dir: None,
            files: Mutex::new(HashMap::new()),
        }
    }

    /// A cachetable whose inames resolve under `dir`.
    pub fn with_base_dir<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            base_dir: Some(dir.as_ref().to_path_buf()),
            files: Mutex::new(HashMap::new()),
        }
    }

    /// Open a cachefile for `file_id` under the internal name `iname`.
    pub fn open(&self, file_id: FileId, iname: &str) -> Result<Arc<CacheFile>> {
        let mut files = self.files.lock();
        ensure!(
            !files.contains_key(&file_id),
            "file {file_id} is already open"
        );

        let path = self.base_dir.as_ref().map(|dir| dir.join(iname));
        let cf = Arc::new(CacheFile::new(file_id, iname.to_string(), path));
        files.insert(file_id, Arc::clone(&cf));
        Ok(cf)
    }

    pub fn of_fileid(&self, file_id: FileId) -> Option<Arc<CacheFile>> {
        self.files.lock().get(&file_id).cloned()
    }

    pub fn of_iname(&self, iname: &str) -> Option<Arc<CacheFile>> {
        self.files
            .lock()
            .values()
            .find(|cf| cf.iname == iname)
            .cloned()
    }

    /// Close a cachefile. With no pins outstanding the close finalizes
    /// immediately; otherwise the last unpin does.
    pub fn close(&self, file_id: FileId) -> Result<()> {
        let Some(cf) = self.files.lock().remove(&file_id) else {
            return Ok(());
        };

        cf.closed.store(true, Ordering::Release);
        if cf.pin_count() == 0 {
            cf.finalize()?;
        }
        Ok(())
    }

    /// Unlink `iname` directly, tolerating its absence. Used when a file
    /// was created on disk but its cachefile never opened.
    pub fn unlink_if_exists(&self, iname: &str) -> Result<()> {
        let Some(dir) = &self.base_dir else {
            return Ok(());
        };

        let path = dir.join(iname);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).wrap_err_with(|| format!("failed to unlink '{}'", path.display()))
            }
        }
    }
}
