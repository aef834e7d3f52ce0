//! # Write-Ahead Log Adapter
//!
//! The rollback core needs exactly one thing from the log: a guarantee that
//! a given LSN is durable before a file is allowed to disappear. The log
//! fsync was long ago moved to after row-lock release and rollback
//! application, so the unlink paths (fdelete commit, load commit) must
//! request durability themselves; [`Wal::fsync_up_to`] is that request.
//!
//! The adapter tracks two watermarks:
//!
//! ```text
//!   0 ────────────── flushed ───────────── appended
//!         durable            volatile
//! ```
//!
//! `fsync_up_to` is idempotent (a second call for an already-durable LSN
//! does nothing) and refuses to flush past the appended end: a commit
//! record is always appended before rollback application runs, so a
//! request beyond the end means a broken caller, not an I/O condition.

use std::sync::atomic::{AtomicU64, Ordering};

use eyre::{ensure, Result};
use tracing::debug;

use crate::types::Lsn;

#[derive(Debug, Default)]
pub struct Wal {
    appended: AtomicU64,
    flushed: AtomicU64,
    fsync_count: AtomicU64,
}

impl Wal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Note that records up to `lsn` have been appended (volatile).
    pub fn append_to(&self, lsn: Lsn) {
        self.appended.fetch_max(lsn, Ordering::AcqRel);
    }

    /// Note that records up to `lsn` are already durable, e.g. after
    /// recovery replays a prefix of the log.
    pub fn mark_flushed_to(&self, lsn: Lsn) {
        self.appended.fetch_max(lsn, Ordering::AcqRel);
        self.flushed.fetch_max(lsn, Ordering::AcqRel);
    }

    pub fn appended_lsn(&self) -> Lsn {
        self.appended.load(Ordering::Acquire)
    }

    pub fn flushed_lsn(&self) -> Lsn {
        self.flushed.load(Ordering::Acquire)
    }

    /// Number of flushes performed, for diagnostics.
    pub fn fsync_count(&self) -> u64 {
        self.fsync_count.load(Ordering::Acquire)
    }

    /// Make everything up to `lsn` durable. No-op when already flushed.
    pub fn fsync_up_to(&self, lsn: Lsn) -> Result<()> {
        if lsn == 0 || self.flushed_lsn() >= lsn {
            return Ok(());
        }

        let appended = self.appended_lsn();
        ensure!(
            lsn <= appended,
            "cannot fsync to {lsn}: log appended only to {appended}"
        );

        // The log flushes as a whole, not record by record.
        self.flushed.fetch_max(appended, Ordering::AcqRel);
        self.fsync_count.fetch_add(1, Ordering::AcqRel);
        debug!(lsn, appended, "flushed log");

        Ok(())
    }
}
