//! # Transaction Context
//!
//! A [`Txn`] is the owner of everything rollback application touches: the
//! xid stack, the recovery flag, the fsync watermark for unlink-bearing
//! commits, the table of dictionaries the transaction opened, and the
//! summary of its rollback chain. The [`Logger`] bundles the process-wide
//! collaborators (WAL, cachetable, transaction system, rollback store)
//! so entry functions reach them through the transaction instead of
//! through globals.
//!
//! ## Rollback Chain Summary
//!
//! ```text
//! RollChain {
//!   current       ──► newest node of the txn's own chain (BLOCK_NONE: empty)
//!   num_nodes     ──► nodes in that chain (head has sequence 0)
//!   spilled_head  ──► oldest node of a spliced child chain
//!   spilled_tail  ──► newest node of a spliced child chain
//! }
//! ```
//!
//! The summary is kept in step with the walker as nodes drain, so a
//! [`Txn::close`] after application (or after a mid-apply failure) never
//! frees a node twice.
//!
//! ## Nested Commit
//!
//! [`Txn::commit_child`] splices a finished child's chain into the parent:
//! the child's nodes become the parent's spilled chain and a single
//! `RollInclude` entry in the parent's own chain records the bounds. When
//! the parent later commits or aborts, the walker applies the child's
//! entries with the same side (commit or abort) as the parent's.

use std::sync::Arc;

use eyre::{ensure, Result};
use smallvec::SmallVec;

use crate::mvcc::{ReadView, TrxSys};
use crate::rollback::entry::RollEntry;
use crate::rollback::log::{RollbackLogNode, RollbackStore};
use crate::storage::{Cachetable, FractalTree, Wal};
use crate::types::{BlockNo, FileId, Lsn, Xid, XidPair, XidStack, BLOCK_NONE};

/// Process-wide collaborators reached through a transaction.
pub struct Logger {
    wal: Arc<Wal>,
    cachetable: Arc<Cachetable>,
    trx_sys: Arc<TrxSys>,
    rollback_store: Arc<RollbackStore>,
}

impl Logger {
    pub fn new(
        wal: Arc<Wal>,
        cachetable: Arc<Cachetable>,
        trx_sys: Arc<TrxSys>,
        rollback_store: Arc<RollbackStore>,
    ) -> Self {
        Self {
            wal,
            cachetable,
            trx_sys,
            rollback_store,
        }
    }

    pub fn wal(&self) -> &Arc<Wal> {
        &self.wal
    }

    pub fn cachetable(&self) -> &Arc<Cachetable> {
        &self.cachetable
    }

    pub fn trx_sys(&self) -> &Arc<TrxSys> {
        &self.trx_sys
    }

    pub fn rollback_store(&self) -> &Arc<RollbackStore> {
        &self.rollback_store
    }
}

/// Summary of a transaction's rollback chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollChain {
    pub current: BlockNo,
    pub num_nodes: u64,
    pub spilled_head: BlockNo,
    pub spilled_tail: BlockNo,
}

impl Default for RollChain {
    fn default() -> Self {
        Self {
            current: BLOCK_NONE,
            num_nodes: 0,
            spilled_head: BLOCK_NONE,
            spilled_tail: BLOCK_NONE,
        }
    }
}

impl RollChain {
    pub fn is_empty(&self) -> bool {
        self.current == BLOCK_NONE
            && self.spilled_head == BLOCK_NONE
            && self.spilled_tail == BLOCK_NONE
    }
}

pub struct Txn {
    id: Xid,
    xids: XidStack,
    for_recovery: bool,
    autocommit_non_locking: bool,
    do_fsync_lsn: Lsn,
    open_fts: SmallVec<[Arc<FractalTree>; 8]>,
    roll: RollChain,
    read_view: Arc<ReadView>,
    logger: Arc<Logger>,
}

impl Txn {
    /// Begin a root transaction. An id of 0 denotes a non-locking reader
    /// that never acquired one.
    pub fn begin(logger: Arc<Logger>, id: Xid) -> Self {
        Self::with_recovery(logger, id, false)
    }

    /// Begin a transaction replaying the recovery log. Missing files are
    /// tolerated on this path.
    pub fn begin_for_recovery(logger: Arc<Logger>, id: Xid) -> Self {
        Self::with_recovery(logger, id, true)
    }

    fn with_recovery(logger: Arc<Logger>, id: Xid, for_recovery: bool) -> Self {
        let xids = if id > 0 {
            XidStack::root(id)
        } else {
            XidStack::new()
        };
        Self {
            id,
            xids,
            for_recovery,
            autocommit_non_locking: false,
            do_fsync_lsn: 0,
            open_fts: SmallVec::new(),
            roll: RollChain::default(),
            read_view: Arc::new(ReadView::new()),
            logger,
        }
    }

    /// Begin a child nested inside this transaction.
    pub fn begin_child(&self, id: Xid) -> Self {
        let mut xids = self.xids.clone();
        xids.push(id);
        Self {
            id,
            xids,
            for_recovery: self.for_recovery,
            autocommit_non_locking: false,
            do_fsync_lsn: 0,
            open_fts: SmallVec::new(),
            roll: RollChain::default(),
            read_view: Arc::new(ReadView::new()),
            logger: Arc::clone(&self.logger),
        }
    }

    pub fn id(&self) -> Xid {
        self.id
    }

    /// Chain owner identity: outermost ancestor paired with this txn's own
    /// xid.
    pub fn id_pair(&self) -> XidPair {
        XidPair::child_of(self.xids.outermost(), self.id)
    }

    pub fn xids(&self) -> &XidStack {
        &self.xids
    }

    pub fn for_recovery(&self) -> bool {
        self.for_recovery
    }

    pub fn logger(&self) -> &Arc<Logger> {
        &self.logger
    }

    pub fn do_fsync_lsn(&self) -> Lsn {
        self.do_fsync_lsn
    }

    /// LSN of this transaction's commit record; the unlink-bearing commit
    /// paths flush up to it before any file may disappear.
    pub fn set_do_fsync_lsn(&mut self, lsn: Lsn) {
        self.do_fsync_lsn = lsn;
    }

    pub fn set_autocommit_non_locking(&mut self, yes: bool) {
        self.autocommit_non_locking = yes;
    }

    pub fn roll(&self) -> &RollChain {
        &self.roll
    }

    pub fn roll_mut(&mut self) -> &mut RollChain {
        &mut self.roll
    }

    pub fn read_view(&self) -> &Arc<ReadView> {
        &self.read_view
    }

    /// Open (or reuse) this transaction's read view.
    pub fn open_read_view(&self) {
        self.logger
            .trx_sys()
            .view_open(&self.read_view, self.id, self.autocommit_non_locking);
    }

    pub fn close_read_view(&self) {
        self.logger.trx_sys().view_close(&self.read_view);
    }

    /// Note a dictionary opened by this transaction. The table is kept
    /// ordered by file id for binary search.
    pub fn note_open_ft(&mut self, ft: Arc<FractalTree>) {
        let slot = self
            .open_fts
            .binary_search_by_key(&ft.file_id(), |t| t.file_id());
        match slot {
            Ok(_) => panic!("dictionary {} opened twice by txn {}", ft.file_id(), self.id),
            Err(slot) => self.open_fts.insert(slot, ft),
        }
    }

    /// Look up an opened dictionary by file id.
    pub fn open_ft(&self, file_id: FileId) -> Option<Arc<FractalTree>> {
        self.open_fts
            .binary_search_by_key(&file_id, |t| t.file_id())
            .ok()
            .map(|slot| Arc::clone(&self.open_fts[slot]))
    }

    /// Append an entry to this transaction's rollback chain, growing a new
    /// node when the current one is full.
    pub fn roll_log(&mut self, entry: RollEntry) -> Result<()> {
        let store = Arc::clone(self.logger.rollback_store());

        if self.roll.current != BLOCK_NONE {
            let mut log = store.pin(self.roll.current)?;
            if log.node().entry_count() < crate::config::ROLLBACK_NODE_ENTRY_CAP {
                log.node_mut().push_entry(entry);
                return Ok(());
            }
        }

        let block = store.alloc_block();
        let mut node =
            RollbackLogNode::new(block, self.roll.num_nodes, self.id_pair(), self.roll.current);
        node.push_entry(entry);
        store.insert(node)?;

        self.roll.current = block;
        self.roll.num_nodes += 1;
        Ok(())
    }

    /// Commit a finished child into this transaction: the child's chain
    /// becomes this transaction's spilled chain, recorded as one
    /// `RollInclude` entry.
    pub fn commit_child(&mut self, mut child: Txn) -> Result<()> {
        ensure!(
            self.roll.spilled_head == BLOCK_NONE && self.roll.spilled_tail == BLOCK_NONE,
            "txn {} already carries a spliced child chain",
            self.id
        );
        ensure!(
            child.roll.spilled_head == BLOCK_NONE && child.roll.spilled_tail == BLOCK_NONE,
            "child txn {} still carries a spliced chain of its own",
            child.id
        );

        child.logger.trx_sys().view_unregister(&child.read_view);

        if child.roll.current == BLOCK_NONE {
            return Ok(());
        }

        let store = Arc::clone(self.logger.rollback_store());

        // The head is the sequence-0 node at the far end of the chain.
        let mut head = child.roll.current;
        loop {
            let log = store.pin(head)?;
            let previous = log.node().previous();
            if previous == BLOCK_NONE {
                break;
            }
            head = previous;
        }

        let entry = RollEntry::RollInclude {
            xid: child.id_pair(),
            num_nodes: child.roll.num_nodes,
            spilled_head: head,
            spilled_tail: child.roll.current,
        };

        self.roll.spilled_head = head;
        self.roll.spilled_tail = child.roll.current;
        child.roll = RollChain::default();

        self.roll_log(entry)
    }

    /// Tear the transaction down, freeing whatever is left of its chain.
    /// After a successful apply the chain summary is all-`BLOCK_NONE` and
    /// this frees nothing.
    pub fn close(mut self) -> Result<()> {
        let store = Arc::clone(self.logger.rollback_store());

        let mut next = self.roll.current;
        while next != BLOCK_NONE {
            let log = store.pin(next)?;
            next = log.node().previous();
            log.unpin_and_remove();
        }
        self.roll.current = BLOCK_NONE;
        self.roll.num_nodes = 0;

        let mut next = self.roll.spilled_tail;
        while next != BLOCK_NONE {
            let log = store.pin(next)?;
            next = log.node().previous();
            log.unpin_and_remove();
        }
        self.roll.spilled_head = BLOCK_NONE;
        self.roll.spilled_tail = BLOCK_NONE;

        self.logger.trx_sys().view_unregister(&self.read_view);
        Ok(())
    }
}
