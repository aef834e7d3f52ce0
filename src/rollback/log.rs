//! # Rollback Log Storage
//!
//! Each transaction owns a persistent chain of rollback log nodes, newest
//! first. A node holds a LIFO list of per-operation entries; the chain is
//! drained once, at commit or abort, and the nodes are removed as they
//! drain.
//!
//! ```text
//!   txn.current ──► [seq 2] ──previous──► [seq 1] ──previous──► [seq 0]
//!                    entries               entries               entries
//!                   (newest first pop)                          (head)
//! ```
//!
//! ## Pin Protocol
//!
//! A node must be pinned before its contents can be read or drained;
//! pinning serializes with concurrent checkpointers in the cache layer.
//! [`RollbackStore::pin`] hands out an exclusive guard: dropping the guard
//! unpins and leaves the node in place (the error path), while
//! [`PinnedLog::unpin_and_remove`] consumes the guard and deletes the node
//! (the drained path). Every exit path therefore releases its pin.

use eyre::{bail, ensure, Result};
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use tracing::trace;

use super::entry::RollEntry;
use crate::types::{BlockNo, XidPair, BLOCK_NONE};

/// One persisted node of a transaction's rollback chain.
#[derive(Debug)]
pub struct RollbackLogNode {
    block_no: BlockNo,
    sequence: u64,
    owner_xid: XidPair,
    previous: BlockNo,
    entries: Vec<RollEntry>,
}

impl RollbackLogNode {
    pub fn new(block_no: BlockNo, sequence: u64, owner_xid: XidPair, previous: BlockNo) -> Self {
        debug_assert!(block_no != BLOCK_NONE);
        Self {
            block_no,
            sequence,
            owner_xid,
            previous,
            entries: Vec::new(),
        }
    }

    pub fn block_no(&self) -> BlockNo {
        self.block_no
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn owner_xid(&self) -> XidPair {
        self.owner_xid
    }

    pub fn previous(&self) -> BlockNo {
        self.previous
    }

    pub fn push_entry(&mut self, entry: RollEntry) {
        self.entries.push(entry);
    }

    /// Pop the most recently logged entry.
    pub fn pop_newest(&mut self) -> Option<RollEntry> {
        self.entries.pop()
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Default)]
struct StoreInner {
    nodes: HashMap<BlockNo, RollbackLogNode>,
    pinned: HashSet<BlockNo>,
    next_block: BlockNo,
}

/// Backing store for rollback log nodes, keyed by block number.
#[derive(Default)]
pub struct RollbackStore {
    inner: Mutex<StoreInner>,
}

impl RollbackStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a fresh block number.
    pub fn alloc_block(&self) -> BlockNo {
        let mut inner = self.inner.lock();
        let block = inner.next_block;
        inner.next_block += 1;
        block
    }

    pub fn insert(&self, node: RollbackLogNode) -> Result<()> {
        let mut inner = self.inner.lock();
        ensure!(
            !inner.nodes.contains_key(&node.block_no()),
            "rollback block {} already exists",
            node.block_no()
        );
        inner.nodes.insert(node.block_no(), node);
        Ok(())
    }

    /// Pin a node for exclusive access. Fails if the block is unknown or
    /// already pinned.
    pub fn pin(&self, block: BlockNo) -> Result<PinnedLog<'_>> {
        let mut inner = self.inner.lock();
        ensure!(
            !inner.pinned.contains(&block),
            "rollback block {block} is already pinned"
        );
        let Some(node) = inner.nodes.remove(&block) else {
            bail!("rollback block {block} not found");
        };
        inner.pinned.insert(block);
        Ok(PinnedLog {
            store: self,
            node: Some(node),
        })
    }

    /// Hint that `block` will be pinned next. The in-memory store has
    /// nothing to fetch; the hint is recorded for trace-level diagnostics.
    pub fn prefetch_previous(&self, block: BlockNo) {
        if block != BLOCK_NONE {
            trace!(block, "prefetch rollback log");
        }
    }

    /// Number of nodes currently stored (pinned nodes included).
    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.nodes.len() + inner.pinned.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, block: BlockNo) -> bool {
        let inner = self.inner.lock();
        inner.nodes.contains_key(&block) || inner.pinned.contains(&block)
    }

    fn unpin(&self, node: RollbackLogNode) {
        let mut inner = self.inner.lock();
        inner.pinned.remove(&node.block_no());
        inner.nodes.insert(node.block_no(), node);
    }

    fn remove_pinned(&self, block: BlockNo) {
        let mut inner = self.inner.lock();
        inner.pinned.remove(&block);
    }
}

/// Exclusive pin on one rollback log node. Dropping the guard unpins the
/// node back into the store; [`unpin_and_remove`] deletes it instead.
///
/// [`unpin_and_remove`]: PinnedLog::unpin_and_remove
pub struct PinnedLog<'a> {
    store: &'a RollbackStore,
    node: Option<RollbackLogNode>,
}

impl PinnedLog<'_> {
    pub fn node(&self) -> &RollbackLogNode {
        self.node.as_ref().expect("pin guard holds a node")
    }

    pub fn node_mut(&mut self) -> &mut RollbackLogNode {
        self.node.as_mut().expect("pin guard holds a node")
    }

    /// Release the pin and delete the node. Used once a node is drained.
    pub fn unpin_and_remove(mut self) {
        if let Some(node) = self.node.take() {
            self.store.remove_pinned(node.block_no());
        }
    }
}

impl Drop for PinnedLog<'_> {
    fn drop(&mut self) {
        if let Some(node) = self.node.take() {
            self.store.unpin(node);
        }
    }
}
