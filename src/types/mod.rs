//! # Engine Identifier Types
//!
//! Canonical identifier types shared by the rollback and MVCC subsystems.
//! Ids are plain 64-bit (32-bit for files) integers with a documented range
//! rather than newtypes.
//!
//! ## Identifier Ranges
//!
//! - `Xid`: transaction id, monotonically assigned; `0` is reserved for
//!   "no transaction" (non-locking readers prepare views with creator 0)
//! - `FileId`: dictionary file number, assigned by the cachetable
//! - `Lsn`: log sequence number; `0` means "not a recovery replay"
//! - `BlockNo`: rollback log block number; `BLOCK_NONE` terminates a chain
//!
//! ## Nested Transactions
//!
//! A nested transaction carries the full stack of its ancestors' xids,
//! outermost first. Messages emitted into the tree carry the whole stack so
//! that version garbage collection can attribute each change to the
//! innermost live transaction.

use smallvec::SmallVec;

pub type Xid = u64;
pub type FileId = u32;
pub type Lsn = u64;

/// Rollback log block number. Signed so the chain terminator can live
/// outside the valid block range.
pub type BlockNo = i64;

/// Chain terminator for rollback log block references.
pub const BLOCK_NONE: BlockNo = -1;

/// Owner identity of a rollback log chain. For a root transaction both
/// halves are the transaction's own xid; for a child committed into its
/// parent, `parent` is the outermost xid and `child` the child's own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct XidPair {
    pub parent: Xid,
    pub child: Xid,
}

impl XidPair {
    pub fn root(id: Xid) -> Self {
        Self {
            parent: id,
            child: id,
        }
    }

    pub fn child_of(parent: Xid, child: Xid) -> Self {
        Self { parent, child }
    }
}

/// Stack of nested transaction ids, outermost first.
///
/// Most transactions nest at most a level or two, so the backing store is
/// inline until it spills.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XidStack {
    ids: SmallVec<[Xid; 4]>,
}

impl XidStack {
    /// Empty stack, used by transactions that never acquired an id
    /// (read-only non-locking work).
    pub fn new() -> Self {
        Self::default()
    }

    /// Stack holding a single root transaction id.
    pub fn root(id: Xid) -> Self {
        let mut ids = SmallVec::new();
        ids.push(id);
        Self { ids }
    }

    /// Push a child xid onto the stack. The child must be younger than the
    /// current innermost id.
    pub fn push(&mut self, id: Xid) {
        debug_assert!(self.ids.last().map_or(true, |&inner| inner < id));
        self.ids.push(id);
    }

    pub fn pop(&mut self) -> Option<Xid> {
        self.ids.pop()
    }

    /// The outermost (root) xid, or 0 when the stack is empty.
    pub fn outermost(&self) -> Xid {
        self.ids.first().copied().unwrap_or(0)
    }

    /// The innermost (current) xid, or 0 when the stack is empty.
    pub fn innermost(&self) -> Xid {
        self.ids.last().copied().unwrap_or(0)
    }

    pub fn as_slice(&self) -> &[Xid] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
