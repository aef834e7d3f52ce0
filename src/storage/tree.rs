//! # Fractal Tree Message Seam
//!
//! The rollback core talks to the keyed store exclusively through messages
//! applied at the tree root. This module provides the message vocabulary
//! and an in-memory tree that honors the message contract: provisional
//! versions belong to the outermost xid that wrote them until a commit- or
//! abort-side message settles their fate.
//!
//! ```text
//!   insert/delete (normal path)      rollback application
//!             │                              │
//!             ▼                              ▼
//!      provisional ops ◄──── AbortAny ─── dropped
//!             │
//!      CommitAny / CommitBroadcast*
//!             │
//!             ▼
//!        committed map
//! ```
//!
//! The on-disk fractal tree with its buffered message paths is a different
//! component; everything the rollback core observes (checkpoint LSN for
//! the recovery guard, root-xid reset on resetting broadcasts, descriptor
//! updates, redirect linkage) behaves identically here.

use std::collections::BTreeMap;

use eyre::{ensure, Result};
use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::trace;

use crate::types::{FileId, Lsn, Xid, XidStack};

/// Message kinds the rollback core emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgKind {
    CommitAny,
    AbortAny,
    CommitBroadcastAll,
    CommitBroadcastTxn,
    AbortBroadcastTxn,
}

impl MsgKind {
    pub fn is_broadcast(self) -> bool {
        matches!(
            self,
            MsgKind::CommitBroadcastAll | MsgKind::CommitBroadcastTxn | MsgKind::AbortBroadcastTxn
        )
    }
}

/// A message addressed to the tree root. Broadcast messages carry an empty
/// key. The message sequence number is always zero on this path; root
/// application assigns real sequence numbers downstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeMsg {
    pub kind: MsgKind,
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
    pub xids: XidStack,
    pub msn: u64,
}

impl TreeMsg {
    pub fn new(kind: MsgKind, key: Vec<u8>, value: Option<Vec<u8>>, xids: XidStack) -> Self {
        debug_assert!(!kind.is_broadcast() || key.is_empty());
        Self {
            kind,
            key,
            value,
            xids,
            msn: 0,
        }
    }
}

/// Garbage-collection context attached to every root message. Provisional
/// update records older than the oldest referenced xid may be promoted
/// implicitly, but never during recovery, when the estimate cannot be
/// trusted yet.
#[derive(Debug, Clone, Copy)]
pub struct GcInfo {
    pub oldest_referenced_xid: Xid,
    pub can_promote: bool,
}

#[derive(Debug, Clone)]
enum ProvisionalOp {
    Insert { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

impl ProvisionalOp {
    fn key(&self) -> &[u8] {
        match self {
            ProvisionalOp::Insert { key, .. } => key,
            ProvisionalOp::Delete { key } => key,
        }
    }
}

#[derive(Debug, Default)]
struct TreeState {
    checkpoint_lsn: Lsn,
    root_xid_that_created: Xid,
    descriptor: Vec<u8>,
    committed: BTreeMap<Vec<u8>, Vec<u8>>,
    provisional: HashMap<Xid, Vec<ProvisionalOp>>,
    messages: Vec<TreeMsg>,
    redirected_to: Option<FileId>,
}

impl TreeState {
    fn promote(committed: &mut BTreeMap<Vec<u8>, Vec<u8>>, op: ProvisionalOp) {
        match op {
            ProvisionalOp::Insert { key, value } => {
                committed.insert(key, value);
            }
            ProvisionalOp::Delete { key } => {
                committed.remove(&key);
            }
        }
    }
}

pub struct FractalTree {
    file_id: FileId,
    state: Mutex<TreeState>,
}

impl FractalTree {
    pub fn new(file_id: FileId) -> Self {
        Self {
            file_id,
            state: Mutex::new(TreeState::default()),
        }
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    /// LSN of the last checkpoint that includes this tree. Operations at or
    /// below it are already durably applied.
    pub fn checkpoint_lsn(&self) -> Lsn {
        self.state.lock().checkpoint_lsn
    }

    pub fn set_checkpoint_lsn(&self, lsn: Lsn) {
        self.state.lock().checkpoint_lsn = lsn;
    }

    pub fn root_xid_that_created(&self) -> Xid {
        self.state.lock().root_xid_that_created
    }

    /// Re-attribute the tree definition, e.g. after a schema change commits
    /// through a resetting broadcast.
    pub fn set_root_xid_that_created(&self, xid: Xid) {
        self.state.lock().root_xid_that_created = xid;
    }

    pub fn descriptor(&self) -> Vec<u8> {
        self.state.lock().descriptor.clone()
    }

    pub fn update_descriptor(&self, descriptor: &[u8]) {
        self.state.lock().descriptor = descriptor.to_vec();
    }

    pub fn redirected_to(&self) -> Option<FileId> {
        self.state.lock().redirected_to
    }

    pub fn set_redirected_to(&self, file_id: FileId) {
        self.state.lock().redirected_to = Some(file_id);
    }

    /// Normal write path: record a provisional insert owned by the
    /// outermost xid of `xids`.
    pub fn insert(&self, key: &[u8], value: &[u8], xids: &XidStack) {
        let mut state = self.state.lock();
        state
            .provisional
            .entry(xids.outermost())
            .or_default()
            .push(ProvisionalOp::Insert {
                key: key.to_vec(),
                value: value.to_vec(),
            });
    }

    /// Normal write path: record a provisional delete owned by the
    /// outermost xid of `xids`.
    pub fn delete(&self, key: &[u8], xids: &XidStack) {
        let mut state = self.state.lock();
        state
            .provisional
            .entry(xids.outermost())
            .or_default()
            .push(ProvisionalOp::Delete { key: key.to_vec() });
    }

    /// Apply a commit- or abort-side message at the root.
    pub fn put_message_at_root(&self, msg: TreeMsg, gc_info: &GcInfo) {
        trace!(
            file_id = self.file_id,
            kind = ?msg.kind,
            oldest_referenced = gc_info.oldest_referenced_xid,
            can_promote = gc_info.can_promote,
            "root message"
        );

        let mut state = self.state.lock();
        let owner = msg.xids.outermost();

        match msg.kind {
            MsgKind::CommitAny => {
                let mut taken = Vec::new();
                if let Some(ops) = state.provisional.get_mut(&owner) {
                    let mut slot = 0;
                    while slot < ops.len() {
                        if ops[slot].key() == msg.key.as_slice() {
                            taken.push(ops.remove(slot));
                        } else {
                            slot += 1;
                        }
                    }
                }
                for op in taken {
                    TreeState::promote(&mut state.committed, op);
                }
            }
            MsgKind::AbortAny => {
                if let Some(ops) = state.provisional.get_mut(&owner) {
                    ops.retain(|op| op.key() != msg.key.as_slice());
                }
            }
            MsgKind::CommitBroadcastTxn => {
                if let Some(ops) = state.provisional.remove(&owner) {
                    for op in ops {
                        TreeState::promote(&mut state.committed, op);
                    }
                }
            }
            MsgKind::CommitBroadcastAll => {
                let mut owners: Vec<Xid> = state.provisional.keys().copied().collect();
                owners.sort_unstable();
                for owner in owners {
                    if let Some(ops) = state.provisional.remove(&owner) {
                        for op in ops {
                            TreeState::promote(&mut state.committed, op);
                        }
                    }
                }
            }
            MsgKind::AbortBroadcastTxn => {
                state.provisional.remove(&owner);
            }
        }

        state.messages.push(msg);
    }

    /// Committed contents in key order.
    pub fn scan(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.state
            .lock()
            .committed
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.state.lock().committed.get(key).cloned()
    }

    /// Outstanding provisional operations owned by `xid`.
    pub fn provisional_count(&self, xid: Xid) -> usize {
        self.state
            .lock()
            .provisional
            .get(&xid)
            .map_or(0, |ops| ops.len())
    }

    /// Messages applied at the root, in order.
    pub fn messages(&self) -> Vec<TreeMsg> {
        self.state.lock().messages.clone()
    }
}

/// Undo a dictionary redirect: `old` must currently point at `new`; the
/// linkage is removed so readers resolve `old` directly again.
pub fn dictionary_redirect_abort(old: &FractalTree, new: &FractalTree) -> Result<()> {
    let mut state = old.state.lock();
    ensure!(
        state.redirected_to == Some(new.file_id()),
        "dictionary {} is not redirected to {}",
        old.file_id(),
        new.file_id()
    );
    state.redirected_to = None;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gc() -> GcInfo {
        GcInfo {
            oldest_referenced_xid: 1,
            can_promote: true,
        }
    }

    #[test]
    fn abort_any_drops_the_provisional_version() {
        let tree = FractalTree::new(7);
        let xids = XidStack::root(4);
        tree.insert(b"k", b"v", &xids);
        assert_eq!(tree.provisional_count(4), 1);

        tree.put_message_at_root(
            TreeMsg::new(MsgKind::AbortAny, b"k".to_vec(), None, xids),
            &gc(),
        );

        assert_eq!(tree.provisional_count(4), 0);
        assert!(tree.get(b"k").is_none());
    }

    #[test]
    fn commit_any_promotes_only_the_addressed_key() {
        let tree = FractalTree::new(7);
        let xids = XidStack::root(4);
        tree.insert(b"a", b"1", &xids);
        tree.insert(b"b", b"2", &xids);

        tree.put_message_at_root(
            TreeMsg::new(MsgKind::CommitAny, b"a".to_vec(), None, xids.clone()),
            &gc(),
        );

        assert_eq!(tree.get(b"a"), Some(b"1".to_vec()));
        assert!(tree.get(b"b").is_none());
        assert_eq!(tree.provisional_count(4), 1);
    }

    #[test]
    fn broadcast_commit_promotes_in_write_order() {
        let tree = FractalTree::new(7);
        let xids = XidStack::root(4);
        tree.insert(b"k", b"old", &xids);
        tree.delete(b"k", &xids);
        tree.insert(b"k", b"new", &xids);

        tree.put_message_at_root(
            TreeMsg::new(MsgKind::CommitBroadcastTxn, Vec::new(), None, xids),
            &gc(),
        );

        assert_eq!(tree.get(b"k"), Some(b"new".to_vec()));
    }

    #[test]
    fn abort_broadcast_leaves_other_owners_alone() {
        let tree = FractalTree::new(7);
        let ours = XidStack::root(4);
        let theirs = XidStack::root(9);
        tree.insert(b"k", b"v", &ours);
        tree.insert(b"q", b"w", &theirs);

        tree.put_message_at_root(
            TreeMsg::new(MsgKind::AbortBroadcastTxn, Vec::new(), None, ours),
            &gc(),
        );

        assert_eq!(tree.provisional_count(4), 0);
        assert_eq!(tree.provisional_count(9), 1);
    }

    #[test]
    fn redirect_abort_clears_the_linkage() {
        let old = FractalTree::new(1);
        let new = FractalTree::new(2);
        old.set_redirected_to(2);

        dictionary_redirect_abort(&old, &new).unwrap();
        assert_eq!(old.redirected_to(), None);

        assert!(dictionary_redirect_abort(&old, &new).is_err());
    }

    #[test]
    fn scan_returns_key_order() {
        let tree = FractalTree::new(7);
        let xids = XidStack::root(4);
        tree.insert(b"b", b"2", &xids);
        tree.insert(b"a", b"1", &xids);
        tree.put_message_at_root(
            TreeMsg::new(MsgKind::CommitBroadcastTxn, Vec::new(), None, xids),
            &gc(),
        );

        let rows = tree.scan();
        assert_eq!(
            rows,
            vec![
                (b"a".to_vec(), b"1".to_vec()),
                (b"b".to_vec(), b"2".to_vec())
            ]
        );
    }
}
