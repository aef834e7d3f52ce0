//! # Rollback Chain Walker
//!
//! Drives entry application over a transaction's rollback chain. Entries
//! are applied in reverse insertion order across the whole chain (newest
//! node first, newest entry within each node first), which is the
//! abort-correct order for undo and consistent for commit.
//!
//! ## Walk Protocol
//!
//! For each node, in reverse-chain order:
//!
//! 1. pin the node,
//! 2. verify the owner xid and expected sequence number (a mismatch means
//!    the chain is corrupt and aborts the process),
//! 3. hint a prefetch of the previous node,
//! 4. pop and apply entries newest first, propagating the first error,
//! 5. advance to the previous node, update the transaction's chain
//!    summary, and unpin-and-remove the drained node.
//!
//! The chain summary update in step 5 is what keeps a later [`Txn::close`]
//! from freeing nodes the walk already removed, including the spilled
//! head/tail bounds during a rollinclude subchain walk.
//!
//! On an error from an entry function the pin guard releases the current
//! node back to the store undrained entries and all; nothing is leaked and
//! nothing is removed.

use std::sync::Arc;

use eyre::Result;
use tracing::debug;

use super::apply::{abort_entry, commit_entry};
use super::entry::RollEntry;
use super::log::RollbackLogNode;
use crate::txn::Txn;
use crate::types::{BlockNo, Lsn, XidPair, BLOCK_NONE};

/// Uniform shape of the per-entry dispatch functions.
pub type ApplyFn = fn(&mut Txn, RollEntry, Lsn) -> Result<()>;

/// Finalize every logged effect of `txn`. `oplsn` is zero at runtime and
/// the commit record's LSN during recovery replay.
pub fn commit(txn: &mut Txn, oplsn: Lsn) -> Result<()> {
    apply_txn(txn, oplsn, commit_entry)
}

/// Undo every logged effect of `txn`.
pub fn abort(txn: &mut Txn, oplsn: Lsn) -> Result<()> {
    apply_txn(txn, oplsn, abort_entry)
}

/// Owner xid or sequence mismatch while walking a chain is fatal.
fn verify_contents(node: &RollbackLogNode, owner: XidPair, expected_sequence: u64) {
    assert_eq!(
        node.owner_xid(),
        owner,
        "rollback block {} owned by another transaction",
        node.block_no()
    );
    assert_eq!(
        node.sequence(),
        expected_sequence,
        "rollback block {} out of sequence",
        node.block_no()
    );
}

fn apply_txn(txn: &mut Txn, oplsn: Lsn, func: ApplyFn) -> Result<()> {
    let store = Arc::clone(txn.logger().rollback_store());
    let owner = txn.id_pair();

    let mut last_sequence = txn.roll().num_nodes;
    let mut next = txn.roll().current;

    while next != BLOCK_NONE {
        let mut log = store.pin(next)?;

        assert!(last_sequence > 0, "rollback chain longer than its node count");
        verify_contents(log.node(), owner, last_sequence - 1);
        last_sequence = log.node().sequence();

        store.prefetch_previous(log.node().previous());

        while let Some(entry) = log.node_mut().pop_newest() {
            func(txn, entry, oplsn)?;
        }

        next = log.node().previous();

        // Keep the chain summary in step with the drain so a later close
        // cannot free this node twice.
        txn.roll_mut().current = next;
        txn.roll_mut().num_nodes -= 1;

        debug!(
            block = log.node().block_no(),
            sequence = log.node().sequence(),
            "rollback node drained"
        );
        log.unpin_and_remove();
    }

    debug_assert_eq!(txn.roll().num_nodes, 0);
    debug_assert_eq!(txn.roll().current, BLOCK_NONE);
    debug_assert_eq!(txn.roll().spilled_head, BLOCK_NONE);
    debug_assert_eq!(txn.roll().spilled_tail, BLOCK_NONE);
    Ok(())
}

/// Walk a spliced child chain from its newest node down to its head,
/// applying every entry with the same side (`func`) as the parent's
/// completion.
pub(crate) fn apply_rollinclude(
    txn: &mut Txn,
    xid: XidPair,
    num_nodes: u64,
    spilled_head: BlockNo,
    spilled_tail: BlockNo,
    oplsn: Lsn,
    func: ApplyFn,
) -> Result<()> {
    let store = Arc::clone(txn.logger().rollback_store());

    let mut next = spilled_tail;
    let mut last_sequence = num_nodes;
    let mut found_head = false;

    assert!(next != BLOCK_NONE, "rollinclude with no spilled chain");

    while next != BLOCK_NONE {
        let mut log = store.pin(next)?;

        assert!(last_sequence > 0, "spilled chain longer than its node count");
        verify_contents(log.node(), xid, last_sequence - 1);
        last_sequence = log.node().sequence();

        store.prefetch_previous(log.node().previous());

        while let Some(entry) = log.node_mut().pop_newest() {
            func(txn, entry, oplsn)?;
        }

        if log.node().block_no() == spilled_head {
            assert!(!found_head);
            found_head = true;
            assert_eq!(log.node().sequence(), 0);
        }

        next = log.node().previous();

        // Rewrite the txn's spilled bounds as the chain drains so a later
        // close cannot free these nodes twice.
        txn.roll_mut().spilled_tail = next;
        if found_head {
            assert_eq!(next, BLOCK_NONE);
            txn.roll_mut().spilled_head = next;
        }

        log.unpin_and_remove();
    }

    Ok(())
}
