//! # Rollback Application Integration Tests
//!
//! End-to-end scenarios over the full stack: transactions log entries into
//! the rollback store, commit/abort walks the chain, and the effects land
//! on the tree, the cachetable, and the WAL.

use std::sync::Arc;

use copsedb::rollback::apply;
use copsedb::rollback::log::RollbackLogNode;
use copsedb::types::{XidPair, BLOCK_NONE};
use copsedb::{
    abort, commit, Cachetable, FractalTree, Logger, MsgKind, RollEntry, RollbackStore, Txn,
    TrxSys, Wal,
};

struct Harness {
    logger: Arc<Logger>,
    wal: Arc<Wal>,
    ct: Arc<Cachetable>,
    store: Arc<RollbackStore>,
    trx: Arc<TrxSys>,
}

fn harness() -> Harness {
    harness_with(Cachetable::new())
}

fn harness_with(ct: Cachetable) -> Harness {
    let wal = Arc::new(Wal::new());
    let ct = Arc::new(ct);
    let trx = Arc::new(TrxSys::new());
    let store = Arc::new(RollbackStore::new());
    let logger = Arc::new(Logger::new(
        Arc::clone(&wal),
        Arc::clone(&ct),
        Arc::clone(&trx),
        Arc::clone(&store),
    ));
    Harness {
        logger,
        wal,
        ct,
        store,
        trx,
    }
}

fn cmd_insert(file_id: u32, key: &[u8]) -> RollEntry {
    RollEntry::CmdInsert {
        file_id,
        key: key.to_vec(),
    }
}

/// Insert and durably commit one row through the full apply path: a
/// non-resetting broadcast promotes the provisional version at commit.
fn commit_row(h: &Harness, tree: &Arc<FractalTree>, key: &[u8], value: &[u8]) {
    let id = h.trx.register_rw();
    let mut txn = Txn::begin(Arc::clone(&h.logger), id);
    txn.note_open_ft(Arc::clone(tree));

    tree.insert(key, value, txn.xids());
    txn.roll_log(cmd_insert(tree.file_id(), key)).unwrap();
    txn.roll_log(RollEntry::CmdUpdateBroadcast {
        file_id: tree.file_id(),
        is_resetting: false,
    })
    .unwrap();

    commit(&mut txn, 0).unwrap();
    h.trx.deregister_rw(id);
    txn.close().unwrap();
}

#[test]
fn abort_of_single_insert_emits_one_abort_message() {
    let h = harness();
    let id = h.trx.register_rw();
    let mut txn = Txn::begin(Arc::clone(&h.logger), id);

    let tree = Arc::new(FractalTree::new(7));
    txn.note_open_ft(Arc::clone(&tree));

    tree.insert(b"k", b"v", txn.xids());
    txn.roll_log(cmd_insert(7, b"k")).unwrap();

    abort(&mut txn, 0).unwrap();

    let msgs = tree.messages();
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].kind, MsgKind::AbortAny);
    assert_eq!(msgs[0].key, b"k".to_vec());
    assert_eq!(msgs[0].msn, 0);

    assert!(txn.roll().is_empty());
    assert!(h.store.is_empty());
    assert!(tree.get(b"k").is_none());

    txn.close().unwrap();
}

#[test]
fn abort_restores_the_pre_transaction_state() {
    let h = harness();

    // Pre-existing committed row, committed through a broadcast so the
    // provisional version promotes.
    let tree = Arc::new(FractalTree::new(3));
    commit_row(&h, &tree, b"a", b"1");
    let before = tree.scan();

    // The doomed transaction inserts a key and deletes another.
    let id = h.trx.register_rw();
    let mut txn = Txn::begin(Arc::clone(&h.logger), id);
    txn.note_open_ft(Arc::clone(&tree));

    tree.insert(b"b", b"2", txn.xids());
    txn.roll_log(cmd_insert(3, b"b")).unwrap();
    tree.delete(b"a", txn.xids());
    txn.roll_log(RollEntry::CmdDelete {
        file_id: 3,
        key: b"a".to_vec(),
    })
    .unwrap();

    abort(&mut txn, 0).unwrap();

    assert_eq!(tree.scan(), before);
    assert_eq!(tree.provisional_count(id), 0);
    txn.close().unwrap();
}

#[test]
fn commit_of_delete_promotes_the_tombstone() {
    let h = harness();
    let tree = Arc::new(FractalTree::new(3));
    commit_row(&h, &tree, b"a", b"1");

    let id = h.trx.register_rw();
    let mut txn = Txn::begin(Arc::clone(&h.logger), id);
    txn.note_open_ft(Arc::clone(&tree));
    tree.delete(b"a", txn.xids());
    txn.roll_log(RollEntry::CmdDelete {
        file_id: 3,
        key: b"a".to_vec(),
    })
    .unwrap();

    commit(&mut txn, 0).unwrap();

    // The commit-side delete message is enabled by policy and promotes the
    // tombstone.
    assert!(tree.get(b"a").is_none());
    let msgs = tree.messages();
    assert_eq!(msgs.last().map(|m| m.kind), Some(MsgKind::CommitAny));
    txn.close().unwrap();
}

#[test]
fn nested_rollinclude_abort_walks_the_spliced_chain() {
    let h = harness();
    let parent_id = h.trx.register_rw();
    let child_id = 10;
    let mut parent = Txn::begin(Arc::clone(&h.logger), parent_id);

    let tree = Arc::new(FractalTree::new(7));
    parent.note_open_ft(Arc::clone(&tree));

    // The child's chain: three nodes, head sequence 0, two entries total.
    let child_owner = XidPair::child_of(parent_id, child_id);
    let b0 = h.store.alloc_block();
    let b1 = h.store.alloc_block();
    let b2 = h.store.alloc_block();

    let mut n0 = RollbackLogNode::new(b0, 0, child_owner, BLOCK_NONE);
    n0.push_entry(cmd_insert(7, b"k1"));
    let n1 = RollbackLogNode::new(b1, 1, child_owner, b0);
    let mut n2 = RollbackLogNode::new(b2, 2, child_owner, b1);
    n2.push_entry(cmd_insert(7, b"k2"));
    h.store.insert(n0).unwrap();
    h.store.insert(n1).unwrap();
    h.store.insert(n2).unwrap();

    parent.roll_mut().spilled_head = b0;
    parent.roll_mut().spilled_tail = b2;
    parent
        .roll_log(RollEntry::RollInclude {
            xid: child_owner,
            num_nodes: 3,
            spilled_head: b0,
            spilled_tail: b2,
        })
        .unwrap();

    abort(&mut parent, 0).unwrap();

    // Reverse insertion order across the subchain.
    let msgs = tree.messages();
    assert_eq!(msgs.len(), 2);
    assert_eq!(msgs[0].kind, MsgKind::AbortAny);
    assert_eq!(msgs[0].key, b"k2".to_vec());
    assert_eq!(msgs[1].key, b"k1".to_vec());

    // All four nodes (three spliced + the parent's own) are drained and
    // the chain summary is clean, so close frees nothing twice.
    assert!(h.store.is_empty());
    assert_eq!(parent.roll().spilled_head, BLOCK_NONE);
    assert_eq!(parent.roll().spilled_tail, BLOCK_NONE);
    parent.close().unwrap();
}

#[test]
fn commit_child_then_abort_parent_undoes_the_child() {
    let h = harness();
    let parent_id = h.trx.register_rw();
    let child_id = h.trx.register_rw();

    let mut parent = Txn::begin(Arc::clone(&h.logger), parent_id);
    let tree = Arc::new(FractalTree::new(7));
    parent.note_open_ft(Arc::clone(&tree));

    let mut child = parent.begin_child(child_id);
    tree.insert(b"k", b"v", child.xids());
    child.roll_log(cmd_insert(7, b"k")).unwrap();

    parent.commit_child(child).unwrap();
    abort(&mut parent, 0).unwrap();

    assert!(tree.get(b"k").is_none());
    assert_eq!(tree.provisional_count(parent_id), 0);
    assert!(h.store.is_empty());
    assert!(parent.roll().is_empty());
    parent.close().unwrap();
}

#[test]
fn recovery_replay_below_checkpoint_is_a_no_op() {
    let h = harness();
    let mut txn = Txn::begin_for_recovery(Arc::clone(&h.logger), 4);

    let tree = Arc::new(FractalTree::new(7));
    tree.set_checkpoint_lsn(150);
    txn.note_open_ft(Arc::clone(&tree));

    txn.roll_log(cmd_insert(7, b"k")).unwrap();
    abort(&mut txn, 100).unwrap();

    // The tree already checkpointed past the operation: no message.
    assert!(tree.messages().is_empty());
    assert!(h.store.is_empty());
    txn.close().unwrap();
}

#[test]
fn recovery_replay_above_checkpoint_applies() {
    let h = harness();
    let mut txn = Txn::begin_for_recovery(Arc::clone(&h.logger), 4);

    let tree = Arc::new(FractalTree::new(7));
    tree.set_checkpoint_lsn(150);
    txn.note_open_ft(Arc::clone(&tree));

    txn.roll_log(cmd_insert(7, b"k")).unwrap();
    abort(&mut txn, 200).unwrap();

    assert_eq!(tree.messages().len(), 1);
    txn.close().unwrap();
}

#[test]
fn recovery_tolerates_a_missing_dictionary() {
    let h = harness();
    let mut txn = Txn::begin_for_recovery(Arc::clone(&h.logger), 4);

    // No dictionary, no cachefile: every lookup misses.
    txn.roll_log(cmd_insert(7, b"k")).unwrap();
    txn.roll_log(RollEntry::FDelete { file_id: 9 }).unwrap();
    txn.roll_log(RollEntry::ChangeFDescriptor {
        file_id: 5,
        old_descriptor: b"d".to_vec(),
    })
    .unwrap();

    commit(&mut txn, 100).unwrap();
    assert!(h.store.is_empty());
    txn.close().unwrap();
}

#[test]
fn fdelete_commit_flushes_before_marking_unlink() {
    let h = harness();
    h.wal.mark_flushed_to(30);
    h.wal.append_to(50);

    let cf = h.ct.open(9, "d9").unwrap();

    let mut txn = Txn::begin(Arc::clone(&h.logger), 4);
    txn.set_do_fsync_lsn(42);

    apply::commit_fdelete(9, &mut txn, 0).unwrap();

    assert!(h.wal.flushed_lsn() >= 42);
    assert_eq!(h.wal.fsync_count(), 1);
    assert!(cf.is_unlink_on_close());
}

#[test]
fn fdelete_commit_does_not_mark_when_the_flush_fails() {
    let h = harness();
    // Nothing past 30 was ever appended, so a flush to 42 cannot succeed.
    h.wal.mark_flushed_to(30);

    let cf = h.ct.open(9, "d9").unwrap();

    let mut txn = Txn::begin(Arc::clone(&h.logger), 4);
    txn.set_do_fsync_lsn(42);

    assert!(apply::commit_fdelete(9, &mut txn, 0).is_err());
    assert!(!cf.is_unlink_on_close());
}

#[test]
#[should_panic(expected = "missing outside recovery")]
fn fdelete_commit_of_a_missing_file_outside_recovery_is_fatal() {
    let h = harness();
    let mut txn = Txn::begin(Arc::clone(&h.logger), 4);
    let _ = apply::commit_fdelete(9, &mut txn, 0);
}

#[test]
fn load_commit_skips_an_already_marked_file() {
    let h = harness();
    h.wal.append_to(50);

    let old_cf = h.ct.open(2, "old").unwrap();
    old_cf.mark_unlink_on_close();

    let mut txn = Txn::begin(Arc::clone(&h.logger), 4);
    txn.set_do_fsync_lsn(42);
    apply::commit_load(2, b"new", &mut txn, 0).unwrap();

    assert!(old_cf.is_unlink_on_close());
    assert!(h.wal.flushed_lsn() >= 42);
}

#[test]
fn load_abort_marks_an_open_new_file() {
    let h = harness();
    let new_cf = h.ct.open(8, "loaded").unwrap();

    let mut txn = Txn::begin(Arc::clone(&h.logger), 4);
    apply::rollback_load(2, b"loaded", &mut txn, 0).unwrap();

    assert!(new_cf.is_unlink_on_close());
}

#[test]
fn load_abort_unlinks_a_never_opened_file_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("loaded");
    std::fs::write(&path, b"bulk").unwrap();

    let h = harness_with(Cachetable::with_base_dir(dir.path()));
    let mut txn = Txn::begin(Arc::clone(&h.logger), 4);

    apply::rollback_load(2, b"loaded", &mut txn, 0).unwrap();
    assert!(!path.exists());

    // And absence is tolerated.
    apply::rollback_load(2, b"loaded", &mut txn, 0).unwrap();
}

#[test]
fn fcreate_abort_unlinks_the_new_file_after_close() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("created");
    std::fs::write(&path, b"").unwrap();

    let h = harness_with(Cachetable::with_base_dir(dir.path()));
    let cf = h.ct.open(6, "created").unwrap();
    cf.pin();

    let mut txn = Txn::begin(Arc::clone(&h.logger), 4);
    txn.roll_log(RollEntry::FCreate {
        file_id: 6,
        iname: b"created".to_vec(),
    })
    .unwrap();

    abort(&mut txn, 0).unwrap();
    assert!(cf.is_unlink_on_close());

    // Deferred until the checkpoint's pin drops.
    h.ct.close(6).unwrap();
    assert!(path.exists());
    cf.unpin();
    assert!(!path.exists());
    txn.close().unwrap();
}

#[test]
fn broadcast_commit_resets_the_root_xid() {
    let h = harness();
    let id = h.trx.register_rw();
    let mut txn = Txn::begin(Arc::clone(&h.logger), id);

    let tree = Arc::new(FractalTree::new(7));
    txn.note_open_ft(Arc::clone(&tree));
    tree.insert(b"k", b"v2", txn.xids());

    txn.roll_log(RollEntry::CmdUpdateBroadcast {
        file_id: 7,
        is_resetting: true,
    })
    .unwrap();

    commit(&mut txn, 0).unwrap();

    let msgs = tree.messages();
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].kind, MsgKind::CommitBroadcastAll);
    assert!(msgs[0].key.is_empty());
    assert_eq!(tree.root_xid_that_created(), id);
    assert_eq!(tree.get(b"k"), Some(b"v2".to_vec()));
    txn.close().unwrap();
}

#[test]
fn broadcast_abort_never_resets_the_root_xid() {
    let h = harness();
    let id = h.trx.register_rw();
    let mut txn = Txn::begin(Arc::clone(&h.logger), id);

    let tree = Arc::new(FractalTree::new(7));
    tree.set_root_xid_that_created(1);
    txn.note_open_ft(Arc::clone(&tree));

    txn.roll_log(RollEntry::CmdUpdateBroadcast {
        file_id: 7,
        is_resetting: true,
    })
    .unwrap();

    abort(&mut txn, 0).unwrap();

    let msgs = tree.messages();
    assert_eq!(msgs[0].kind, MsgKind::AbortBroadcastTxn);
    assert_eq!(tree.root_xid_that_created(), 1);
    txn.close().unwrap();
}

#[test]
fn descriptor_rollback_restores_the_recorded_bytes() {
    let h = harness();
    let mut txn = Txn::begin(Arc::clone(&h.logger), 4);

    h.ct.open(5, "d5").unwrap();
    let tree = Arc::new(FractalTree::new(5));
    tree.update_descriptor(b"new-layout");
    txn.note_open_ft(Arc::clone(&tree));

    txn.roll_log(RollEntry::ChangeFDescriptor {
        file_id: 5,
        old_descriptor: b"old-layout".to_vec(),
    })
    .unwrap();

    abort(&mut txn, 0).unwrap();
    assert_eq!(tree.descriptor(), b"old-layout".to_vec());
    txn.close().unwrap();
}

#[test]
fn redirect_abort_unwinds_the_linkage() {
    let h = harness();
    let mut txn = Txn::begin(Arc::clone(&h.logger), 4);

    let old_cf = h.ct.open(1, "old").unwrap();
    let new_cf = h.ct.open(2, "new").unwrap();
    let old_ft = Arc::new(FractalTree::new(1));
    let new_ft = Arc::new(FractalTree::new(2));
    old_cf.set_tree(Arc::clone(&old_ft));
    new_cf.set_tree(Arc::clone(&new_ft));
    old_ft.set_redirected_to(2);

    txn.roll_log(RollEntry::DictionaryRedirect {
        old_file_id: 1,
        new_file_id: 2,
    })
    .unwrap();

    abort(&mut txn, 0).unwrap();
    assert_eq!(old_ft.redirected_to(), None);
    txn.close().unwrap();
}

#[test]
fn redirect_abort_during_recovery_is_a_no_op() {
    let h = harness();
    let mut txn = Txn::begin_for_recovery(Arc::clone(&h.logger), 4);

    txn.roll_log(RollEntry::DictionaryRedirect {
        old_file_id: 1,
        new_file_id: 2,
    })
    .unwrap();

    // Neither file is open; outside recovery this would abort the process.
    abort(&mut txn, 100).unwrap();
    txn.close().unwrap();
}

#[test]
fn walker_stops_at_the_first_error_and_releases_the_pin() {
    let h = harness();
    // No log appended: the fdelete commit's fsync must fail.
    h.ct.open(9, "d9").unwrap();

    let id = h.trx.register_rw();
    let mut txn = Txn::begin(Arc::clone(&h.logger), id);
    txn.set_do_fsync_lsn(42);

    let tree = Arc::new(FractalTree::new(3));
    txn.note_open_ft(Arc::clone(&tree));

    txn.roll_log(RollEntry::FDelete { file_id: 9 }).unwrap();
    tree.delete(b"a", txn.xids());
    txn.roll_log(RollEntry::CmdDelete {
        file_id: 3,
        key: b"a".to_vec(),
    })
    .unwrap();

    // Newest first: the delete's commit message lands, then the fdelete
    // fails and the walk stops with the node unpinned but not removed.
    assert!(commit(&mut txn, 0).is_err());
    assert_eq!(tree.messages().len(), 1);
    assert_eq!(h.store.len(), 1);
    assert!(!txn.roll().is_empty());

    txn.close().unwrap();
    assert!(h.store.is_empty());
}

#[test]
fn hot_index_entries_are_inert() {
    let h = harness();
    let mut txn = Txn::begin(Arc::clone(&h.logger), 4);

    txn.roll_log(RollEntry::HotIndex {
        file_ids: vec![1, 2, 3],
    })
    .unwrap();

    commit(&mut txn, 0).unwrap();
    assert!(h.store.is_empty());

    let mut txn = Txn::begin(Arc::clone(&h.logger), 5);
    txn.roll_log(RollEntry::HotIndex {
        file_ids: vec![1, 2, 3],
    })
    .unwrap();
    abort(&mut txn, 0).unwrap();
    assert!(h.store.is_empty());
}
