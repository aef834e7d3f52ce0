//! # Commit- and Abort-Side Entry Application
//!
//! Every logged operation kind has a commit-side and an abort-side function
//! with the uniform shape `(..op args.., txn, oplsn)`. An `oplsn` of zero
//! means normal runtime; a non-zero `oplsn` is a recovery replay of the log
//! record at that LSN.
//!
//! ## Recovery Guard
//!
//! Any function that mutates a dictionary first checks the tree's
//! checkpoint LSN: if `oplsn` is at or below it, the operation already
//! reached disk before the crash and the function succeeds without effect.
//! Replay is therefore idempotent.
//!
//! ## Missing Files
//!
//! A cachetable miss during recovery means the file's fate was already
//! sealed (created and deleted within the replayed span) and is tolerated.
//! Outside recovery the same miss is an invariant violation and aborts the
//! process.
//!
//! ## Durability Before Unlink
//!
//! The log fsync happens after row-lock release and rollback application,
//! so the two paths that make a file disappear at commit (`fdelete`,
//! `load`) must flush the commit record themselves before marking the
//! cachefile; otherwise a crash after the unlink could leave a committed
//! deletion with no durable commit record.

use std::sync::Arc;

use eyre::Result;
use tracing::debug;

use super::entry::RollEntry;
use super::walker;
use crate::config::{COMMIT_CMD_DELETE, COMMIT_CMD_INSERT, COMMIT_CMD_UPDATE};
use crate::storage::dictionary_redirect_abort;
use crate::storage::tree::{GcInfo, MsgKind, TreeMsg};
use crate::txn::Txn;
use crate::types::{BlockNo, FileId, Lsn, XidPair};

/// Dispatch one entry on the commit side.
pub fn commit_entry(txn: &mut Txn, entry: RollEntry, oplsn: Lsn) -> Result<()> {
    match entry {
        RollEntry::CmdInsert { file_id, key } => commit_cmdinsert(file_id, &key, txn, oplsn),
        RollEntry::CmdDelete { file_id, key } => commit_cmddelete(file_id, &key, txn, oplsn),
        RollEntry::CmdUpdate { file_id, key } => commit_cmdupdate(file_id, &key, txn, oplsn),
        RollEntry::CmdUpdateBroadcast {
            file_id,
            is_resetting,
        } => commit_cmdupdatebroadcast(file_id, is_resetting, txn, oplsn),
        RollEntry::FCreate { file_id, iname } => commit_fcreate(file_id, &iname, txn, oplsn),
        RollEntry::FDelete { file_id } => commit_fdelete(file_id, txn, oplsn),
        RollEntry::Load {
            old_file_id,
            new_iname,
        } => commit_load(old_file_id, &new_iname, txn, oplsn),
        RollEntry::HotIndex { file_ids } => commit_hot_index(&file_ids, txn, oplsn),
        RollEntry::DictionaryRedirect {
            old_file_id,
            new_file_id,
        } => commit_dictionary_redirect(old_file_id, new_file_id, txn, oplsn),
        RollEntry::ChangeFDescriptor {
            file_id,
            old_descriptor,
        } => commit_change_fdescriptor(file_id, &old_descriptor, txn, oplsn),
        RollEntry::RollInclude {
            xid,
            num_nodes,
            spilled_head,
            spilled_tail,
        } => commit_rollinclude(xid, num_nodes, spilled_head, spilled_tail, txn, oplsn),
    }
}

/// Dispatch one entry on the abort side.
pub fn abort_entry(txn: &mut Txn, entry: RollEntry, oplsn: Lsn) -> Result<()> {
    match entry {
        RollEntry::CmdInsert { file_id, key } => rollback_cmdinsert(file_id, &key, txn, oplsn),
        RollEntry::CmdDelete { file_id, key } => rollback_cmddelete(file_id, &key, txn, oplsn),
        RollEntry::CmdUpdate { file_id, key } => rollback_cmdupdate(file_id, &key, txn, oplsn),
        RollEntry::CmdUpdateBroadcast {
            file_id,
            is_resetting,
        } => rollback_cmdupdatebroadcast(file_id, is_resetting, txn, oplsn),
        RollEntry::FCreate { file_id, iname } => rollback_fcreate(file_id, &iname, txn, oplsn),
        RollEntry::FDelete { file_id } => rollback_fdelete(file_id, txn, oplsn),
        RollEntry::Load {
            old_file_id,
            new_iname,
        } => rollback_load(old_file_id, &new_iname, txn, oplsn),
        RollEntry::HotIndex { file_ids } => rollback_hot_index(&file_ids, txn, oplsn),
        RollEntry::DictionaryRedirect {
            old_file_id,
            new_file_id,
        } => rollback_dictionary_redirect(old_file_id, new_file_id, txn, oplsn),
        RollEntry::ChangeFDescriptor {
            file_id,
            old_descriptor,
        } => rollback_change_fdescriptor(file_id, &old_descriptor, txn, oplsn),
        RollEntry::RollInclude {
            xid,
            num_nodes,
            spilled_head,
            spilled_tail,
        } => rollback_rollinclude(xid, num_nodes, spilled_head, spilled_tail, txn, oplsn),
    }
}

/// Emit one message at the root of the dictionary `file_id`. The message
/// carries the transaction's current xid stack; for a resetting broadcast
/// commit the tree is re-attributed to the outermost xid afterwards.
fn do_insertion(
    kind: MsgKind,
    file_id: FileId,
    key: &[u8],
    value: Option<&[u8]>,
    txn: &Txn,
    oplsn: Lsn,
    reset_root_xid_that_created: bool,
) -> Result<()> {
    let Some(ft) = txn.open_ft(file_id) else {
        assert!(
            txn.for_recovery(),
            "dictionary {file_id} not open outside recovery"
        );
        return Ok(());
    };

    if oplsn > 0 {
        // Recovery replay: skip operations the tree already checkpointed.
        let tree_lsn = ft.checkpoint_lsn();
        if oplsn <= tree_lsn {
            return Ok(());
        }
    }

    let xids = txn.xids().clone();
    let msg = TreeMsg::new(kind, key.to_vec(), value.map(<[u8]>::to_vec), xids.clone());

    let trx_sys = txn.logger().trx_sys();
    let oldest_referenced_xid = trx_sys.oldest_referenced_xid_estimate();
    // No messages sit above this one, so update records may be promoted
    // implicitly from the estimate, except during recovery, when the
    // estimate is not yet trustworthy.
    let gc_info = GcInfo {
        oldest_referenced_xid,
        can_promote: !txn.for_recovery(),
    };

    ft.put_message_at_root(msg, &gc_info);

    if reset_root_xid_that_created {
        ft.set_root_xid_that_created(xids.outermost());
    }

    Ok(())
}

pub fn commit_cmdinsert(file_id: FileId, key: &[u8], txn: &mut Txn, oplsn: Lsn) -> Result<()> {
    if COMMIT_CMD_INSERT {
        do_insertion(MsgKind::CommitAny, file_id, key, None, txn, oplsn, false)
    } else {
        Ok(())
    }
}

pub fn rollback_cmdinsert(file_id: FileId, key: &[u8], txn: &mut Txn, oplsn: Lsn) -> Result<()> {
    do_insertion(MsgKind::AbortAny, file_id, key, None, txn, oplsn, false)
}

pub fn commit_cmdupdate(file_id: FileId, key: &[u8], txn: &mut Txn, oplsn: Lsn) -> Result<()> {
    if COMMIT_CMD_UPDATE {
        do_insertion(MsgKind::CommitAny, file_id, key, None, txn, oplsn, false)
    } else {
        Ok(())
    }
}

pub fn rollback_cmdupdate(file_id: FileId, key: &[u8], txn: &mut Txn, oplsn: Lsn) -> Result<()> {
    do_insertion(MsgKind::AbortAny, file_id, key, None, txn, oplsn, false)
}

pub fn commit_cmdupdatebroadcast(
    file_id: FileId,
    is_resetting: bool,
    txn: &mut Txn,
    oplsn: Lsn,
) -> Result<()> {
    // A resetting broadcast changed the definition of the dictionary
    // (e.g. a schema change), so it commits for every row and re-attributes
    // the tree; a plain broadcast commits this transaction's rows only.
    let kind = if is_resetting {
        MsgKind::CommitBroadcastAll
    } else {
        MsgKind::CommitBroadcastTxn
    };
    do_insertion(kind, file_id, &[], None, txn, oplsn, is_resetting)
}

pub fn rollback_cmdupdatebroadcast(
    file_id: FileId,
    _is_resetting: bool,
    txn: &mut Txn,
    oplsn: Lsn,
) -> Result<()> {
    do_insertion(
        MsgKind::AbortBroadcastTxn,
        file_id,
        &[],
        None,
        txn,
        oplsn,
        false,
    )
}

pub fn commit_cmddelete(file_id: FileId, key: &[u8], txn: &mut Txn, oplsn: Lsn) -> Result<()> {
    if COMMIT_CMD_DELETE {
        do_insertion(MsgKind::CommitAny, file_id, key, None, txn, oplsn, false)
    } else {
        Ok(())
    }
}

pub fn rollback_cmddelete(file_id: FileId, key: &[u8], txn: &mut Txn, oplsn: Lsn) -> Result<()> {
    do_insertion(MsgKind::AbortAny, file_id, key, None, txn, oplsn, false)
}

pub fn commit_fcreate(_file_id: FileId, _iname: &[u8], _txn: &mut Txn, _oplsn: Lsn) -> Result<()> {
    Ok(())
}

/// Aborting a create makes the new file disappear. The unlink must not
/// race a pinned checkpoint reference, so the cachefile is marked and the
/// unlink runs when the last pin drops.
pub fn rollback_fcreate(file_id: FileId, _iname: &[u8], txn: &mut Txn, _oplsn: Lsn) -> Result<()> {
    let Some(cf) = txn.logger().cachetable().of_fileid(file_id) else {
        // The file may already be gone, e.g. when a recovered transaction
        // replays a create that never reached the cachetable.
        return Ok(());
    };

    cf.mark_unlink_on_close();
    Ok(())
}

pub fn commit_fdelete(file_id: FileId, txn: &mut Txn, _oplsn: Lsn) -> Result<()> {
    let Some(cf) = txn.logger().cachetable().of_fileid(file_id) else {
        assert!(
            txn.for_recovery(),
            "dictionary file {file_id} missing outside recovery"
        );
        return Ok(());
    };

    // The commit record must be durable before the file can disappear.
    txn.logger().wal().fsync_up_to(txn.do_fsync_lsn())?;

    debug!(file_id, "fdelete commit: unlink on close");
    cf.mark_unlink_on_close();
    Ok(())
}

pub fn rollback_fdelete(_file_id: FileId, _txn: &mut Txn, _oplsn: Lsn) -> Result<()> {
    // The file was never logically deleted.
    Ok(())
}

/// Committing a bulk load deletes the file the load replaced.
pub fn commit_load(old_file_id: FileId, _new_iname: &[u8], txn: &mut Txn, _oplsn: Lsn) -> Result<()> {
    let Some(old_cf) = txn.logger().cachetable().of_fileid(old_file_id) else {
        assert!(
            txn.for_recovery(),
            "dictionary file {old_file_id} missing outside recovery"
        );
        return Ok(());
    };

    // The commit record must be durable before the file can disappear.
    txn.logger().wal().fsync_up_to(txn.do_fsync_lsn())?;

    // TODO: work out whether the already-marked check can be dropped.
    if !old_cf.is_unlink_on_close() {
        debug!(old_file_id, "load commit: unlink old file on close");
        old_cf.mark_unlink_on_close();
    }
    Ok(())
}

/// Aborting a bulk load deletes the freshly loaded file instead.
pub fn rollback_load(
    _old_file_id: FileId,
    new_iname: &[u8],
    txn: &mut Txn,
    _oplsn: Lsn,
) -> Result<()> {
    let iname = String::from_utf8_lossy(new_iname).into_owned();
    let ct = txn.logger().cachetable();

    match ct.of_iname(&iname) {
        Some(new_cf) => {
            new_cf.mark_unlink_on_close();
            Ok(())
        }
        // The new iname may never have been opened; unlink it directly and
        // ignore its absence.
        None => ct.unlink_if_exists(&iname),
    }
}

pub fn commit_hot_index(_file_ids: &[FileId], _txn: &mut Txn, _oplsn: Lsn) -> Result<()> {
    Ok(())
}

pub fn rollback_hot_index(_file_ids: &[FileId], _txn: &mut Txn, _oplsn: Lsn) -> Result<()> {
    Ok(())
}

pub fn commit_dictionary_redirect(
    _old_file_id: FileId,
    _new_file_id: FileId,
    _txn: &mut Txn,
    _oplsn: Lsn,
) -> Result<()> {
    // Redirect only has meaning during normal operation.
    Ok(())
}

pub fn rollback_dictionary_redirect(
    old_file_id: FileId,
    new_file_id: FileId,
    txn: &mut Txn,
    _oplsn: Lsn,
) -> Result<()> {
    // During recovery the replay reconstructs the mapping itself.
    if txn.for_recovery() {
        return Ok(());
    }

    let ct = Arc::clone(txn.logger().cachetable());

    let Some(new_cf) = ct.of_fileid(new_file_id) else {
        panic!("dictionary {new_file_id} not open during redirect abort");
    };
    let Some(new_ft) = new_cf.tree() else {
        panic!("dictionary {new_file_id} has no open tree during redirect abort");
    };

    let Some(old_cf) = ct.of_fileid(old_file_id) else {
        panic!("dictionary {old_file_id} not open during redirect abort");
    };
    let Some(old_ft) = old_cf.tree() else {
        panic!("dictionary {old_file_id} has no open tree during redirect abort");
    };

    dictionary_redirect_abort(&old_ft, &new_ft)
}

pub fn commit_change_fdescriptor(
    _file_id: FileId,
    _old_descriptor: &[u8],
    _txn: &mut Txn,
    _oplsn: Lsn,
) -> Result<()> {
    Ok(())
}

pub fn rollback_change_fdescriptor(
    file_id: FileId,
    old_descriptor: &[u8],
    txn: &mut Txn,
    _oplsn: Lsn,
) -> Result<()> {
    let Some(_cf) = txn.logger().cachetable().of_fileid(file_id) else {
        assert!(
            txn.for_recovery(),
            "dictionary file {file_id} missing outside recovery"
        );
        return Ok(());
    };

    // The file is open: the txn that changed the descriptor opened and
    // noted the dictionary.
    let Some(ft) = txn.open_ft(file_id) else {
        panic!("dictionary {file_id} not open for descriptor rollback");
    };

    ft.update_descriptor(old_descriptor);
    Ok(())
}

pub fn commit_rollinclude(
    xid: XidPair,
    num_nodes: u64,
    spilled_head: BlockNo,
    spilled_tail: BlockNo,
    txn: &mut Txn,
    oplsn: Lsn,
) -> Result<()> {
    walker::apply_rollinclude(
        txn,
        xid,
        num_nodes,
        spilled_head,
        spilled_tail,
        oplsn,
        commit_entry,
    )
}

pub fn rollback_rollinclude(
    xid: XidPair,
    num_nodes: u64,
    spilled_head: BlockNo,
    spilled_tail: BlockNo,
    txn: &mut Txn,
    oplsn: Lsn,
) -> Result<()> {
    walker::apply_rollinclude(
        txn,
        xid,
        num_nodes,
        spilled_head,
        spilled_tail,
        oplsn,
        abort_entry,
    )
}
