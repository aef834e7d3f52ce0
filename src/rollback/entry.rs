//! # Rollback Entry Variants
//!
//! One variant per logged operation kind. Each variant carries exactly the
//! state needed to either finalize or undo the operation during commit or
//! abort application; the commit-side and abort-side behaviors live in
//! [`apply`](super::apply).
//!
//! `RollInclude` is the odd one out: it is not an operation on a dictionary
//! but a splice point: when a child transaction commits into its parent,
//! the child's whole chain is recorded as this single entry and walked
//! inline when the parent completes.

use crate::types::{BlockNo, FileId, XidPair};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollEntry {
    CmdInsert {
        file_id: FileId,
        key: Vec<u8>,
    },
    CmdDelete {
        file_id: FileId,
        key: Vec<u8>,
    },
    CmdUpdate {
        file_id: FileId,
        key: Vec<u8>,
    },
    CmdUpdateBroadcast {
        file_id: FileId,
        is_resetting: bool,
    },
    FCreate {
        file_id: FileId,
        iname: Vec<u8>,
    },
    FDelete {
        file_id: FileId,
    },
    Load {
        old_file_id: FileId,
        new_iname: Vec<u8>,
    },
    HotIndex {
        file_ids: Vec<FileId>,
    },
    DictionaryRedirect {
        old_file_id: FileId,
        new_file_id: FileId,
    },
    ChangeFDescriptor {
        file_id: FileId,
        old_descriptor: Vec<u8>,
    },
    RollInclude {
        xid: XidPair,
        num_nodes: u64,
        spilled_head: BlockNo,
        spilled_tail: BlockNo,
    },
}

impl RollEntry {
    /// Stable name of the variant, for diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            RollEntry::CmdInsert { .. } => "cmdinsert",
            RollEntry::CmdDelete { .. } => "cmddelete",
            RollEntry::CmdUpdate { .. } => "cmdupdate",
            RollEntry::CmdUpdateBroadcast { .. } => "cmdupdatebroadcast",
            RollEntry::FCreate { .. } => "fcreate",
            RollEntry::FDelete { .. } => "fdelete",
            RollEntry::Load { .. } => "load",
            RollEntry::HotIndex { .. } => "hot_index",
            RollEntry::DictionaryRedirect { .. } => "dictionary_redirect",
            RollEntry::ChangeFDescriptor { .. } => "change_fdescriptor",
            RollEntry::RollInclude { .. } => "rollinclude",
        }
    }
}
