//! # Configuration Constants
//!
//! Centralized constants for the transactional core, grouping interdependent
//! values together. Constants that depend on each other are co-located to
//! prevent mismatch bugs.
//!
//! ## Commit Policy Switches
//!
//! When a transaction commits, the rollback chain is still walked so the
//! chain can be drained, but most single-key operations need no message at
//! commit time: the provisional version in the tree simply becomes the
//! committed one during normal message garbage collection. The switches
//! below control whether an explicit commit message is sent anyway. They are
//! `const bool`s so a disabled commit side compiles down to the no-op.
//!
//! | Switch | Default | Commit-side message when enabled |
//! |--------------------|---------|----------------------------------|
//! | `COMMIT_CMD_INSERT`| off     | `CommitAny` per logged insert    |
//! | `COMMIT_CMD_DELETE`| on      | `CommitAny` per logged delete    |
//! | `COMMIT_CMD_UPDATE`| off     | `CommitAny` per logged update    |
//!
//! The abort side is never affected by these switches.

// ============================================================================
// MVCC CONFIGURATION
// ============================================================================

/// Minimum capacity reserved for a read view's active-xid vector.
///
/// Views are reused across statements by autocommit readers; reserving a
/// floor avoids re-growing the vector for the common small transaction mix.
pub const MIN_IDS: usize = 32;

// ============================================================================
// ROLLBACK LOG CONFIGURATION
// ============================================================================

/// Maximum number of entries appended to one rollback log node before the
/// chain grows a new node.
pub const ROLLBACK_NODE_ENTRY_CAP: usize = 32;

const _: () = assert!(
    ROLLBACK_NODE_ENTRY_CAP >= 1,
    "a rollback log node must hold at least one entry"
);

// ============================================================================
// COMMIT POLICY SWITCHES
// ============================================================================

/// Send a `CommitAny` message for each logged insert at commit time.
pub const COMMIT_CMD_INSERT: bool = false;

/// Send a `CommitAny` message for each logged delete at commit time.
pub const COMMIT_CMD_DELETE: bool = true;

/// Send a `CommitAny` message for each logged update at commit time.
pub const COMMIT_CMD_UPDATE: bool = false;
