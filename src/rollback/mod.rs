//! # Transactional Rollback Application
//!
//! At commit or abort, a transaction's persistent chain of rollback log
//! entries is walked once, newest first, and each entry is applied through
//! its commit-side or abort-side function: messages into the fractal tree
//! for the data operations, cachefile and durability work for the file
//! lifecycle operations, and an inline subchain walk for child transactions
//! that committed into the parent.
//!
//! ```text
//!   commit(txn) ─┐
//!                ├─► walker ─► per-entry dispatch ─► tree messages
//!   abort(txn) ──┘    │                              cachefile marks
//!                     └─► drained nodes unpinned     wal fsyncs
//!                         and removed
//! ```
//!
//! The walk is idempotent under crash recovery: replay supplies the
//! operation's LSN, and any dictionary whose checkpoint already covers it
//! skips the message.
//!
//! - [`entry`]: the logged operation variants
//! - [`apply`]: commit/abort behavior per variant
//! - [`walker`]: the chain drive, ordering and chain-summary upkeep
//! - [`log`]: node storage with the pin protocol

pub mod apply;
pub mod entry;
pub mod log;
pub mod walker;

pub use entry::RollEntry;
pub use log::{PinnedLog, RollbackLogNode, RollbackStore};
pub use walker::{abort, commit};
