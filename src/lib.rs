//! # copsedb: Transactional Core of a Fractal-Tree Storage Engine
//!
//! This crate implements the two tightly coupled cores that realize the
//! engine's isolation and durability semantics:
//!
//! - **Rollback application**: at commit or abort, a transaction's
//!   persistent chain of rollback log entries is walked and each logged
//!   effect is finalized or undone through engine-level messages into an
//!   indexed, write-optimized keyed store. The walk is idempotent under
//!   crash recovery.
//! - **Snapshot isolation registry**: an MVCC registry that issues
//!   immutable read views identifying which row versions a transaction may
//!   observe, and exposes the oldest active snapshot that bounds what the
//!   purge subsystem may reclaim.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │          Txn (context, open trees)         │
//! ├──────────────────────┬─────────────────────┤
//! │ Rollback application │  MVCC read views    │
//! │  walker / dispatch   │  registry / purge   │
//! ├──────────────────────┴─────────────────────┤
//! │  Storage seams: WAL, cachetable, tree root │
//! └────────────────────────────────────────────┘
//! ```
//!
//! ## Module Overview
//!
//! - [`types`]: identifier types (`Xid`, `FileId`, `Lsn`, `BlockNo`)
//! - [`config`]: constants and commit policy switches
//! - [`mvcc`]: read views and the transaction-system registry
//! - [`rollback`]: entries, dispatch, walker, and log-node storage
//! - [`storage`]: WAL adapter, cachetable, fractal-tree message seam
//! - [`txn`]: transaction context and the logger bundle

pub mod config;
pub mod mvcc;
pub mod rollback;
pub mod storage;
pub mod txn;
pub mod types;

pub use mvcc::{ReadView, SortedIds, TrxSys};
pub use rollback::{abort, commit, RollEntry, RollbackStore};
pub use storage::{CacheFile, Cachetable, FractalTree, GcInfo, MsgKind, TreeMsg, Wal};
pub use txn::{Logger, RollChain, Txn};
