//! # Storage Collaborators
//!
//! The rollback core sits between three storage-side collaborators, each
//! consumed through a narrow seam:
//!
//! - [`wal`]: durability watermark; `fsync_up_to` before any unlink
//! - [`cachetable`]: file-id to open-file mapping with deferred unlink
//! - [`tree`]: the keyed store, driven only by root messages
//!
//! All three are realized in memory here; their on-disk counterparts plug
//! in behind the same surfaces.

pub mod cachetable;
pub mod tree;
pub mod wal;

pub use cachetable::{CacheFile, Cachetable};
pub use tree::{dictionary_redirect_abort, FractalTree, GcInfo, MsgKind, TreeMsg};
pub use wal::Wal;
