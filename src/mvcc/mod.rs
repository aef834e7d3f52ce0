//! # Multi-Version Concurrency Control
//!
//! Snapshot isolation for the engine: read views describe which row
//! versions a reader may observe, and the transaction system registry keeps
//! the live views ordered so purge can find the oldest snapshot still
//! pinning old versions.
//!
//! ## Visibility Model
//!
//! A view prepared at time T sees exactly the transactions serialised
//! before T. Three fields encode that set compactly:
//!
//! ```text
//!             up_limit_id          low_limit_id
//!                  │                    │
//!   visible ◄──────┤   ids membership   ├──────► invisible
//!                  │   decides the gap  │
//! ```
//!
//! ## Purge Contract
//!
//! Purge never touches the registry's views directly. It clones the oldest
//! open view ([`TrxSys::clone_oldest_view`]) and works from the clone; the
//! completion step re-adds the original creator to the clone's active set,
//! so "purge never removes a version visible to any live reader" holds even
//! for the creator's own uncommitted versions.
//!
//! ## Key Structures
//!
//! - [`SortedIds`]: append-ordered, binary-searchable xid vector
//! - [`ReadView`]: immutable-after-prepare visibility snapshot
//! - [`TrxSys`]: xid allocation, active-writer set, serialisation list,
//!   and the registered-view list

pub mod read_view;
pub mod registry;
pub mod sorted_ids;

pub use read_view::ReadView;
pub use registry::TrxSys;
pub use sorted_ids::SortedIds;
