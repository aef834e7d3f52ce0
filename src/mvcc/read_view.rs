//! # Read View
//!
//! An immutable-after-prepare visibility snapshot. A read view answers one
//! question: is the work of transaction `xid` visible to the reader that
//! opened this view?
//!
//! ## Snapshot Fields
//!
//! - `creator_xid`: the opening transaction (0 for non-locking readers, and
//!   reset to 0 once a clone folds the creator back into `ids`)
//! - `low_limit_id`: smallest xid not yet assigned at prepare time; anything
//!   at or above it started after the view and is invisible
//! - `up_limit_id`: smallest xid active at prepare time; anything below it
//!   had already committed and is visible
//! - `ids`: the ascending set of xids active at prepare time (excluding the
//!   creator); in the gap between the limits, visibility is a membership
//!   test against this set
//! - `low_limit_no`: the purge horizon, the smallest serialisation number
//!   among transactions that were committing at prepare time; no version
//!   older than the oldest open view's `low_limit_no` may be reclaimed
//!
//! ## State Machine
//!
//! ```text
//! Unregistered ──prepare+insert──► RegisteredOpen
//!      ▲                            │        ▲
//!      │ destroy                    │ close  │ reopen
//!      └──────── RegisteredClosed ◄─┘────────┘
//! ```
//!
//! `open` and `registered` are independent bits. A closed-but-registered
//! view may be reopened by its owning transaction without re-preparing when
//! no read-write transaction appeared in between (the registry's fast reuse
//! path); `open` is therefore atomic and flipped without the registry mutex,
//! while every snapshot field is written only under it.
//!
//! ## Locking
//!
//! Snapshot fields sit behind a per-view `RwLock`: the owner writes them
//! during `prepare` (holding the registry mutex), the purge thread reads
//! them during `clone_oldest_view` (also holding the registry mutex), and
//! `sees` takes the read lock so concurrent visibility checks never block
//! one another.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::RwLock;

use super::sorted_ids::SortedIds;
use crate::types::Xid;

/// Slot sentinel for a view that is not in the registry arena.
pub(crate) const NO_SLOT: usize = usize::MAX;

#[derive(Debug, Default)]
struct ViewSnap {
    creator_xid: Xid,
    low_limit_no: u64,
    low_limit_id: Xid,
    up_limit_id: Xid,
    ids: SortedIds,
}

impl ViewSnap {
    /// Copy the active xids from `src`, excluding the creator. `src` must
    /// contain the creator exactly once when one is set; the copy is a
    /// single pass over the two runs around that slot.
    fn copy_trx_ids(&mut self, src: &SortedIds) {
        let mut size = src.len();

        if self.creator_xid > 0 {
            debug_assert!(size > 0);
            size -= 1;
        }

        if size == 0 {
            self.ids.clear();
            return;
        }

        if self.creator_xid > 0 {
            let slot = src.as_slice().binary_search(&self.creator_xid);
            debug_assert!(slot.is_ok());
            let slot = slot.unwrap_or_else(|missing| missing);

            self.ids.clear();
            self.ids.reserve(size);
            for &id in &src.as_slice()[..slot] {
                self.ids.push_back(id);
            }
            for &id in &src.as_slice()[slot + 1..] {
                self.ids.push_back(id);
            }
        } else {
            self.ids.assign(src.as_slice());
        }

        debug_assert_eq!(self.ids.len(), size);
        self.up_limit_id = self.ids.front();
    }
}

pub struct ReadView {
    open: AtomicBool,
    registered: AtomicBool,
    slot: AtomicUsize,
    snap: RwLock<ViewSnap>,
}

impl Default for ReadView {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadView {
    /// A fresh, unopened, unregistered view.
    pub fn new() -> Self {
        Self {
            open: AtomicBool::new(false),
            registered: AtomicBool::new(false),
            slot: AtomicUsize::new(NO_SLOT),
            snap: RwLock::new(ViewSnap::default()),
        }
    }

    /// Populate the snapshot so that exactly the transactions serialised
    /// before this point are seen. Caller holds the registry mutex; `max_xid`
    /// and `rw_xids` must come from the same critical section so no xid at
    /// or above `low_limit_id` can appear in `ids`.
    pub(crate) fn prepare(
        &self,
        id: Xid,
        max_xid: Xid,
        rw_xids: &SortedIds,
        oldest_serialised_no: Option<u64>,
    ) {
        let mut snap = self.snap.write();

        snap.creator_xid = id;
        snap.low_limit_no = max_xid;
        snap.low_limit_id = max_xid;
        snap.up_limit_id = max_xid;

        if !rw_xids.is_empty() {
            snap.copy_trx_ids(rw_xids);
        } else {
            snap.ids.clear();
        }

        debug_assert!(snap.up_limit_id <= snap.low_limit_id);

        if let Some(no) = oldest_serialised_no {
            if no < snap.low_limit_no {
                snap.low_limit_no = no;
            }
        }
    }

    /// Field-wise deep copy of `other` into this view. Must be completed
    /// with [`copy_complete`] before use.
    ///
    /// [`copy_complete`]: ReadView::copy_complete
    pub(crate) fn copy_prepare(&mut self, other: &ReadView) {
        debug_assert!(!std::ptr::eq(self, other));

        let src = other.snap.read();
        let dst = self.snap.get_mut();

        if !src.ids.is_empty() {
            dst.ids.assign(src.ids.as_slice());
        } else {
            dst.ids.clear();
        }

        dst.up_limit_id = src.up_limit_id;
        dst.low_limit_no = src.low_limit_no;
        dst.low_limit_id = src.low_limit_id;
        dst.creator_xid = src.creator_xid;
    }

    /// Finish a copy: fold the original creator back into `ids` and adjust
    /// `up_limit_id`. From the clone's perspective the creator is simply an
    /// active transaction that has not committed yet, so the clone must not
    /// inherit the creator's self-visibility. Runs without the registry
    /// mutex.
    pub(crate) fn copy_complete(&mut self) {
        let snap = self.snap.get_mut();

        if snap.creator_xid > 0 {
            snap.ids.insert(snap.creator_xid);
        }

        if !snap.ids.is_empty() {
            snap.up_limit_id = snap.up_limit_id.min(snap.ids.front());
        }

        debug_assert!(snap.up_limit_id <= snap.low_limit_id);

        snap.creator_xid = 0;
    }

    /// Is the work of `xid` visible to this view?
    pub fn sees(&self, xid: Xid) -> bool {
        let snap = self.snap.read();

        if xid < snap.up_limit_id {
            return true;
        }
        if xid >= snap.low_limit_id {
            return false;
        }

        !snap.ids.contains(xid)
    }

    /// Total order on views by purge horizon. Debug validation only.
    pub(crate) fn le(&self, other: &ReadView) -> bool {
        self.snap.read().low_limit_no <= other.snap.read().low_limit_no
    }

    /// True when the view tracks no active xids and carries no creator.
    pub fn empty(&self) -> bool {
        let snap = self.snap.read();
        snap.ids.is_empty() && snap.creator_xid == 0
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub(crate) fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::Release);
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    pub(crate) fn set_registered(&self, registered: bool) {
        self.registered.store(registered, Ordering::Release);
    }

    pub(crate) fn slot(&self) -> usize {
        self.slot.load(Ordering::Acquire)
    }

    pub(crate) fn set_slot(&self, slot: usize) {
        self.slot.store(slot, Ordering::Release);
    }

    pub fn creator_xid(&self) -> Xid {
        self.snap.read().creator_xid
    }

    pub fn low_limit_id(&self) -> Xid {
        self.snap.read().low_limit_id
    }

    pub fn up_limit_id(&self) -> Xid {
        self.snap.read().up_limit_id
    }

    /// The purge horizon this view pins.
    pub fn low_limit_no(&self) -> u64 {
        self.snap.read().low_limit_no
    }

    /// Copy of the active-xid snapshot, for diagnostics and tests.
    pub fn ids(&self) -> Vec<Xid> {
        self.snap.read().ids.as_slice().to_vec()
    }
}

impl std::fmt::Debug for ReadView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snap = self.snap.read();
        f.debug_struct("ReadView")
            .field("creator_xid", &snap.creator_xid)
            .field("low_limit_no", &snap.low_limit_no)
            .field("low_limit_id", &snap.low_limit_id)
            .field("up_limit_id", &snap.up_limit_id)
            .field("ids", &snap.ids.as_slice())
            .field("open", &self.is_open())
            .field("registered", &self.is_registered())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rw(ids: &[Xid]) -> SortedIds {
        let mut v = SortedIds::new();
        v.assign(ids);
        v
    }

    #[test]
    fn prepare_with_no_writers_is_a_point_snapshot() {
        let view = ReadView::new();
        view.prepare(0, 17, &SortedIds::new(), None);

        assert!(view.ids().is_empty());
        assert_eq!(view.up_limit_id(), 17);
        assert_eq!(view.low_limit_id(), 17);
        assert_eq!(view.low_limit_no(), 17);
    }

    #[test]
    fn prepare_excludes_creator_from_ids() {
        let view = ReadView::new();
        view.prepare(5, 9, &rw(&[3, 5, 8]), None);

        assert_eq!(view.ids(), vec![3, 8]);
        assert_eq!(view.up_limit_id(), 3);
        assert_eq!(view.low_limit_id(), 9);
    }

    #[test]
    fn prepare_with_creator_as_only_writer_clears_ids() {
        let view = ReadView::new();
        view.prepare(4, 5, &rw(&[4]), None);

        assert!(view.ids().is_empty());
        assert_eq!(view.up_limit_id(), 5);
    }

    #[test]
    fn serialising_transaction_lowers_purge_horizon() {
        let view = ReadView::new();
        view.prepare(0, 20, &SortedIds::new(), Some(12));

        assert_eq!(view.low_limit_no(), 12);
        assert_eq!(view.low_limit_id(), 20);
    }

    #[test]
    fn sees_applies_limit_and_membership_rules() {
        let view = ReadView::new();
        view.prepare(5, 9, &rw(&[3, 5, 8]), None);

        assert!(view.sees(1));
        assert!(view.sees(2));
        assert!(!view.sees(3));
        assert!(view.sees(4));
        assert!(view.sees(5));
        assert!(!view.sees(8));
        assert!(!view.sees(9));
        assert!(!view.sees(100));
    }

    #[test]
    fn clone_folds_creator_back_into_ids() {
        let original = ReadView::new();
        original.prepare(5, 9, &rw(&[3, 5, 8]), None);

        let mut clone = ReadView::new();
        clone.copy_prepare(&original);
        clone.copy_complete();

        assert_eq!(clone.ids(), vec![3, 5, 8]);
        assert_eq!(clone.creator_xid(), 0);
        assert_eq!(clone.up_limit_id(), 3);
        assert!(!clone.sees(5));
        assert!(original.sees(5));
    }

    #[test]
    fn clone_of_creator_only_view_tracks_the_creator() {
        let original = ReadView::new();
        original.prepare(4, 5, &rw(&[4]), None);

        let mut clone = ReadView::new();
        clone.copy_prepare(&original);
        clone.copy_complete();

        assert_eq!(clone.ids(), vec![4]);
        assert_eq!(clone.up_limit_id(), 4);
        assert!(!clone.sees(4));
    }

    #[test]
    fn flag_bits_are_independent() {
        let view = ReadView::new();
        assert!(!view.is_open());
        assert!(!view.is_registered());

        view.set_registered(true);
        view.set_open(true);
        assert!(view.is_open() && view.is_registered());

        view.set_open(false);
        assert!(!view.is_open() && view.is_registered());
    }

    #[test]
    fn empty_requires_no_ids_and_no_creator() {
        let view = ReadView::new();
        view.prepare(0, 5, &SortedIds::new(), None);
        assert!(view.empty());

        view.prepare(2, 5, &rw(&[2]), None);
        assert!(!view.empty());
    }
}
