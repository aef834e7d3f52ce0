//! # Transaction System and View Registry
//!
//! `TrxSys` is the process-wide transaction system state, passed explicitly
//! wherever it is needed: the max-xid counter, the set of active read-write
//! xids, the serialisation list of committing transactions, and the ordered
//! list of registered read views consulted by purge.
//!
//! ## View List
//!
//! Registered views live in an arena-backed intrusive doubly-linked list:
//! each registered view records its arena slot, and each slot carries
//! index-based prev/next links. Detach and re-attach are O(1) and allocate
//! nothing once a slot exists. The list is ordered newest first, which makes
//! `low_limit_no` non-increasing from head to tail; purge walks from the
//! tail to find the oldest open view.
//!
//! ## The Fast Reuse Race
//!
//! `view_open` reopens a closed-but-registered view without taking the
//! trx-sys mutex when the caller is an autocommit non-locking reader, the
//! view is empty, and its `low_limit_id` still equals the max-xid counter.
//! Reading the counter and setting `open` without the mutex races with
//! concurrent read-write transaction creation, deliberately. The tolerated
//! outcomes:
//!
//! - Purge may scan the list while `open` is still unset and clone a
//!   younger view instead. Since no read-write transaction started since
//!   this view was prepared, the younger view holds identical values and
//!   purge reclaims exactly the same versions.
//! - A read-write transaction may start, commit, and be purged between the
//!   counter read and the `open` store. Its xid is at or above this view's
//!   `low_limit_id`, so the view could never have seen it anyway.
//!
//! Taking the mutex unconditionally would close the race and forfeit the
//! scalability that motivates the path; the race stays.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::read_view::{ReadView, NO_SLOT};
use super::sorted_ids::SortedIds;
use crate::types::Xid;

struct ViewSlot {
    view: Option<Arc<ReadView>>,
    prev: usize,
    next: usize,
}

/// Arena-backed intrusive list of registered views, newest first.
struct ViewList {
    slots: Vec<ViewSlot>,
    head: usize,
    tail: usize,
    free: Vec<usize>,
}

impl ViewList {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            head: NO_SLOT,
            tail: NO_SLOT,
            free: Vec::new(),
        }
    }

    fn push_front(&mut self, view: Arc<ReadView>) -> usize {
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot].view = Some(view);
                slot
            }
            None => {
                self.slots.push(ViewSlot {
                    view: Some(view),
                    prev: NO_SLOT,
                    next: NO_SLOT,
                });
                self.slots.len() - 1
            }
        };

        self.slots[slot].prev = NO_SLOT;
        self.slots[slot].next = self.head;

        if self.head != NO_SLOT {
            self.slots[self.head].prev = slot;
        } else {
            self.tail = slot;
        }
        self.head = slot;

        slot
    }

    fn detach(&mut self, slot: usize) {
        let (prev, next) = (self.slots[slot].prev, self.slots[slot].next);

        if prev != NO_SLOT {
            self.slots[prev].next = next;
        } else {
            self.head = next;
        }
        if next != NO_SLOT {
            self.slots[next].prev = prev;
        } else {
            self.tail = prev;
        }

        self.slots[slot].view = None;
        self.free.push(slot);
    }
}

struct TrxSysInner {
    rw_xids: SortedIds,
    serialisation: VecDeque<(Xid, u64)>,
    views: ViewList,
}

impl TrxSysInner {
    /// Serialisation number of the oldest committing transaction, if any.
    fn oldest_serialised_no(&self) -> Option<u64> {
        self.serialisation.front().map(|&(_, no)| no)
    }

    /// Every view in the list is registered, and `low_limit_no` is
    /// non-increasing head to tail among open views.
    fn validate(&self) -> bool {
        let mut prev_open: Option<&Arc<ReadView>> = None;
        let mut cursor = self.views.head;

        while cursor != NO_SLOT {
            let slot = &self.views.slots[cursor];
            if let Some(view) = &slot.view {
                assert!(view.is_registered());
                if let Some(prev) = prev_open {
                    assert!(!view.is_open() || view.le(prev));
                }
                if view.is_open() {
                    prev_open = Some(view);
                }
            }
            cursor = slot.next;
        }

        true
    }
}

pub struct TrxSys {
    /// Smallest xid not yet assigned. Read without the mutex by the fast
    /// reuse path; advanced only under it.
    next_xid: AtomicU64,
    read_only: bool,
    inner: Mutex<TrxSysInner>,
}

impl Default for TrxSys {
    fn default() -> Self {
        Self::new()
    }
}

impl TrxSys {
    pub fn new() -> Self {
        Self::with_read_only(false)
    }

    /// A transaction system for a read-only engine: views are never opened.
    pub fn with_read_only(read_only: bool) -> Self {
        Self {
            next_xid: AtomicU64::new(1),
            read_only,
            inner: Mutex::new(TrxSysInner {
                rw_xids: SortedIds::new(),
                serialisation: VecDeque::new(),
                views: ViewList::new(),
            }),
        }
    }

    /// Smallest xid not yet assigned.
    pub fn max_xid(&self) -> Xid {
        self.next_xid.load(Ordering::Acquire)
    }

    /// Assign a fresh xid to a read-write transaction and add it to the
    /// active set. Assignment and set insertion share the critical section
    /// so view preparation can never observe one without the other.
    pub fn register_rw(&self) -> Xid {
        let mut inner = self.inner.lock();
        let id = self.next_xid.fetch_add(1, Ordering::AcqRel);
        inner.rw_xids.insert(id);
        id
    }

    /// Remove a read-write transaction from the active set.
    pub fn deregister_rw(&self, id: Xid) {
        self.inner.lock().rw_xids.remove(id);
    }

    /// Assign a serialisation number to a committing transaction and queue
    /// it on the serialisation list. The list head defines the purge
    /// horizon for views prepared while the commit is in flight.
    pub fn serialise(&self, id: Xid) -> u64 {
        let mut inner = self.inner.lock();
        let no = self.next_xid.fetch_add(1, Ordering::AcqRel);
        inner.serialisation.push_back((id, no));
        no
    }

    /// Drop a transaction from the serialisation list once its commit
    /// record is durable.
    pub fn deserialise(&self, id: Xid) {
        let mut inner = self.inner.lock();
        if let Some(pos) = inner.serialisation.iter().position(|&(xid, _)| xid == id) {
            inner.serialisation.remove(pos);
        }
    }

    /// Conservative lower bound on xids still referenced by anything in the
    /// system. Message garbage collection may promote provisional versions
    /// older than this.
    pub fn oldest_referenced_xid_estimate(&self) -> Xid {
        let inner = self.inner.lock();
        if inner.rw_xids.is_empty() {
            self.max_xid()
        } else {
            inner.rw_xids.front()
        }
    }

    /// Open a read view for a transaction. All consistent reads within the
    /// transaction share the view opened here.
    pub fn view_open(&self, view: &Arc<ReadView>, creator: Xid, autocommit_non_locking: bool) {
        if self.read_only {
            debug_assert!(!view.is_open());
            return;
        }
        if view.is_open() {
            return;
        }

        // Reuse the closed view when no read-write transaction appeared at
        // or since its creation. See the module docs for why this check and
        // the store below intentionally run outside the mutex.
        if view.is_registered()
            && autocommit_non_locking
            && view.empty()
            && view.low_limit_id() == self.max_xid()
        {
            view.set_open(true);
            return;
        }

        let mut inner = self.inner.lock();

        let oldest_no = inner.oldest_serialised_no();
        view.prepare(creator, self.max_xid(), &inner.rw_xids, oldest_no);

        if view.is_registered() {
            inner.views.detach(view.slot());
        } else {
            view.set_registered(true);
        }
        view.set_open(true);

        let slot = inner.views.push_front(Arc::clone(view));
        view.set_slot(slot);

        debug_assert!(inner.validate());
    }

    /// Close a view. The view stays registered so the owning transaction
    /// can reopen it; only the open bit is cleared, without the mutex.
    pub fn view_close(&self, view: &ReadView) {
        view.set_open(false);
    }

    /// Remove a view from the registry for good. Called when the owning
    /// transaction is torn down.
    pub fn view_unregister(&self, view: &ReadView) {
        if !view.is_registered() {
            return;
        }
        let mut inner = self.inner.lock();
        inner.views.detach(view.slot());
        view.set_registered(false);
        view.set_slot(NO_SLOT);
        view.set_open(false);
    }

    /// Clone the oldest open view into `dst`, or snapshot the present when
    /// no view is open. Purge owns `dst` outright and never holds the
    /// registry, so the completion step (which folds the original creator
    /// back into the clone's active set) runs lock-free.
    pub fn clone_oldest_view(&self, dst: &mut ReadView) {
        let inner = self.inner.lock();

        let mut cursor = inner.views.tail;
        while cursor != NO_SLOT {
            let slot = &inner.views.slots[cursor];
            if let Some(view) = &slot.view {
                if view.is_open() {
                    let view = Arc::clone(view);
                    dst.copy_prepare(&view);
                    drop(inner);
                    dst.copy_complete();
                    return;
                }
            }
            cursor = slot.prev;
        }

        let oldest_no = inner.oldest_serialised_no();
        dst.prepare(0, self.max_xid(), &inner.rw_xids, oldest_no);
    }

    /// Number of open views.
    pub fn size(&self) -> usize {
        let inner = self.inner.lock();

        let mut open = 0;
        let mut cursor = inner.views.head;
        while cursor != NO_SLOT {
            let slot = &inner.views.slots[cursor];
            if slot.view.as_ref().map_or(false, |v| v.is_open()) {
                open += 1;
            }
            cursor = slot.next;
        }

        open
    }

    /// Debug validation of the registered-view list.
    pub fn validate(&self) -> bool {
        self.inner.lock().validate()
    }
}
