use crate::backoff::Backoff;
use crate::invariants::{debug_assert_epoch_monotonic, debug_assert_ring_bound, debug_assert_same_mmm};
use crate::mmm::{Mmm, MmmObject, MmmThread};
use crossbeam_utils::CachePadded;
use portable_atomic::AtomicU128;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::Arc;

// =============================================================================
// EPOCHED CELL PROTOCOL
// =============================================================================
//
// The ring packs two 32-bit epochs (enqueue, dequeue) into one 64-bit
// header; a cell's index is its epoch modulo the power-of-two size. Each
// 128-bit cell carries (item, state) where the state holds the cell's
// current epoch plus flag bits. Both sides claim an epoch by fetch-add on
// their half of the header and then settle the claim at the cell with a
// CAS against the full previously-loaded value:
//
// * an enqueuer may only install over a cell whose epoch is *below* its
//   write epoch; observing an equal or higher epoch means it was lapped
//   and must take a fresh epoch;
// * a dequeuer may stamp any cell at or below its read epoch as dequeued;
//   what it displaces tells it whether it won an item, invalidated a slow
//   enqueue (drop handler), or merely burned an empty epoch.
//
// Cell epochs are therefore monotonically non-decreasing, which is the
// whole correctness story: every CAS moves a cell forward in epoch space,
// so no stale writer can resurrect consumed state.
//
// Enqueue never fails. When the ring is observed full, the enqueuer first
// advances the dequeue epoch over the deficit (retiring the oldest items
// to the drop handler as their cells get overwritten), sleeping with a
// capped exponential backoff when that header CAS is contended.
//
// =============================================================================

/// Cell/header epochs are 32-bit; 0 marks a virgin cell.
const EPOCH_MASK: u64 = 0xffff_ffff;

const ENQUEUED: u64 = 1 << 63;
const DEQUEUED: u64 = 1 << 62;
/// Set on every cell of a store that a view has claimed.
const CLAIMED: u64 = 1 << 61;

#[inline]
fn pack(item: u64, state: u64) -> u128 {
    (u128::from(state) << 64) | u128::from(item)
}

#[inline]
fn unpack(v: u128) -> (u64, u64) {
    (v as u64, (v >> 64) as u64)
}

#[inline]
fn pack_header(enq: u64, deq: u64) -> u64 {
    (enq << 32) | (deq & EPOCH_MASK)
}

#[inline]
fn unpack_header(v: u64) -> (u64, u64) {
    (v >> 32, v & EPOCH_MASK)
}

struct RingStore<T> {
    size: u64,
    /// Packed (enqueue epoch, dequeue epoch), both starting at 1.
    header: CachePadded<AtomicU64>,
    /// One-shot view claim: CAS from null is the claim itself.
    next: AtomicPtr<MmmObject<RingStore<T>>>,
    cells: Box<[AtomicU128]>,
    _marker: PhantomData<T>,
}

impl<T> RingStore<T> {
    fn new(size: u64) -> Self {
        let cells = (0..size).map(|_| AtomicU128::new(0)).collect();
        Self {
            size,
            header: CachePadded::new(AtomicU64::new(pack_header(1, 1))),
            next: AtomicPtr::new(ptr::null_mut()),
            cells,
            _marker: PhantomData,
        }
    }

    #[inline]
    fn mask(&self) -> u64 {
        self.size - 1
    }
}

/// Bounded multi-producer / multi-consumer ring.
///
/// Enqueue never fails: a full ring overwrites its oldest undequeued item
/// and hands it to the optional drop handler. Dequeue reports not-found on
/// observed emptiness. Snapshots are taken by [`Ring::view`], which claims
/// the whole backing store and replaces it with a fresh one.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use waitfree_rs::{Mmm, Ring};
///
/// let mmm = Arc::new(Mmm::new());
/// let th = mmm.register().unwrap();
/// let ring = Ring::new(Arc::clone(&mmm), 2); // 4 slots
///
/// for v in 1..=6u64 {
///     ring.enqueue(v, &th); // 1 and 2 are overwritten
/// }
/// assert_eq!(ring.dequeue(&th), Some(3));
/// ```
pub struct Ring<T> {
    mmm: Arc<Mmm>,
    store: AtomicPtr<MmmObject<RingStore<T>>>,
    drop_handler: Option<fn(T)>,
    _marker: PhantomData<T>,
}

// SAFETY: cells own their items between the enqueue CAS and whichever CAS
// displaces them; all shared state is atomic.
unsafe impl<T: Send> Send for Ring<T> {}
unsafe impl<T: Send> Sync for Ring<T> {}

impl<T> Ring<T> {
    /// Create a ring with `1 << size_bits` slots.
    ///
    /// # Panics
    ///
    /// Panics if `size_bits` is 0 or greater than 20 (1M slots max).
    pub fn new(mmm: Arc<Mmm>, size_bits: u8) -> Self {
        Self::build(mmm, size_bits, None)
    }

    /// Like [`Ring::new`], with a handler invoked once for every item the
    /// ring discards (overwritten or invalidated, never dequeued).
    pub fn with_drop_handler(mmm: Arc<Mmm>, size_bits: u8, handler: fn(T)) -> Self {
        Self::build(mmm, size_bits, Some(handler))
    }

    fn build(mmm: Arc<Mmm>, size_bits: u8, drop_handler: Option<fn(T)>) -> Self {
        assert!(
            size_bits > 0 && size_bits <= 20,
            "size_bits must be between 1 and 20 (max 1M slots)"
        );
        let store = mmm.alloc(RingStore::<T>::new(1 << size_bits));
        Self {
            mmm,
            store: AtomicPtr::new(store),
            drop_handler,
            _marker: PhantomData,
        }
    }

    fn discard(&self, item: u64) {
        // SAFETY: the displacing CAS transferred sole ownership to us.
        let value = *unsafe { Box::from_raw(item as *mut T) };
        match self.drop_handler {
            Some(f) => f(value),
            None => drop(value),
        }
    }

    /// Append an item, overwriting the oldest if full. Returns the epoch
    /// assigned to the write.
    pub fn enqueue(&self, item: T, th: &MmmThread) -> u64 {
        debug_assert_same_mmm!(&self.mmm, th.mmm());
        th.begin_op();
        let item_ptr = Box::into_raw(Box::new(item)) as u64;
        let mut backoff = Backoff::new();
        let epoch = 'outer: loop {
            let store_obj = self.store.load(Ordering::SeqCst);
            // SAFETY: protected by the reservation published above.
            let store = unsafe { (*store_obj).value() };

            // Full-ring advance: push the dequeue epoch over the deficit.
            loop {
                let hdr = store.header.load(Ordering::SeqCst);
                let (enq, deq) = unpack_header(hdr);
                if enq < deq + store.size {
                    break;
                }
                let target = enq + 1 - store.size;
                if store
                    .header
                    .compare_exchange(hdr, pack_header(enq, target), Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    debug_assert_ring_bound!(enq, target, store.size);
                    break;
                }
                backoff.stall();
            }

            let old = store.header.fetch_add(1 << 32, Ordering::SeqCst);
            let (my_epoch, _) = unpack_header(old);
            let cell = &store.cells[(my_epoch & store.mask()) as usize];
            loop {
                let cur = cell.load(Ordering::SeqCst);
                let (citem, cstate) = unpack(cur);
                if cstate & CLAIMED != 0 {
                    self.help_view_swap(store_obj);
                    continue 'outer;
                }
                let cepoch = cstate & EPOCH_MASK;
                if cepoch >= my_epoch {
                    // Lapped; take a fresh epoch.
                    continue 'outer;
                }
                if cell
                    .compare_exchange(
                        cur,
                        pack(item_ptr, ENQUEUED | my_epoch),
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_ok()
                {
                    debug_assert_epoch_monotonic!("ring cell epoch", cepoch, my_epoch);
                    if cstate & ENQUEUED != 0 {
                        // Overwrote the oldest undequeued item.
                        self.discard(citem);
                    }
                    break 'outer my_epoch;
                }
            }
        };
        th.end_op();
        epoch
    }

    /// Remove the oldest available item, or report observed emptiness.
    pub fn dequeue(&self, th: &MmmThread) -> Option<T> {
        debug_assert_same_mmm!(&self.mmm, th.mmm());
        th.begin_op();
        let result = 'outer: loop {
            let store_obj = self.store.load(Ordering::SeqCst);
            // SAFETY: protected by the caller's reservation.
            let store = unsafe { (*store_obj).value() };

            let hdr = store.header.load(Ordering::SeqCst);
            let (enq, deq) = unpack_header(hdr);
            if deq >= enq {
                break 'outer None;
            }
            let old = store.header.fetch_add(1, Ordering::SeqCst);
            let (_, my) = unpack_header(old);
            let cell = &store.cells[(my & store.mask()) as usize];
            loop {
                let cur = cell.load(Ordering::SeqCst);
                let (citem, cstate) = unpack(cur);
                if cstate & CLAIMED != 0 {
                    self.help_view_swap(store_obj);
                    continue 'outer;
                }
                let cepoch = cstate & EPOCH_MASK;
                if cepoch > my || (cepoch == my && cstate & DEQUEUED != 0) {
                    // Our read epoch was overtaken or already consumed.
                    continue 'outer;
                }
                if cell
                    .compare_exchange(cur, pack(0, DEQUEUED | my), Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    if cepoch == my && cstate & ENQUEUED != 0 {
                        // SAFETY: the CAS displaced the installed pointer;
                        // we are its sole owner now.
                        break 'outer Some(*unsafe { Box::from_raw(citem as *mut T) });
                    }
                    if cstate & ENQUEUED != 0 {
                        // Invalidated a pending slow enqueue.
                        self.discard(citem);
                    }
                    continue 'outer;
                }
            }
        };
        th.end_op();
        result
    }

    /// Approximate occupancy (exact in quiescence).
    pub fn len(&self, th: &MmmThread) -> usize {
        debug_assert_same_mmm!(&self.mmm, th.mmm());
        th.begin_op();
        let store_obj = self.store.load(Ordering::SeqCst);
        // SAFETY: protected by the reservation published above.
        let store = unsafe { (*store_obj).value() };
        let (enq, deq) = unpack_header(store.header.load(Ordering::SeqCst));
        th.end_op();
        enq.saturating_sub(deq) as usize
    }

    /// Whether the ring looked empty at the moment of the check.
    pub fn is_empty(&self, th: &MmmThread) -> bool {
        self.len(th) == 0
    }

    /// Snapshot the ring: claim the current store, freeze its cells, and
    /// hand the enqueued items to a cursor in enqueue order.
    ///
    /// The snapshot is destructive: the ring continues on a fresh store
    /// and the claimed items belong to the returned view. Items a stalled
    /// enqueuer had not yet installed migrate to the fresh store instead
    /// of appearing in the view.
    pub fn view(&self, th: &MmmThread) -> RingView<T> {
        debug_assert_same_mmm!(&self.mmm, th.mmm());
        th.begin_op();
        let view = loop {
            let store_obj = self.store.load(Ordering::SeqCst);
            // SAFETY: protected by the caller's reservation.
            let store = unsafe { (*store_obj).value() };
            let cand = self.mmm.alloc(RingStore::<T>::new(store.size));
            match store
                .next
                .compare_exchange(ptr::null_mut(), cand, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => {
                    Self::stabilize(store);
                    let _ = self.store.compare_exchange(
                        store_obj,
                        cand,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    );
                    let (enq, deq) = unpack_header(store.header.load(Ordering::SeqCst));
                    break RingView {
                        mmm: Arc::clone(&self.mmm),
                        store: store_obj,
                        cursor: deq,
                        end: enq,
                        _marker: PhantomData,
                    };
                }
                Err(winner) => {
                    // Another view holds the claim; help it off the ring
                    // and snapshot whatever store replaces it.
                    // SAFETY: the candidate lost the claim race and was
                    // never published.
                    unsafe { th.retire_unused(cand) };
                    Self::stabilize(store);
                    let _ = self.store.compare_exchange(
                        store_obj,
                        winner,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    );
                }
            }
        };
        th.end_op();
        view
    }

    /// Freeze every cell of a claimed store so no enqueue or dequeue can
    /// settle against it afterwards.
    fn stabilize(store: &RingStore<T>) {
        for cell in store.cells.iter() {
            loop {
                let cur = cell.load(Ordering::SeqCst);
                let (_, state) = unpack(cur);
                if state & CLAIMED != 0 {
                    break;
                }
                let (item, _) = unpack(cur);
                if cell
                    .compare_exchange(
                        cur,
                        pack(item, state | CLAIMED),
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_ok()
                {
                    break;
                }
            }
        }
    }

    /// Move traffic off a claimed store onto its replacement.
    fn help_view_swap(&self, store_obj: *mut MmmObject<RingStore<T>>) {
        // SAFETY: caller holds a reservation covering store_obj.
        let store = unsafe { (*store_obj).value() };
        let next = store.next.load(Ordering::SeqCst);
        if !next.is_null() {
            let _ = self
                .store
                .compare_exchange(store_obj, next, Ordering::SeqCst, Ordering::SeqCst);
        }
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        let mut cur = self.store.load(Ordering::Relaxed);
        while !cur.is_null() {
            // SAFETY: exclusive access in Drop; claimed stores were handed
            // to their views and are not reachable from here.
            let store = unsafe { (*cur).value() };
            for cell in store.cells.iter() {
                let (item, state) = unpack(cell.load(Ordering::Relaxed));
                if state & ENQUEUED != 0 {
                    drop(unsafe { Box::from_raw(item as *mut T) });
                }
            }
            let next = store.next.load(Ordering::Relaxed);
            drop(unsafe { Box::from_raw(cur) });
            cur = next;
        }
    }
}

/// Cursor over a claimed ring store, yielding items in enqueue order.
///
/// Dropping the view drops any unconsumed items and retires the claimed
/// store through the manager (stalled operations may still be reading it).
pub struct RingView<T> {
    mmm: Arc<Mmm>,
    store: *mut MmmObject<RingStore<T>>,
    cursor: u64,
    end: u64,
    _marker: PhantomData<T>,
}

// SAFETY: the view exclusively owns the claimed store's enqueued items.
unsafe impl<T: Send> Send for RingView<T> {}

impl<T> Iterator for RingView<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        while self.cursor < self.end {
            let e = self.cursor;
            self.cursor += 1;
            // SAFETY: the claimed store lives until this view retires it.
            let store = unsafe { (*self.store).value() };
            let cell = &store.cells[(e & store.mask()) as usize];
            let (item, state) = unpack(cell.load(Ordering::SeqCst));
            if state & ENQUEUED != 0 && state & EPOCH_MASK == e & EPOCH_MASK {
                // Mark consumed so Drop does not double-free.
                cell.store(pack(0, CLAIMED | DEQUEUED | e), Ordering::SeqCst);
                // SAFETY: stabilization made this view the sole owner.
                return Some(*unsafe { Box::from_raw(item as *mut T) });
            }
        }
        None
    }
}

impl<T> Drop for RingView<T> {
    fn drop(&mut self) {
        while self.next().is_some() {}
        // SAFETY: no new operation can reach the claimed store; stalled
        // readers are covered by the grace period.
        unsafe { self.mmm.retire_orphan(self.store) };
    }
}
