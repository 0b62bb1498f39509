use crate::invariants::{debug_assert_epoch_monotonic, debug_assert_frozen_cell, debug_assert_same_mmm};
use crate::mmm::{Mmm, MmmObject, MmmThread};
use crossbeam_utils::CachePadded;
use portable_atomic::AtomicU128;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::Arc;

// =============================================================================
// COMPARE-AND-POP
// =============================================================================
//
// The structure is a ring of 128-bit (item, state) cells driven by two
// free-running 64-bit epoch counters kept beside the cell array. The
// reader API is split in two so other wait-free algorithms can use it as
// a help queue:
//
//   top()  -> (item, epoch)   observe the current head
//   cap(e) -> bool            pop only if the head still carries epoch e
//
// For any epoch at most one cap succeeds: the (enqueued, e) ->
// (dequeued, e) transition is a single CAS on the full cell, which is
// what gives "exactly one helper wins" semantics to callers. The capped
// cell keeps its item pointer so a racing top can linearize itself before
// the pop it lost to.
//
// The ring never overwrites: reaching capacity (or lagging behind a
// too-fast writer side) triggers a doubling migration. Migration freezes
// every cell, then builds a candidate store whose compact prefix re-stamps
// the surviving items with epochs strictly above anything the old store
// issued. Frozen cells are immutable, so every helper derives the same
// candidate and the next-pointer CAS picks the one that publishes.
//
// =============================================================================

/// Initial ring capacity.
const DEFAULT_SIZE: u64 = 64;

/// `top` retries while lagging the writer side before forcing a migration.
const LAG_LIMIT: u32 = 16;

const ENQUEUED: u64 = 1 << 63;
const DEQUEUED: u64 = 1 << 62;
const TOOSLOW: u64 = 1 << 61;
const MOVING: u64 = 1 << 60;
const MOVED: u64 = 1 << 59;
/// Cell epochs occupy the low 48 bits of the state word.
const EPOCH_MASK: u64 = (1 << 48) - 1;

#[inline]
fn pack(item: u64, state: u64) -> u128 {
    (u128::from(state) << 64) | u128::from(item)
}

#[inline]
fn unpack(v: u128) -> (u64, u64) {
    (v as u64, (v >> 64) as u64)
}

struct CapqStore<T> {
    size: u64,
    /// Next write epoch; starts at 1 (0 marks virgin cells).
    enqueue_index: CachePadded<AtomicU64>,
    /// Next read epoch.
    dequeue_index: CachePadded<AtomicU64>,
    next: AtomicPtr<MmmObject<CapqStore<T>>>,
    cells: Box<[AtomicU128]>,
    _marker: PhantomData<T>,
}

impl<T> CapqStore<T> {
    fn new(size: u64, enq: u64, deq: u64) -> Self {
        let cells = (0..size).map(|_| AtomicU128::new(0)).collect();
        Self {
            size,
            enqueue_index: CachePadded::new(AtomicU64::new(enq)),
            dequeue_index: CachePadded::new(AtomicU64::new(deq)),
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

/// Wait-free enqueue / compare-and-pop queue.
///
/// `top` observes the head as an (item, epoch) pair; `cap` removes the
/// head only if its epoch still matches. [`Capq::dequeue`] composes the
/// two into a lock-free pop.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use waitfree_rs::{Capq, Mmm};
///
/// let mmm = Arc::new(Mmm::new());
/// let th = mmm.register().unwrap();
/// let q = Capq::new(Arc::clone(&mmm));
///
/// let e = q.enqueue(7u64, &th);
/// assert_eq!(q.top(&th), Some((7, e)));
/// assert!(q.cap(e, &th));   // removes only while the head is still e
/// assert!(!q.cap(e, &th));  // at most one cap per epoch
/// ```
pub struct Capq<T> {
    mmm: Arc<Mmm>,
    store: AtomicPtr<MmmObject<CapqStore<T>>>,
    _marker: PhantomData<T>,
}

// SAFETY: items live in manager-owned allocations reachable only through
// atomic cells; clones are taken under reservations.
unsafe impl<T: Send + Sync> Send for Capq<T> {}
unsafe impl<T: Send + Sync> Sync for Capq<T> {}

impl<T> Capq<T> {
    /// Create an empty queue.
    pub fn new(mmm: Arc<Mmm>) -> Self {
        let store = mmm.alloc(CapqStore::<T>::new(DEFAULT_SIZE, 1, 1));
        Self {
            mmm,
            store: AtomicPtr::new(store),
            _marker: PhantomData,
        }
    }

    /// Append an item; returns the epoch it was enqueued at. Wait-free.
    pub fn enqueue(&self, item: T, th: &MmmThread) -> u64 {
        debug_assert_same_mmm!(&self.mmm, th.mmm());
        th.begin_op();
        let obj = th.alloc(item) as u64;
        let mut step = 1u64;
        let epoch = loop {
            let store_obj = self.store.load(Ordering::SeqCst);
            // SAFETY: protected by the reservation published above.
            let store = unsafe { (*store_obj).value() };
            let my = store.enqueue_index.fetch_add(step, Ordering::SeqCst);
            let deq = store.dequeue_index.load(Ordering::SeqCst);
            if my >= deq + store.size {
                self.migrate(store_obj, th);
                step = 1;
                continue;
            }
            let cell = &store.cells[(my & store.mask()) as usize];
            let cur = cell.load(Ordering::SeqCst);
            let (_, cstate) = unpack(cur);
            if cstate & (MOVING | MOVED) != 0 {
                self.migrate(store_obj, th);
                step = 1;
                continue;
            }
            if cstate & EPOCH_MASK < my
                && cell
                    .compare_exchange(
                        cur,
                        pack(obj, ENQUEUED | my),
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_ok()
            {
                debug_assert_epoch_monotonic!("capq cell epoch", cstate & EPOCH_MASK, my);
                break my;
            }
            // Invalidated or outrun; widen the stride.
            step <<= 1;
        };
        th.end_op();
        epoch
    }

    /// Observe the head as (item, epoch), or None when observably empty.
    /// Wait-free.
    pub fn top(&self, th: &MmmThread) -> Option<(T, u64)>
    where
        T: Clone,
    {
        debug_assert_same_mmm!(&self.mmm, th.mmm());
        th.begin_op();
        let mut lag: u32 = 0;
        let result = loop {
            let store_obj = self.store.load(Ordering::SeqCst);
            // SAFETY: protected by the caller's reservation.
            let store = unsafe { (*store_obj).value() };
            let cur_ix = store.dequeue_index.load(Ordering::SeqCst);
            let end = store.enqueue_index.load(Ordering::SeqCst);
            if cur_ix >= end {
                break None;
            }
            let cell = &store.cells[(cur_ix & store.mask()) as usize];
            let v = cell.load(Ordering::SeqCst);
            let (citem, cstate) = unpack(v);
            if cstate & (MOVING | MOVED) != 0 {
                self.migrate(store_obj, th);
                continue;
            }
            let cepoch = cstate & EPOCH_MASK;
            if cepoch == cur_ix {
                if cstate & ENQUEUED != 0 {
                    let obj = citem as *mut MmmObject<T>;
                    // SAFETY: the reservation keeps the allocation
                    // readable even if a concurrent cap retires it.
                    break Some((unsafe { (*obj).value().clone() }, cur_ix));
                }
                if cstate & DEQUEUED != 0 {
                    // Linearize before the competing pop: report the item
                    // it removed, and help the index past it.
                    let obj = citem as *mut MmmObject<T>;
                    // SAFETY: as above; cap leaves the pointer in place.
                    let value = unsafe { (*obj).value().clone() };
                    let _ = store.dequeue_index.compare_exchange(
                        cur_ix,
                        cur_ix + 1,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    );
                    break Some((value, cur_ix));
                }
                // Too-slow marker at our epoch: step past it.
                let _ = store.dequeue_index.compare_exchange(
                    cur_ix,
                    cur_ix + 1,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
                continue;
            }
            if cepoch < cur_ix {
                // Invalidate whatever claim is still pending on the cell,
                // then step past it. An installed item can never sit behind
                // the read index, so nothing is discarded here.
                debug_assert!(cstate & ENQUEUED == 0);
                let _ = cell.compare_exchange(
                    v,
                    pack(0, TOOSLOW | cur_ix),
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
                let _ = store.dequeue_index.compare_exchange(
                    cur_ix,
                    cur_ix + 1,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
                continue;
            }
            // cepoch > cur_ix: we lag the writer side; bounded patience,
            // then restore progress with a migration.
            lag += 1;
            if lag > LAG_LIMIT {
                self.migrate(store_obj, th);
                lag = 0;
            }
        };
        th.end_op();
        result
    }

    /// Pop the head only if it still carries `epoch`. Wait-free; at most
    /// one cap succeeds per epoch.
    pub fn cap(&self, epoch: u64, th: &MmmThread) -> bool {
        debug_assert_same_mmm!(&self.mmm, th.mmm());
        th.begin_op();
        let result = loop {
            let store_obj = self.store.load(Ordering::SeqCst);
            // SAFETY: protected by the caller's reservation.
            let store = unsafe { (*store_obj).value() };
            let cur_ix = store.dequeue_index.load(Ordering::SeqCst);
            let cell = &store.cells[(cur_ix & store.mask()) as usize];
            let v = cell.load(Ordering::SeqCst);
            let (citem, cstate) = unpack(v);
            if cstate & (MOVING | MOVED) != 0 {
                self.migrate(store_obj, th);
                continue;
            }
            if cstate & EPOCH_MASK != epoch || cstate & ENQUEUED == 0 {
                break false;
            }
            if cell
                .compare_exchange(
                    v,
                    pack(citem, DEQUEUED | epoch),
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                let _ = store.dequeue_index.compare_exchange(
                    cur_ix,
                    cur_ix + 1,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
                // SAFETY: the winning transition unlinked the item from
                // the reader protocol; stalled tops hold reservations.
                unsafe { th.retire(citem as *mut MmmObject<T>) };
                break true;
            }
            // Contended; re-examine the head.
        };
        th.end_op();
        result
    }

    /// Pop the head item. Lock-free wrapper over `top` + `cap`.
    pub fn dequeue(&self, th: &MmmThread) -> Option<T>
    where
        T: Clone,
    {
        loop {
            let (item, epoch) = self.top(th)?;
            if self.cap(epoch, th) {
                return Some(item);
            }
        }
    }

    /// Approximate occupancy (exact in quiescence).
    pub fn len(&self, th: &MmmThread) -> usize {
        debug_assert_same_mmm!(&self.mmm, th.mmm());
        th.begin_op();
        let store_obj = self.store.load(Ordering::SeqCst);
        // SAFETY: protected by the reservation published above.
        let store = unsafe { (*store_obj).value() };
        let enq = store.enqueue_index.load(Ordering::SeqCst);
        let deq = store.dequeue_index.load(Ordering::SeqCst);
        th.end_op();
        enq.saturating_sub(deq) as usize
    }

    /// Whether the queue looked empty at the moment of the check.
    pub fn is_empty(&self, th: &MmmThread) -> bool {
        self.len(th) == 0
    }

    /// Double the store: freeze, compact surviving items in epoch order,
    /// re-stamp above every epoch the old store issued, install, retire.
    fn migrate(&self, store_obj: *mut MmmObject<CapqStore<T>>, th: &MmmThread) {
        // SAFETY: caller holds a reservation covering store_obj.
        let store = unsafe { (*store_obj).value() };

        for cell in store.cells.iter() {
            loop {
                let cur = cell.load(Ordering::SeqCst);
                let (item, state) = unpack(cur);
                if state & (MOVING | MOVED) != 0 {
                    break;
                }
                if cell
                    .compare_exchange(cur, pack(item, state | MOVING), Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    break;
                }
            }
        }

        if store.next.load(Ordering::SeqCst).is_null() {
            // Epochs issued after the freeze can never install, so this
            // snapshot bounds every epoch the old store will ever hold.
            let base = store.enqueue_index.load(Ordering::SeqCst);
            // Every enqueued cell is live (the read side never advances
            // past an installed item), so the survivors are exactly the
            // enqueued cells, ordered by their epochs.
            let mut items: Vec<(u64, u64)> = Vec::new();
            for cell in store.cells.iter() {
                let (item, state) = unpack(cell.load(Ordering::SeqCst));
                debug_assert_frozen_cell!(state, MOVING | MOVED);
                if state & ENQUEUED != 0 {
                    items.push((state & EPOCH_MASK, item));
                }
            }
            items.sort_unstable_by_key(|&(e, _)| e);
            let k = items.len() as u64;
            let cand_store = CapqStore::<T>::new(store.size * 2, base + k, base);
            for (i, &(_, item)) in items.iter().enumerate() {
                let stamp = base + i as u64;
                cand_store.cells[(stamp & cand_store.mask()) as usize]
                    .store(pack(item, ENQUEUED | stamp), Ordering::Relaxed);
            }
            let cand = self.mmm.alloc(cand_store);
            if store
                .next
                .compare_exchange(ptr::null_mut(), cand, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                // SAFETY: the losing candidate was never published.
                unsafe { th.retire_unused(cand) };
            }
        }
        let winner = store.next.load(Ordering::SeqCst);

        for cell in store.cells.iter() {
            loop {
                let cur = cell.load(Ordering::SeqCst);
                let (item, state) = unpack(cur);
                if state & MOVED != 0 {
                    break;
                }
                if cell
                    .compare_exchange(cur, pack(item, state | MOVED), Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    break;
                }
            }
        }
        if self
            .store
            .compare_exchange(store_obj, winner, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            // SAFETY: unlinked; stalled readers hold reservations.
            unsafe { th.retire(store_obj) };
        }
    }
}

impl<T> Drop for Capq<T> {
    fn drop(&mut self) {
        let mut cur = self.store.load(Ordering::Relaxed);
        while !cur.is_null() {
            // SAFETY: exclusive access in Drop.
            let store = unsafe { (*cur).value() };
            for cell in store.cells.iter() {
                let (item, state) = unpack(cell.load(Ordering::Relaxed));
                // Items in moved cells belong to the successor store.
                if state & ENQUEUED != 0 && state & MOVED == 0 {
                    drop(unsafe { Box::from_raw(item as *mut MmmObject<T>) });
                }
            }
            let next = store.next.load(Ordering::Relaxed);
            drop(unsafe { Box::from_raw(cur) });
            cur = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Arc<Mmm>, MmmThread) {
        let mmm = Arc::new(Mmm::new());
        let th = mmm.register().unwrap();
        (mmm, th)
    }

    #[test]
    fn test_top_and_cap_protocol() {
        let (mmm, th) = setup();
        let q = Capq::new(Arc::clone(&mmm));

        let e_a = q.enqueue("a", &th);
        let e_b = q.enqueue("b", &th);
        let e_c = q.enqueue("c", &th);
        assert!(e_a < e_b && e_b < e_c);

        assert_eq!(q.top(&th), Some(("a", e_a)));
        // Capping a non-head epoch must fail without disturbing the head.
        assert!(!q.cap(e_b, &th));
        assert!(q.cap(e_a, &th));
        assert_eq!(q.top(&th), Some(("b", e_b)));
    }

    #[test]
    fn test_cap_exclusive_per_epoch() {
        let (mmm, th) = setup();
        let q = Capq::new(Arc::clone(&mmm));

        let e = q.enqueue(1u64, &th);
        assert!(q.cap(e, &th));
        assert!(!q.cap(e, &th));
    }

    #[test]
    fn test_dequeue_wrapper_fifo() {
        let (mmm, th) = setup();
        let q = Capq::new(Arc::clone(&mmm));

        for i in 0..20u64 {
            q.enqueue(i, &th);
        }
        for i in 0..20u64 {
            assert_eq!(q.dequeue(&th), Some(i));
        }
        assert_eq!(q.dequeue(&th), None);
    }

    #[test]
    fn test_migration_preserves_order_and_epochs() {
        let (mmm, th) = setup();
        let q = Capq::new(Arc::clone(&mmm));

        // Two full capacities force at least one doubling migration.
        let n = DEFAULT_SIZE * 2;
        let mut last_epoch = 0;
        for i in 0..n {
            let e = q.enqueue(i, &th);
            assert!(e > last_epoch, "epochs must stay strictly increasing");
            last_epoch = e;
        }
        assert_eq!(q.len(&th), n as usize);
        for i in 0..n {
            assert_eq!(q.dequeue(&th), Some(i));
        }
        assert!(q.is_empty(&th));
    }

    #[test]
    fn test_cap_with_stale_epoch_after_migration() {
        let (mmm, th) = setup();
        let q = Capq::new(Arc::clone(&mmm));

        let stale = q.enqueue(0u64, &th);
        assert!(q.cap(stale, &th));

        // Force a doubling migration; survivors are re-stamped above every
        // old epoch, so the stale epoch can never cap again.
        for i in 1..=DEFAULT_SIZE + 1 {
            q.enqueue(i, &th);
        }
        assert!(!q.cap(stale, &th));
        let (_, head_epoch) = q.top(&th).unwrap();
        assert!(head_epoch > stale);
    }

    #[test]
    fn test_interleaved_enqueue_dequeue() {
        let (mmm, th) = setup();
        let q = Capq::new(Arc::clone(&mmm));

        let mut expected = 0u64;
        for round in 0..150u64 {
            q.enqueue(round * 2, &th);
            q.enqueue(round * 2 + 1, &th);
            assert_eq!(q.dequeue(&th), Some(expected));
            expected += 1;
        }
        for i in expected..300 {
            assert_eq!(q.dequeue(&th), Some(i));
        }
        assert_eq!(q.dequeue(&th), None);
    }

    #[test]
    fn test_top_empty() {
        let (mmm, th) = setup();
        let q: Capq<u64> = Capq::new(Arc::clone(&mmm));
        assert_eq!(q.top(&th), None);
        assert!(!q.cap(1, &th));
    }
}
