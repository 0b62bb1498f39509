use crate::invariants::{debug_assert_frozen_cell, debug_assert_same_mmm};
use crate::mmm::{Mmm, MmmObject, MmmThread};
use crossbeam_utils::CachePadded;
use portable_atomic::AtomicU128;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::Arc;

// =============================================================================
// HEAD STATE & VALID-AFTER
// =============================================================================
//
// The stack is a contiguous cell array plus one 64-bit head state packing
// (moving flag, store epoch, head index). Pushers claim an index with a
// fetch-add; poppers scan downward from the index. Because a pop can beat
// a push that claimed a lower index, cells can die: the `valid-after`
// field recorded in each cell decides whether a claimed slot may still be
// written.
//
// * A push at head epoch E may fill a cell that is empty, or popped with
//   valid-after < E.
// * A pop at head epoch E stamps the cell popped with valid-after = E and
//   then tries to swing the head index down, bumping the store epoch.
//
// The epoch bump on the swing is the crux: a pusher whose claim predates
// the swing holds the old epoch and is locked out of the popped cell,
// while pushers arriving after the swing hold a strictly larger epoch and
// may recycle it. Out-of-order writes are blocked without blocking reuse.
//
// When the index reaches the cell count the store migrates: every cell is
// frozen, still-pushed items are compacted in order into a fresh store
// (double-size only if the old one was more than half full), and the old
// store is retired through the manager.
//
// =============================================================================

/// Initial cell count.
const DEFAULT_SIZE: u64 = 64;

const HS_MOVING: u64 = 1 << 63;
const HS_INDEX_MASK: u64 = 0xffff_ffff;
const HS_EPOCH_MASK: u64 = 0x7fff_ffff;

#[inline]
fn pack_hs(epoch: u64, index: u64) -> u64 {
    ((epoch & HS_EPOCH_MASK) << 32) | (index & HS_INDEX_MASK)
}

#[inline]
fn hs_epoch(hs: u64) -> u64 {
    (hs >> 32) & HS_EPOCH_MASK
}

#[inline]
fn hs_index(hs: u64) -> u64 {
    hs & HS_INDEX_MASK
}

const PUSHED: u64 = 1 << 63;
const POPPED: u64 = 1 << 62;
const MOVING: u64 = 1 << 61;
const MOVED: u64 = 1 << 60;
/// Low 32 bits of the cell state: the valid-after epoch.
const VA_MASK: u64 = 0xffff_ffff;

#[inline]
fn pack(item: u64, state: u64) -> u128 {
    (u128::from(state) << 64) | u128::from(item)
}

#[inline]
fn unpack(v: u128) -> (u64, u64) {
    (v as u64, (v >> 64) as u64)
}

struct StackStore<T> {
    size: u64,
    /// Packed (moving, store epoch, head index); epoch starts at 1.
    head_state: CachePadded<AtomicU64>,
    next: AtomicPtr<MmmObject<StackStore<T>>>,
    cells: Box<[AtomicU128]>,
    _marker: PhantomData<T>,
}

impl<T> StackStore<T> {
    fn new(size: u64, epoch: u64, index: u64) -> Self {
        let cells = (0..size).map(|_| AtomicU128::new(0)).collect();
        Self {
            size,
            head_state: CachePadded::new(AtomicU64::new(pack_hs(epoch, index))),
            next: AtomicPtr::new(ptr::null_mut()),
            cells,
            _marker: PhantomData,
        }
    }
}

/// Lock-free array-backed LIFO stack with in-place compaction.
///
/// `push` takes ownership; `pop` and `peek` return clones taken under an
/// epoch reservation, with `pop` retiring the original through the shared
/// manager. The structure tolerates arbitrary interleavings of push, pop,
/// and migration: dead cells left by pops that beat earlier pushes are
/// skipped and eventually compacted away.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use waitfree_rs::{Mmm, Stack};
///
/// let mmm = Arc::new(Mmm::new());
/// let th = mmm.register().unwrap();
/// let stack = Stack::new(Arc::clone(&mmm));
///
/// stack.push(1u64, &th);
/// stack.push(2, &th);
/// assert_eq!(stack.peek(&th), Some(2));
/// assert_eq!(stack.pop(&th), Some(2));
/// assert_eq!(stack.pop(&th), Some(1));
/// assert_eq!(stack.pop(&th), None);
/// ```
pub struct Stack<T> {
    mmm: Arc<Mmm>,
    store: AtomicPtr<MmmObject<StackStore<T>>>,
    _marker: PhantomData<T>,
}

// SAFETY: items live in manager-owned allocations reachable only through
// atomic cells; clones are taken under reservations.
unsafe impl<T: Send + Sync> Send for Stack<T> {}
unsafe impl<T: Send + Sync> Sync for Stack<T> {}

impl<T> Stack<T> {
    /// Create an empty stack.
    pub fn new(mmm: Arc<Mmm>) -> Self {
        let store = mmm.alloc(StackStore::<T>::new(DEFAULT_SIZE, 1, 0));
        Self {
            mmm,
            store: AtomicPtr::new(store),
            _marker: PhantomData,
        }
    }

    /// Push an item. Lock-free.
    pub fn push(&self, item: T, th: &MmmThread) {
        debug_assert_same_mmm!(&self.mmm, th.mmm());
        th.begin_op();
        let obj = th.alloc(item);
        'outer: loop {
            let store_obj = self.store.load(Ordering::SeqCst);
            // SAFETY: protected by the reservation published above.
            let store = unsafe { (*store_obj).value() };
            let hs = store.head_state.fetch_add(1, Ordering::SeqCst);
            if hs & HS_MOVING != 0 {
                self.migrate(store_obj, th);
                continue;
            }
            let e = hs_epoch(hs);
            let ix = hs_index(hs);
            if ix >= store.size {
                self.migrate(store_obj, th);
                continue;
            }
            let cell = &store.cells[ix as usize];
            loop {
                let cur = cell.load(Ordering::SeqCst);
                let (_, cstate) = unpack(cur);
                if cstate & (MOVING | MOVED) != 0 {
                    self.migrate(store_obj, th);
                    continue 'outer;
                }
                let accepts =
                    cstate == 0 || (cstate & POPPED != 0 && (cstate & VA_MASK) < e);
                if !accepts {
                    // Occupied, or our claim expired; take a fresh index.
                    continue 'outer;
                }
                if cell
                    .compare_exchange(
                        cur,
                        pack(obj as u64, PUSHED | (e & VA_MASK)),
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_ok()
                {
                    th.end_op();
                    return;
                }
            }
        }
    }

    /// Pop the most recently pushed live item. Lock-free.
    pub fn pop(&self, th: &MmmThread) -> Option<T>
    where
        T: Clone,
    {
        debug_assert_same_mmm!(&self.mmm, th.mmm());
        th.begin_op();
        let result = 'outer: loop {
            let store_obj = self.store.load(Ordering::SeqCst);
            // SAFETY: protected by the caller's reservation.
            let store = unsafe { (*store_obj).value() };
            let hs = store.head_state.load(Ordering::SeqCst);
            if hs & HS_MOVING != 0 {
                self.migrate(store_obj, th);
                continue;
            }
            let e = hs_epoch(hs);
            let top = hs_index(hs).min(store.size);
            if top == 0 {
                break 'outer None;
            }
            let mut j = top;
            while j > 0 {
                j -= 1;
                let cell = &store.cells[j as usize];
                loop {
                    let cur = cell.load(Ordering::SeqCst);
                    let (citem, cstate) = unpack(cur);
                    if cstate & (MOVING | MOVED) != 0 {
                        self.migrate(store_obj, th);
                        continue 'outer;
                    }
                    if cstate & PUSHED == 0 {
                        // Empty or popped: continue downward.
                        break;
                    }
                    if cell
                        .compare_exchange(
                            cur,
                            pack(0, POPPED | (e & VA_MASK)),
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        )
                        .is_ok()
                    {
                        // Swing the head down past the popped run, bumping
                        // the store epoch so expired pushes stay locked out.
                        let _ = store.head_state.compare_exchange(
                            hs,
                            pack_hs(e + 1, j),
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        );
                        let obj = citem as *mut MmmObject<T>;
                        // SAFETY: the CAS unlinked the allocation; the
                        // reservation keeps it readable until end_op.
                        let value = unsafe { (*obj).value().clone() };
                        unsafe { th.retire(obj) };
                        break 'outer Some(value);
                    }
                }
            }
            break 'outer None;
        };
        th.end_op();
        result
    }

    /// Read the top item without removing it. Linearized to the head-state
    /// load.
    pub fn peek(&self, th: &MmmThread) -> Option<T>
    where
        T: Clone,
    {
        debug_assert_same_mmm!(&self.mmm, th.mmm());
        th.begin_op();
        let result = 'outer: loop {
            let store_obj = self.store.load(Ordering::SeqCst);
            // SAFETY: protected by the caller's reservation.
            let store = unsafe { (*store_obj).value() };
            let hs = store.head_state.load(Ordering::SeqCst);
            if hs & HS_MOVING != 0 {
                self.migrate(store_obj, th);
                continue;
            }
            let top = hs_index(hs).min(store.size);
            let mut j = top;
            while j > 0 {
                j -= 1;
                let cell = &store.cells[j as usize];
                let (citem, cstate) = unpack(cell.load(Ordering::SeqCst));
                if cstate & (MOVING | MOVED) != 0 {
                    self.migrate(store_obj, th);
                    continue 'outer;
                }
                if cstate & PUSHED != 0 {
                    let obj = citem as *mut MmmObject<T>;
                    // SAFETY: the reservation keeps the allocation readable.
                    break 'outer Some(unsafe { (*obj).value().clone() });
                }
            }
            break 'outer None;
        };
        th.end_op();
        result
    }

    /// Grow or compact: freeze the store, copy still-pushed items in order
    /// into a compact prefix of a fresh store, and install it.
    fn migrate(&self, store_obj: *mut MmmObject<StackStore<T>>, th: &MmmThread) {
        // SAFETY: caller holds a reservation covering store_obj.
        let store = unsafe { (*store_obj).value() };

        // Announce on the head state, then freeze every cell.
        loop {
            let hs = store.head_state.load(Ordering::SeqCst);
            if hs & HS_MOVING != 0 {
                break;
            }
            if store
                .head_state
                .compare_exchange(hs, hs | HS_MOVING, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break;
            }
        }
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
            // Frozen cells are stable, so every helper computes the same
            // candidate; only one gets published.
            let mut items = Vec::new();
            for cell in store.cells.iter() {
                let (item, state) = unpack(cell.load(Ordering::SeqCst));
                debug_assert_frozen_cell!(state, MOVING | MOVED);
                if state & PUSHED != 0 {
                    items.push(item);
                }
            }
            let live = items.len() as u64;
            let new_size = if live * 2 > store.size {
                store.size * 2
            } else {
                store.size
            };
            let old_epoch = hs_epoch(store.head_state.load(Ordering::SeqCst));
            let new_epoch = old_epoch + 1;
            let cand_store = StackStore::<T>::new(new_size, new_epoch, live);
            for (i, item) in items.iter().enumerate() {
                cand_store.cells[i].store(
                    pack(*item, PUSHED | ((new_epoch - 1) & VA_MASK)),
                    Ordering::Relaxed,
                );
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

        // Mark the sources moved, then swing the top-level pointer.
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
            // SAFETY: the store is unlinked; stalled readers hold
            // reservations.
            unsafe { th.retire(store_obj) };
        }
    }
}

impl<T> Drop for Stack<T> {
    fn drop(&mut self) {
        let mut cur = self.store.load(Ordering::Relaxed);
        while !cur.is_null() {
            // SAFETY: exclusive access in Drop.
            let store = unsafe { (*cur).value() };
            for cell in store.cells.iter() {
                let (item, state) = unpack(cell.load(Ordering::Relaxed));
                // Items in moved cells belong to the successor store.
                if state & PUSHED != 0 && state & MOVED == 0 {
                    drop(unsafe { Box::from_raw(item as *mut MmmObject<T>) });
                }
            }
            let next = store.next.load(Ordering::Relaxed);
            drop(unsafe { Box::from_raw(cur) });
            cur = next;
        }
    }
}
