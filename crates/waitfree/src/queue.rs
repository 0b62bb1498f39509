use crate::invariants::debug_assert_same_mmm;
use crate::mmm::{Mmm, MmmObject, MmmThread};
use crossbeam_utils::CachePadded;
use portable_atomic::AtomicU128;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};
use std::sync::Arc;

// =============================================================================
// SLOT PROTOCOL
// =============================================================================
//
// The queue is a linked list of fixed-size segments. Within a segment,
// enqueuers and dequeuers claim slots from two independent fetch-add
// counters and meet at the cell:
//
// **Enqueuer:** claim an index, then CAS the cell `empty -> (used, item)`.
// A failed CAS means a dequeuer invalidated the slot; the enqueuer doubles
// its stride so that after O(log n) attempts it escapes any group of n
// contending dequeuers. That stride doubling is what makes enqueue
// wait-free, at the price of skipped cells.
//
// **Dequeuer:** claim an index, then CAS the cell `empty -> too-slow`.
// Success means the slot will never deliver an item (the enqueue racing
// toward it must retry elsewhere); failure means an item is already
// installed and the dequeuer, sole claimant of the index, takes it.
//
// A dequeuer that observes emptiness still burns its slot with `too-slow`
// before reporting not-found. Without the burn, an enqueuer landing on an
// index no dequeuer will ever claim again would strand its item, breaking
// conservation.
//
// Cells therefore move through exactly one of:
//
//   empty -> used -> dequeued         (normal handoff)
//   empty -> too-slow                 (invalidated or skipped)
//
// and no cell is ever both used and too-slow.
//
// Segment pointers live in a single 128-bit atomic holding the pair
// (enqueue segment, dequeue segment), so a segment is retired only once
// neither half can reach it.
//
// =============================================================================

/// Default cells per segment.
const SEGMENT_SIZE: usize = 256;

/// Boundary retries before an enqueuer requests a doubled segment.
const HELP_THRESHOLD: u32 = 8;

const STATE_USED: u64 = 1 << 63;
const STATE_TOOSLOW: u64 = 1 << 62;
const STATE_DEQUEUED: u64 = 1 << 61;

const EMPTY_CELL: u128 = 0;

#[inline]
fn pack(item: u64, state: u64) -> u128 {
    (u128::from(state) << 64) | u128::from(item)
}

#[inline]
fn unpack(v: u128) -> (u64, u64) {
    (v as u64, (v >> 64) as u64)
}

struct Segment<T> {
    size: u64,
    enqueue_index: CachePadded<AtomicU64>,
    dequeue_index: CachePadded<AtomicU64>,
    next: AtomicPtr<MmmObject<Segment<T>>>,
    cells: Box<[AtomicU128]>,
    _marker: PhantomData<T>,
}

impl<T> Segment<T> {
    fn new(size: usize) -> Self {
        let cells = (0..size).map(|_| AtomicU128::new(EMPTY_CELL)).collect();
        Self {
            size: size as u64,
            enqueue_index: CachePadded::new(AtomicU64::new(0)),
            dequeue_index: CachePadded::new(AtomicU64::new(0)),
            next: AtomicPtr::new(ptr::null_mut()),
            cells,
            _marker: PhantomData,
        }
    }

    /// A candidate segment carrying the installing enqueuer's item in its
    /// first cell, so the winner of the link race has already enqueued.
    fn with_first(size: usize, item: u64) -> Self {
        let seg = Self::new(size);
        seg.cells[0].store(pack(item, STATE_USED), Ordering::Relaxed);
        seg.enqueue_index.store(1, Ordering::Relaxed);
        seg
    }
}

/// Linearizable unbounded FIFO with wait-free enqueue and dequeue.
///
/// Items are moved in on enqueue and moved out by the dequeue that claims
/// them; there is no peek and no `Clone` requirement. Segment reclamation
/// is deferred through the shared manager, so a dequeuer that advances the
/// segment list never frees memory a stalled peer might still read.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use waitfree_rs::{Mmm, Queue};
///
/// let mmm = Arc::new(Mmm::new());
/// let th = mmm.register().unwrap();
/// let q = Queue::new(Arc::clone(&mmm));
///
/// q.enqueue("first", &th);
/// q.enqueue("second", &th);
/// assert_eq!(q.dequeue(&th), Some("first"));
/// assert_eq!(q.dequeue(&th), Some("second"));
/// assert_eq!(q.dequeue(&th), None);
/// ```
pub struct Queue<T> {
    mmm: Arc<Mmm>,
    /// Packed (enqueue segment, dequeue segment) pointer pair.
    segments: AtomicU128,
    help_needed: AtomicBool,
    _marker: PhantomData<T>,
}

// SAFETY: items are owned by the cells between the enqueue CAS and the
// dequeue claim; all shared state is atomic.
unsafe impl<T: Send> Send for Queue<T> {}
unsafe impl<T: Send> Sync for Queue<T> {}

type SegPtr<T> = *mut MmmObject<Segment<T>>;

#[inline]
fn pack_segments<T>(enq: SegPtr<T>, deq: SegPtr<T>) -> u128 {
    (u128::from(deq as u64) << 64) | u128::from(enq as u64)
}

#[inline]
fn unpack_segments<T>(v: u128) -> (SegPtr<T>, SegPtr<T>) {
    ((v as u64) as SegPtr<T>, ((v >> 64) as u64) as SegPtr<T>)
}

impl<T> Queue<T> {
    /// Create an empty queue whose segments are reclaimed through `mmm`.
    pub fn new(mmm: Arc<Mmm>) -> Self {
        let first = mmm.alloc(Segment::<T>::new(SEGMENT_SIZE));
        Self {
            mmm,
            segments: AtomicU128::new(pack_segments(first, first)),
            help_needed: AtomicBool::new(false),
            _marker: PhantomData,
        }
    }

    #[inline]
    fn load_segments(&self) -> (SegPtr<T>, SegPtr<T>) {
        unpack_segments(self.segments.load(Ordering::SeqCst))
    }

    /// Append an item. Wait-free; never fails.
    pub fn enqueue(&self, item: T, th: &MmmThread) {
        debug_assert_same_mmm!(&self.mmm, th.mmm());
        th.begin_op();
        let mut item_ptr = Box::into_raw(Box::new(item)) as u64;
        let mut boundary_retries: u32 = 0;
        loop {
            let (enq_obj, _) = self.load_segments();
            // SAFETY: segment pointers read from the top-level pair are
            // protected by the reservation published in begin_op.
            let seg = unsafe { (*enq_obj).value() };
            let mut step = 1u64;
            loop {
                let ix = seg.enqueue_index.fetch_add(step, Ordering::SeqCst);
                if ix >= seg.size {
                    break;
                }
                let cell = &seg.cells[ix as usize];
                if cell
                    .compare_exchange(
                        EMPTY_CELL,
                        pack(item_ptr, STATE_USED),
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_ok()
                {
                    th.end_op();
                    return;
                }
                // A dequeuer invalidated the slot; widen the stride.
                step <<= 1;
            }

            // Segment exhausted: link a fresh one carrying our item.
            boundary_retries += 1;
            let helping = boundary_retries >= HELP_THRESHOLD;
            if helping {
                self.help_needed.store(true, Ordering::SeqCst);
            }
            let want = if helping || self.help_needed.load(Ordering::SeqCst) {
                (seg.size as usize) * 2
            } else {
                SEGMENT_SIZE
            };
            let cand = self.mmm.alloc(Segment::<T>::with_first(want, item_ptr));
            match seg.next.compare_exchange(
                ptr::null_mut(),
                cand,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    self.swing_enqueue_segment(enq_obj, cand);
                    if want > SEGMENT_SIZE {
                        self.help_needed.store(false, Ordering::SeqCst);
                    }
                    th.end_op();
                    return;
                }
                Err(winner) => {
                    // Take the item back out of the unpublished candidate
                    // and retry on whichever segment is now current.
                    // SAFETY: the candidate lost the link race, so no other
                    // thread has seen it.
                    let (it, _) = unpack(unsafe { (*cand).value() }.cells[0].load(Ordering::Relaxed));
                    item_ptr = it;
                    unsafe { th.retire_unused(cand) };
                    self.swing_enqueue_segment(enq_obj, winner);
                }
            }
        }
    }

    /// Remove the oldest item, or report observable emptiness. Wait-free.
    pub fn dequeue(&self, th: &MmmThread) -> Option<T> {
        debug_assert_same_mmm!(&self.mmm, th.mmm());
        th.begin_op();
        let result = self.dequeue_inner(th);
        th.end_op();
        result
    }

    fn dequeue_inner(&self, th: &MmmThread) -> Option<T> {
        loop {
            let (enq_obj, deq_obj) = self.load_segments();
            // SAFETY: protected by the caller's reservation.
            let seg = unsafe { (*deq_obj).value() };
            let ix = seg.dequeue_index.fetch_add(1, Ordering::SeqCst);
            if ix >= seg.size {
                let next = seg.next.load(Ordering::SeqCst);
                if next.is_null() {
                    return None;
                }
                self.swing_dequeue_segment(deq_obj, next, th);
                continue;
            }

            let observably_empty =
                deq_obj == enq_obj && ix >= seg.enqueue_index.load(Ordering::SeqCst);
            let cell = &seg.cells[ix as usize];
            match cell.compare_exchange(
                EMPTY_CELL,
                pack(0, STATE_TOOSLOW),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    if observably_empty {
                        return None;
                    }
                    // Invalidated a skipped or pending slot; next index.
                }
                Err(cur) => {
                    let (item, state) = unpack(cur);
                    // This index has exactly one dequeuer, and only
                    // enqueuers write non-empty states into fresh cells.
                    debug_assert!(state & STATE_USED != 0);
                    if state & STATE_USED != 0 {
                        // Restamp so teardown can tell consumed cells
                        // from live ones.
                        cell.store(pack(0, STATE_DEQUEUED), Ordering::SeqCst);
                        // SAFETY: the winning enqueue published this
                        // pointer via Box::into_raw and the index claim
                        // makes us its sole consumer.
                        return Some(*unsafe { Box::from_raw(item as *mut T) });
                    }
                }
            }
        }
    }

    /// Whether the queue looked empty at the moment of the check.
    ///
    /// Approximate under concurrency, exact in quiescence.
    pub fn is_empty(&self, th: &MmmThread) -> bool {
        debug_assert_same_mmm!(&self.mmm, th.mmm());
        th.begin_op();
        let (enq_obj, deq_obj) = self.load_segments();
        let empty = if enq_obj == deq_obj {
            // SAFETY: protected by the reservation published above.
            let seg = unsafe { (*deq_obj).value() };
            seg.dequeue_index.load(Ordering::SeqCst) >= seg.enqueue_index.load(Ordering::SeqCst)
        } else {
            false
        };
        th.end_op();
        empty
    }

    fn swing_enqueue_segment(&self, old: SegPtr<T>, new: SegPtr<T>) {
        loop {
            let cur = self.segments.load(Ordering::SeqCst);
            let (enq, deq) = unpack_segments::<T>(cur);
            if enq != old {
                return;
            }
            if self
                .segments
                .compare_exchange(cur, pack_segments(new, deq), Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Advance the dequeue segment, retiring `old` once neither half of the
    /// top-level pair can reach it.
    fn swing_dequeue_segment(&self, old: SegPtr<T>, next: SegPtr<T>, th: &MmmThread) {
        loop {
            let cur = self.segments.load(Ordering::SeqCst);
            let (enq, deq) = unpack_segments::<T>(cur);
            if deq != old {
                return;
            }
            let new_enq = if enq == old { next } else { enq };
            if self
                .segments
                .compare_exchange(
                    cur,
                    pack_segments(new_enq, next),
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                // SAFETY: the pair no longer references `old`; stalled
                // readers are covered by their reservations.
                unsafe { th.retire(old) };
                return;
            }
        }
    }
}

impl<T> Drop for Queue<T> {
    fn drop(&mut self) {
        // Walk the live chain, dropping unconsumed items and the segments
        // themselves. Segments already swung past were retired through the
        // manager and are not ours to free.
        let (_, deq_obj) = self.load_segments();
        let mut cur = deq_obj;
        while !cur.is_null() {
            // SAFETY: exclusive access in Drop.
            let seg = unsafe { (*cur).value() };
            for cell in seg.cells.iter() {
                let (item, state) = unpack(cell.load(Ordering::Relaxed));
                if state & STATE_USED != 0 {
                    drop(unsafe { Box::from_raw(item as *mut T) });
                }
            }
            let next = seg.next.load(Ordering::Relaxed);
            drop(unsafe { Box::from_raw(cur) });
            cur = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn setup() -> (Arc<Mmm>, MmmThread) {
        let mmm = Arc::new(Mmm::new());
        let th = mmm.register().unwrap();
        (mmm, th)
    }

    #[test]
    fn test_fifo_order() {
        let (mmm, th) = setup();
        let q = Queue::new(Arc::clone(&mmm));

        for i in 0..10u64 {
            q.enqueue(i, &th);
        }
        for i in 0..10u64 {
            assert_eq!(q.dequeue(&th), Some(i));
        }
        assert_eq!(q.dequeue(&th), None);
    }

    #[test]
    fn test_empty_dequeue() {
        let (mmm, th) = setup();
        let q: Queue<u64> = Queue::new(Arc::clone(&mmm));
        assert!(q.is_empty(&th));
        assert_eq!(q.dequeue(&th), None);
    }

    #[test]
    fn test_burned_slot_does_not_strand_items() {
        let (mmm, th) = setup();
        let q = Queue::new(Arc::clone(&mmm));

        // Each empty dequeue burns a slot; enqueues must still hand every
        // item to a later dequeue.
        for _ in 0..5 {
            assert_eq!(q.dequeue(&th), None);
        }
        for i in 0..5u64 {
            q.enqueue(i, &th);
        }
        for i in 0..5u64 {
            assert_eq!(q.dequeue(&th), Some(i));
        }
        assert_eq!(q.dequeue(&th), None);
    }

    #[test]
    fn test_segment_growth_preserves_order() {
        let (mmm, th) = setup();
        let q = Queue::new(Arc::clone(&mmm));

        let n = (SEGMENT_SIZE * 3) as u64;
        for i in 0..n {
            q.enqueue(i, &th);
        }
        for i in 0..n {
            assert_eq!(q.dequeue(&th), Some(i));
        }
        assert_eq!(q.dequeue(&th), None);
    }

    #[test]
    fn test_interleaved_enqueue_dequeue() {
        let (mmm, th) = setup();
        let q = Queue::new(Arc::clone(&mmm));

        let mut expected = 0u64;
        for round in 0..200u64 {
            q.enqueue(round * 2, &th);
            q.enqueue(round * 2 + 1, &th);
            assert_eq!(q.dequeue(&th), Some(expected));
            expected += 1;
        }
        // Half the items remain, still in order.
        for i in expected..400 {
            assert_eq!(q.dequeue(&th), Some(i));
        }
        assert_eq!(q.dequeue(&th), None);
    }

    #[test]
    fn test_drop_frees_unconsumed_items() {
        static DROP_COUNT: AtomicUsize = AtomicUsize::new(0);

        struct DropTracker;
        impl Drop for DropTracker {
            fn drop(&mut self) {
                DROP_COUNT.fetch_add(1, Ordering::SeqCst);
            }
        }

        DROP_COUNT.store(0, Ordering::SeqCst);
        let (mmm, th) = setup();
        {
            let q = Queue::new(Arc::clone(&mmm));
            for _ in 0..7 {
                q.enqueue(DropTracker, &th);
            }
            drop(q.dequeue(&th));
            assert_eq!(DROP_COUNT.load(Ordering::SeqCst), 1);
        }
        assert_eq!(DROP_COUNT.load(Ordering::SeqCst), 7);
    }
}
