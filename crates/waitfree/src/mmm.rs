use crate::invariants::{debug_assert_epoch_committed, debug_assert_reservation_active};
use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

// =============================================================================
// EPOCH & RESERVATION PROTOCOL
// =============================================================================
//
// The manager keeps one global 64-bit epoch counter and a fixed table of
// per-thread reservation slots. The protocol:
//
// **Reader (any operation):**
// 1. Publish the current epoch into this thread's slot (SeqCst store)
// 2. Dereference shared pointers freely until the operation ends
// 3. Store the inactive sentinel into the slot, then drain
//
// **Retirer:**
// 1. Unlink the object from all shared structures (CAS)
// 2. Stamp retirement-epoch = current epoch, append to the thread-local list
// 3. On drain, free every entry whose retirement epoch is strictly below
//    the minimum live reservation
//
// The publish-then-read order is what makes the scheme sound: a reader can
// only reach an object through a pointer it loads *after* publishing its
// reservation, and an object is only retired *after* it became unreachable
// to new loads. A stalled reader that published epoch E therefore pins
// every object retired at epoch >= E, and nothing else.
//
// ## Slot ownership
//
// Each reservation slot is written only by its owning thread; the drain
// pass reads all slots. Slots are claimed through `Mmm::register` and
// released when the returned `MmmThread` handle drops, so a thread id is
// never shared between two live threads.
//
// =============================================================================

/// Compile-time upper bound on concurrently registered threads.
pub const MAX_THREADS: usize = 128;

/// Reservation slot value meaning "no operation in flight".
const INACTIVE: u64 = u64::MAX;

/// Retirement-list length that triggers an amortized drain on retire.
const DRAIN_THRESHOLD: usize = 64;

/// A monotonically increasing logical clock value.
pub type Epoch = u64;

/// Error type for thread registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MmmError {
    /// All reservation slots are claimed (exceeds the compile-time bound).
    #[error("too many registered threads (max: {max})")]
    ThreadSlotsExhausted {
        /// The compile-time maximum number of registered threads.
        max: usize,
    },
}

type CleanupFn = unsafe fn(*mut u8, *mut u8);

/// Per-allocation metadata, laid out immediately before the value.
///
/// The create and write epochs double as user-visible timestamps: keyed
/// structures use create-epoch for insertion-order views and write-epoch
/// for linearizable snapshot cutoffs.
#[repr(C)]
pub struct MmmHeader {
    create_epoch: AtomicU64,
    write_epoch: AtomicU64,
    retire_epoch: AtomicU64,
    cleanup_fn: AtomicUsize,
    cleanup_aux: AtomicPtr<u8>,
}

impl MmmHeader {
    fn new(create: Epoch, write: Epoch) -> Self {
        Self {
            create_epoch: AtomicU64::new(create),
            write_epoch: AtomicU64::new(write),
            retire_epoch: AtomicU64::new(0),
            cleanup_fn: AtomicUsize::new(0),
            cleanup_aux: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// The epoch at which this object was allocated.
    #[inline]
    pub fn create_epoch(&self) -> Epoch {
        self.create_epoch.load(Ordering::SeqCst)
    }

    /// The epoch at which this object's write was committed (0 if pending).
    #[inline]
    pub fn write_epoch(&self) -> Epoch {
        self.write_epoch.load(Ordering::SeqCst)
    }

    /// Overwrite the create epoch.
    ///
    /// Used by keyed structures when a replacement must keep the original
    /// insertion time of the record it displaces.
    #[inline]
    pub fn set_create_epoch(&self, epoch: Epoch) {
        self.create_epoch.store(epoch, Ordering::SeqCst);
    }

    /// Publish the write epoch, unless a writer (or helper) already did.
    ///
    /// Idempotent: the first committer wins and every later call is a no-op,
    /// so writers and helpers can race freely.
    #[inline]
    pub fn commit_write(&self, epoch: Epoch) {
        let _ = self
            .write_epoch
            .compare_exchange(0, epoch, Ordering::SeqCst, Ordering::SeqCst);
    }

    /// Fill in the write epoch on behalf of a stalled writer.
    ///
    /// Identical to [`commit_write`](Self::commit_write); the separate name
    /// marks call sites where the committing thread is not the allocator.
    #[inline]
    pub fn help_commit(&self, epoch: Epoch) {
        self.commit_write(epoch);
    }

    fn set_retire_epoch(&self, epoch: Epoch) {
        self.retire_epoch.store(epoch, Ordering::SeqCst);
    }
}

/// An epoch-managed heap allocation: header plus value.
///
/// Shared structures traffic in `*mut MmmObject<T>` pointers; the manager
/// guarantees the allocation outlives every reservation that could still
/// reach it.
#[repr(C)]
pub struct MmmObject<T> {
    header: MmmHeader,
    value: T,
}

impl<T> MmmObject<T> {
    /// Access the allocation header.
    #[inline]
    pub fn header(&self) -> &MmmHeader {
        &self.header
    }

    /// Access the stored value.
    #[inline]
    pub fn value(&self) -> &T {
        &self.value
    }

    pub(crate) fn value_mut(&mut self) -> &mut T {
        &mut self.value
    }

    /// Attach a cleanup handler run immediately before the allocator
    /// releases this object.
    ///
    /// # Safety
    ///
    /// `f` must be sound to call with this object's value pointer and `aux`
    /// at any point up to the free, on whichever thread performs the drain.
    pub unsafe fn add_cleanup_handler(&self, f: CleanupFn, aux: *mut u8) {
        self.header.cleanup_aux.store(aux, Ordering::SeqCst);
        self.header.cleanup_fn.store(f as usize, Ordering::SeqCst);
    }
}

/// Type-erased free routine for a retired `MmmObject<T>`.
///
/// Runs the cleanup handler (if one was attached), then drops the box.
unsafe fn free_object<T>(raw: *mut u8) {
    let obj = raw.cast::<MmmObject<T>>();
    let f = (*obj).header.cleanup_fn.load(Ordering::SeqCst);
    if f != 0 {
        let aux = (*obj).header.cleanup_aux.load(Ordering::SeqCst);
        let f: CleanupFn = mem::transmute(f);
        f(ptr::addr_of_mut!((*obj).value).cast::<u8>(), aux);
    }
    drop(Box::from_raw(obj));
}

/// Free an allocation immediately, cleanup handler included.
///
/// Teardown-only: callers must have exclusive access (e.g. `Drop`).
///
/// # Safety
///
/// `obj` must be a live allocation from this module that no other thread
/// can reach.
pub(crate) unsafe fn free_object_now<T>(obj: *mut MmmObject<T>) {
    free_object::<T>(obj.cast::<u8>());
}

/// One entry on a retirement list.
struct Retired {
    ptr: *mut u8,
    epoch: Epoch,
    free_fn: unsafe fn(*mut u8),
}

/// A batch of retirements abandoned by an exiting thread.
struct OrphanNode {
    entries: Vec<Retired>,
    next: *mut OrphanNode,
}

struct Slot {
    reservation: AtomicU64,
    claimed: AtomicBool,
}

/// The memory-management manager: global epoch, reservation table, and the
/// orphaned-retirement list.
///
/// One `Mmm` is shared (via `Arc`) by every structure and thread that must
/// agree on reclamation. Structures built over different managers must not
/// exchange pointers.
pub struct Mmm {
    epoch: CachePadded<AtomicU64>,
    slots: Box<[CachePadded<Slot>]>,
    orphans: AtomicPtr<OrphanNode>,
}

// SAFETY: all shared state is atomic; the orphan list is a Treiber stack
// whose nodes are owned by the list once pushed.
unsafe impl Send for Mmm {}
unsafe impl Sync for Mmm {}

impl Mmm {
    /// Create a new manager with the epoch clock at 1.
    pub fn new() -> Self {
        let slots = (0..MAX_THREADS)
            .map(|_| {
                CachePadded::new(Slot {
                    reservation: AtomicU64::new(INACTIVE),
                    claimed: AtomicBool::new(false),
                })
            })
            .collect();
        Self {
            epoch: CachePadded::new(AtomicU64::new(1)),
            slots,
            orphans: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Read the global epoch.
    #[inline]
    pub fn current_epoch(&self) -> Epoch {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Claim a reservation slot for the calling thread.
    ///
    /// The returned handle releases the slot (and hands off any pending
    /// retirements) when dropped.
    pub fn register(self: &Arc<Self>) -> Result<MmmThread, MmmError> {
        for (ix, slot) in self.slots.iter().enumerate() {
            if slot
                .claimed
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                slot.reservation.store(INACTIVE, Ordering::SeqCst);
                return Ok(MmmThread {
                    mmm: Arc::clone(self),
                    slot: ix,
                    retired: UnsafeCell::new(Vec::new()),
                });
            }
        }
        Err(MmmError::ThreadSlotsExhausted { max: MAX_THREADS })
    }

    /// Allocate a committed object: write-epoch equals create-epoch.
    ///
    /// Structure constructors use this directly; operation paths go through
    /// [`MmmThread::alloc`].
    pub fn alloc<T>(&self, value: T) -> *mut MmmObject<T> {
        let e = self.current_epoch();
        Box::into_raw(Box::new(MmmObject {
            header: MmmHeader::new(e, e),
            value,
        }))
    }

    /// Allocate an uncommitted object: write-epoch is filled in later by
    /// [`MmmHeader::commit_write`] or [`MmmHeader::help_commit`].
    pub fn alloc_uncommitted<T>(&self, value: T) -> *mut MmmObject<T> {
        let e = self.current_epoch();
        Box::into_raw(Box::new(MmmObject {
            header: MmmHeader::new(e, 0),
            value,
        }))
    }

    /// The smallest epoch any in-flight operation may still dereference.
    fn min_reservation(&self) -> Epoch {
        let mut min = INACTIVE;
        for slot in self.slots.iter() {
            let r = slot.reservation.load(Ordering::SeqCst);
            if r < min {
                min = r;
            }
        }
        min
    }

    /// Retire an object without a thread handle.
    ///
    /// Used by teardown paths (e.g. view handles) that outlive the
    /// operation that produced them. The entry goes straight onto the
    /// orphan list and is freed by a later drain.
    ///
    /// # Safety
    ///
    /// `obj` must be an allocation from this manager that is no longer
    /// reachable by new operations.
    pub(crate) unsafe fn retire_orphan<T>(&self, obj: *mut MmmObject<T>) {
        let epoch = self.current_epoch();
        (*obj).header.set_retire_epoch(epoch);
        self.push_orphans(vec![Retired {
            ptr: obj.cast::<u8>(),
            epoch,
            free_fn: free_object::<T>,
        }]);
    }

    fn push_orphans(&self, entries: Vec<Retired>) {
        if entries.is_empty() {
            return;
        }
        let node = Box::into_raw(Box::new(OrphanNode {
            entries,
            next: ptr::null_mut(),
        }));
        loop {
            let head = self.orphans.load(Ordering::SeqCst);
            // SAFETY: node is not yet shared; we own it until the CAS wins.
            unsafe { (*node).next = head };
            if self
                .orphans
                .compare_exchange_weak(head, node, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Detach the whole orphan list, returning its entries.
    fn adopt_orphans(&self) -> Vec<Retired> {
        let mut head = self.orphans.swap(ptr::null_mut(), Ordering::SeqCst);
        let mut adopted = Vec::new();
        while !head.is_null() {
            // SAFETY: detaching the list gave us exclusive ownership.
            let mut node = unsafe { Box::from_raw(head) };
            adopted.append(&mut node.entries);
            head = node.next;
        }
        adopted
    }
}

impl Default for Mmm {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Mmm {
    fn drop(&mut self) {
        // Every thread handle and every structure holding this manager is
        // gone, so no reservation can be live: free unconditionally.
        for r in self.adopt_orphans() {
            unsafe { (r.free_fn)(r.ptr) };
        }
    }
}

/// A thread's registration with the manager: reservation slot plus the
/// thread-local retirement list.
///
/// All epoch operations and all structure operations go through a handle.
/// The handle is `Send` (a thread context can migrate) but not `Sync`:
/// the retirement list has exactly one writer.
pub struct MmmThread {
    mmm: Arc<Mmm>,
    slot: usize,
    retired: UnsafeCell<Vec<Retired>>,
}

// SAFETY: the retirement list is owned by the handle; moving the handle to
// another thread moves sole ownership with it.
unsafe impl Send for MmmThread {}

impl MmmThread {
    /// The manager this handle is registered with.
    #[inline]
    pub fn mmm(&self) -> &Arc<Mmm> {
        &self.mmm
    }

    #[inline]
    fn slot(&self) -> &Slot {
        &self.mmm.slots[self.slot]
    }

    /// Begin an operation: publish the current epoch as this thread's
    /// reservation. Returns the reserved epoch.
    #[inline]
    pub fn begin_op(&self) -> Epoch {
        let e = self.mmm.epoch.load(Ordering::SeqCst);
        self.slot().reservation.store(e, Ordering::SeqCst);
        e
    }

    /// Begin a linearized operation: advance the epoch and reserve the new
    /// value, giving the caller a private linearization point even though
    /// later writers may commit at the same epoch.
    #[inline]
    pub fn begin_linearized_op(&self) -> Epoch {
        let e = self.mmm.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.slot().reservation.store(e, Ordering::SeqCst);
        e
    }

    /// End the current operation and drain what the grace period allows.
    #[inline]
    pub fn end_op(&self) {
        debug_assert_reservation_active!(self.slot().reservation.load(Ordering::SeqCst), INACTIVE);
        self.slot().reservation.store(INACTIVE, Ordering::SeqCst);
        self.drain(true);
    }

    /// Allocate a committed object: write-epoch equals create-epoch.
    #[inline]
    pub fn alloc<T>(&self, value: T) -> *mut MmmObject<T> {
        self.mmm.alloc(value)
    }

    /// Allocate an uncommitted object: write-epoch is filled in later by
    /// [`MmmHeader::commit_write`] or [`MmmHeader::help_commit`].
    #[inline]
    pub fn alloc_uncommitted<T>(&self, value: T) -> *mut MmmObject<T> {
        self.mmm.alloc_uncommitted(value)
    }

    /// Retire a published object: stamp the retirement epoch and defer the
    /// free until every reservation at or below it has ended.
    ///
    /// # Safety
    ///
    /// `obj` must be an allocation from this manager that has been made
    /// unreachable to new operations (unlinked from all shared state).
    pub unsafe fn retire<T>(&self, obj: *mut MmmObject<T>) {
        debug_assert!(!obj.is_null());
        let epoch = self.mmm.current_epoch();
        (*obj).header.set_retire_epoch(epoch);
        let retired = &mut *self.retired.get();
        retired.push(Retired {
            ptr: obj.cast::<u8>(),
            epoch,
            free_fn: free_object::<T>,
        });
        if retired.len() >= DRAIN_THRESHOLD {
            self.drain(false);
        }
    }

    /// Retire an object that was never published.
    ///
    /// No reservation can reach an unpublished allocation, so it is freed
    /// immediately (cleanup handler included).
    ///
    /// # Safety
    ///
    /// `obj` must be an allocation from this manager that was never stored
    /// into any shared location.
    pub unsafe fn retire_unused<T>(&self, obj: *mut MmmObject<T>) {
        debug_assert!(!obj.is_null());
        free_object::<T>(obj.cast::<u8>());
    }

    /// Free every retired entry the grace period has released.
    ///
    /// `adopt` additionally folds in batches abandoned by exited threads;
    /// it is set on the end-of-operation path so orphans are eventually
    /// collected even if no thread retires anything further.
    fn drain(&self, adopt: bool) {
        // SAFETY: the handle is !Sync, so this thread is the only writer of
        // the retirement list.
        let retired = unsafe { &mut *self.retired.get() };
        if adopt && !self.mmm.orphans.load(Ordering::SeqCst).is_null() {
            retired.append(&mut self.mmm.adopt_orphans());
        }
        if retired.is_empty() {
            return;
        }
        let min = self.mmm.min_reservation();
        retired.retain(|r| {
            debug_assert_epoch_committed!(r.epoch);
            if r.epoch < min {
                // SAFETY: retirement epoch is below every live reservation,
                // so no thread can still hold a pointer into the object.
                unsafe { (r.free_fn)(r.ptr) };
                false
            } else {
                true
            }
        });
    }
}

impl Drop for MmmThread {
    fn drop(&mut self) {
        // A handle dropped mid-operation would wedge the grace period.
        self.slot().reservation.store(INACTIVE, Ordering::SeqCst);
        self.drain(true);
        let leftovers = mem::take(self.retired.get_mut());
        self.mmm.push_orphans(leftovers);
        self.slot().claimed.store(false, Ordering::SeqCst);
    }
}
