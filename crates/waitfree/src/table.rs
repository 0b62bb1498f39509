use crate::invariants::debug_assert_same_mmm;
use crate::mmm::{free_object_now, Epoch, Mmm, MmmObject, MmmThread};
use portable_atomic::AtomicU128;
use std::marker::PhantomData;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

// =============================================================================
// BUCKETS, RECORDS, AND THE TWO-EPOCH DISCIPLINE
// =============================================================================
//
// A store is a power-of-two bucket array probed linearly. Each bucket is a
// 128-bit hash slot (CAS from zero reserves it; once reserved it holds
// that hash for the store's lifetime) and a 64-bit head word whose low two
// bits carry the MOVING / MOVED migration flags, with the remaining bits
// pointing at the newest record.
//
// Records form a stack per bucket: every write pushes a fresh record whose
// `next` holds the displaced head, with the low bit of `next` marking the
// record as an insertion rather than a deletion. Displaced records are
// retired, not freed: snapshot readers walk the stack under their
// reservations.
//
// The manager's two header epochs carry the consistency story:
//
// * create-epoch orders insertions (a replacement copies its
//   predecessor's, so a key keeps its original insertion time);
// * write-epoch is the commit timestamp a snapshot compares against its
//   linearization epoch. Writers commit their own record after the head
//   CAS and help-commit the record they displace first, so write epochs
//   never decrease along any record stack.
//
// A write linearizes at its head CAS; a read at its head load; a view at
// the epoch `begin_linearized_op` returned.
//
// =============================================================================

/// Smallest bucket count.
const MIN_SIZE: u64 = 16;

/// Head-pointer tag bits.
const HEAD_MOVING: u64 = 1;
const HEAD_MOVED: u64 = 2;
const HEAD_FLAGS: u64 = HEAD_MOVING | HEAD_MOVED;

/// Low bit of a record's `next`: set when the record is an insertion.
const RECORD_USED: u64 = 1;

struct Record<T> {
    /// `None` for deletion records.
    item: Option<T>,
    /// Displaced head (pointer bits) plus the insertion flag. Immutable
    /// once the record is published.
    next: u64,
}

type RecordPtr<T> = *mut MmmObject<Record<T>>;

#[inline]
fn record_is_used<T>(rec: RecordPtr<T>) -> bool {
    // SAFETY: callers pass records reachable under a reservation.
    unsafe { (*rec).value().next & RECORD_USED != 0 }
}

struct Bucket {
    hv: AtomicU128,
    head: AtomicU64,
}

struct TableStore<T> {
    last_slot: u64,
    threshold: u64,
    used_count: AtomicU64,
    next: AtomicPtr<MmmObject<TableStore<T>>>,
    buckets: Box<[Bucket]>,
    _marker: PhantomData<T>,
}

enum Reserve<'a> {
    /// The bucket already carried this hash.
    Found(&'a Bucket),
    /// This thread reserved a fresh bucket.
    New(&'a Bucket),
    /// Probing wrapped without finding room.
    Full,
}

impl<T> TableStore<T> {
    fn new(size: u64) -> Self {
        let buckets = (0..size)
            .map(|_| Bucket {
                hv: AtomicU128::new(0),
                head: AtomicU64::new(0),
            })
            .collect();
        Self {
            last_slot: size - 1,
            threshold: size - size / 4,
            used_count: AtomicU64::new(0),
            next: AtomicPtr::new(ptr::null_mut()),
            buckets,
            _marker: PhantomData,
        }
    }

    #[inline]
    fn size(&self) -> u64 {
        self.last_slot + 1
    }

    /// Locate the bucket holding `hv`, without reserving.
    fn find_bucket(&self, hv: u128) -> Option<&Bucket> {
        let mut i = (hv as u64) & self.last_slot;
        for _ in 0..self.size() {
            let b = &self.buckets[i as usize];
            let cur = b.hv.load(Ordering::SeqCst);
            if cur == hv {
                return Some(b);
            }
            if cur == 0 {
                return None;
            }
            i = (i + 1) & self.last_slot;
        }
        None
    }

    /// Locate or reserve the bucket for `hv`.
    fn reserve_bucket(&self, hv: u128) -> Reserve<'_> {
        let mut i = (hv as u64) & self.last_slot;
        for _ in 0..self.size() {
            let b = &self.buckets[i as usize];
            let cur = b.hv.load(Ordering::SeqCst);
            if cur == hv {
                return Reserve::Found(b);
            }
            if cur == 0 {
                match b.hv.compare_exchange(0, hv, Ordering::SeqCst, Ordering::SeqCst) {
                    Ok(_) => return Reserve::New(b),
                    Err(now) => {
                        if now == hv {
                            return Reserve::Found(b);
                        }
                        // Lost to a different hash; keep probing.
                    }
                }
            }
            i = (i + 1) & self.last_slot;
        }
        Reserve::Full
    }
}

/// One entry of a linearized snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewEntry<T> {
    /// The caller-supplied 128-bit hash value.
    pub hv: u128,
    /// The item as of the snapshot epoch.
    pub item: T,
    /// Insertion time, preserved across replacements.
    pub create_epoch: Epoch,
}

/// Default 128-bit FNV-1a, used by the `*_key` convenience operations
/// until [`HashTable::set_hash_function`] replaces it.
fn fnv128(bytes: &[u8]) -> u128 {
    const OFFSET: u128 = 0x6c62272e07bb014262b821756295c58d;
    const PRIME: u128 = 0x0000000001000000000000000000013b;
    let mut h = OFFSET;
    for &b in bytes {
        h ^= u128::from(b);
        h = h.wrapping_mul(PRIME);
    }
    if h == 0 {
        // Zero is the empty-bucket sentinel.
        h = OFFSET;
    }
    h
}

/// Cleanup trampoline bridging the manager's handler to the table's
/// free-handler hook.
unsafe fn record_cleanup<T>(value: *mut u8, aux: *mut u8) {
    let rec = value.cast::<Record<T>>();
    if let Some(item) = (*rec).item.as_ref() {
        let f: fn(&T) = mem::transmute(aux as usize);
        f(item);
    }
}

/// Linearizable concurrent map keyed by caller-supplied 128-bit hashes.
///
/// `put`, `add`, and `get` are wait-free; `replace` and `remove` are
/// CAS-loops (lock-free). Snapshots ([`HashTable::view`]) are linearizable
/// and optionally sorted by insertion order.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use waitfree_rs::{HashTable, Mmm};
///
/// let mmm = Arc::new(Mmm::new());
/// let th = mmm.register().unwrap();
/// let t: HashTable<&str> = HashTable::new(Arc::clone(&mmm));
///
/// assert_eq!(t.put(0xfeed, "v1", &th), None);
/// assert_eq!(t.put(0xfeed, "v2", &th), Some("v1"));
/// assert_eq!(t.get(0xfeed, &th), Some("v2"));
/// assert_eq!(t.remove(0xfeed, &th), Some("v2"));
/// assert_eq!(t.get(0xfeed, &th), None);
/// ```
pub struct HashTable<T> {
    mmm: Arc<Mmm>,
    store: AtomicPtr<MmmObject<TableStore<T>>>,
    item_count: AtomicU64,
    sort_views: AtomicBool,
    hash_fn: AtomicUsize,
    free_handler: AtomicUsize,
    return_hook: AtomicUsize,
    _marker: PhantomData<T>,
}

// SAFETY: records are manager-owned; clones of items are taken under
// reservations and all shared state is atomic.
unsafe impl<T: Send + Sync> Send for HashTable<T> {}
unsafe impl<T: Send + Sync> Sync for HashTable<T> {}

impl<T> HashTable<T> {
    /// Create a table with the minimum store size.
    pub fn new(mmm: Arc<Mmm>) -> Self {
        Self::with_size_bits(mmm, 4)
    }

    /// Create a table with `1 << size_bits` buckets.
    ///
    /// # Panics
    ///
    /// Panics if `size_bits` is below 4 or above 24.
    pub fn with_size_bits(mmm: Arc<Mmm>, size_bits: u8) -> Self {
        assert!(
            (4..=24).contains(&size_bits),
            "size_bits must be between 4 and 24"
        );
        let store = mmm.alloc(TableStore::<T>::new(1 << size_bits));
        Self {
            mmm,
            store: AtomicPtr::new(store),
            item_count: AtomicU64::new(0),
            sort_views: AtomicBool::new(false),
            hash_fn: AtomicUsize::new(0),
            free_handler: AtomicUsize::new(0),
            return_hook: AtomicUsize::new(0),
            _marker: PhantomData,
        }
    }

    /// Replace the hash function behind the `*_key` operations.
    pub fn set_hash_function(&self, f: fn(&[u8]) -> u128) {
        self.hash_fn.store(f as usize, Ordering::SeqCst);
    }

    /// Install a hook run on an item right before its record is released
    /// by the manager.
    pub fn set_free_handler(&self, f: fn(&T)) {
        self.free_handler.store(f as usize, Ordering::SeqCst);
    }

    /// Install a hook run on every item the table hands back to a caller.
    pub fn set_return_hook(&self, f: fn(&T)) {
        self.return_hook.store(f as usize, Ordering::SeqCst);
    }

    /// Choose whether views are sorted by insertion order.
    pub fn set_sort_views(&self, sort: bool) {
        self.sort_views.store(sort, Ordering::SeqCst);
    }

    /// Hash a byte key with the installed (or default) hash function.
    pub fn hash_key(&self, key: &[u8]) -> u128 {
        let f = self.hash_fn.load(Ordering::SeqCst);
        if f == 0 {
            fnv128(key)
        } else {
            // SAFETY: only `set_hash_function` stores here, always from a
            // valid fn pointer.
            let f: fn(&[u8]) -> u128 = unsafe { mem::transmute(f) };
            f(key)
        }
    }

    /// Approximate number of live keys.
    pub fn len(&self) -> usize {
        self.item_count.load(Ordering::SeqCst) as usize
    }

    /// Whether the table held no live keys at the moment of the check.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn run_return_hook(&self, item: &T) {
        let f = self.return_hook.load(Ordering::SeqCst);
        if f != 0 {
            // SAFETY: only `set_return_hook` stores here.
            let f: fn(&T) = unsafe { mem::transmute(f) };
            f(item);
        }
    }

    fn attach_cleanup(&self, rec: RecordPtr<T>) {
        let f = self.free_handler.load(Ordering::SeqCst);
        if f != 0 {
            // SAFETY: the trampoline casts aux back to the fn pointer the
            // table stored; both live for the program's lifetime.
            unsafe { (*rec).add_cleanup_handler(record_cleanup::<T>, f as *mut u8) };
        }
    }

    /// Build an insertion record displacing `head`.
    fn make_record(&self, item: T, head: u64, old: RecordPtr<T>, th: &MmmThread) -> RecordPtr<T> {
        let rec = th.alloc_uncommitted(Record {
            item: Some(item),
            next: (head & !HEAD_FLAGS) | RECORD_USED,
        });
        self.attach_cleanup(rec);
        if !old.is_null() && record_is_used(old) {
            // Replacements keep the original insertion time.
            // SAFETY: `old` is reachable under the caller's reservation.
            let created = unsafe { (*old).header().create_epoch() };
            // SAFETY: `rec` is unpublished; we are its only writer.
            unsafe { (*rec).header().set_create_epoch(created) };
        }
        rec
    }

    /// Reclaim an unpublished record, handing its item back.
    fn unmake_record(&self, rec: RecordPtr<T>, th: &MmmThread) -> T {
        // SAFETY: the record lost its head CAS and was never published, so
        // this thread still owns it exclusively.
        let item = unsafe { (*rec).value_mut().item.take() };
        unsafe { th.retire_unused(rec) };
        match item {
            Some(v) => v,
            None => unreachable!("unpublished insertion record always carries its item"),
        }
    }

    /// Clone an item out of a record, running the return hook.
    fn take_item(&self, rec: RecordPtr<T>) -> Option<T>
    where
        T: Clone,
    {
        // SAFETY: reachable under the caller's reservation.
        let item = unsafe { (*rec).value().item.as_ref() };
        item.map(|v| {
            self.run_return_hook(v);
            v.clone()
        })
    }

    /// Read the item stored under `hv`. Wait-free; never helps a
    /// migration.
    pub fn get(&self, hv: u128, th: &MmmThread) -> Option<T>
    where
        T: Clone,
    {
        debug_assert!(hv != 0, "hash value 0 is reserved for empty buckets");
        debug_assert_same_mmm!(&self.mmm, th.mmm());
        th.begin_op();
        let store_obj = self.store.load(Ordering::SeqCst);
        // SAFETY: protected by the reservation published above.
        let store = unsafe { (*store_obj).value() };
        let result = store.find_bucket(hv).and_then(|b| {
            let head = b.head.load(Ordering::SeqCst) & !HEAD_FLAGS;
            if head == 0 {
                return None;
            }
            let rec = head as RecordPtr<T>;
            if !record_is_used(rec) {
                return None;
            }
            self.take_item(rec)
        });
        th.end_op();
        result
    }

    /// Insert or replace. Returns the displaced item, `None` when the key
    /// was absent. Wait-free: a racing writer makes the operation
    /// linearize immediately behind the winner, returning the caller's own
    /// item as the displaced value.
    pub fn put(&self, hv: u128, item: T, th: &MmmThread) -> Option<T>
    where
        T: Clone,
    {
        debug_assert!(hv != 0, "hash value 0 is reserved for empty buckets");
        debug_assert_same_mmm!(&self.mmm, th.mmm());
        th.begin_linearized_op();
        let result = self.put_inner(hv, item, th);
        th.end_op();
        result
    }

    fn put_inner(&self, hv: u128, item: T, th: &MmmThread) -> Option<T>
    where
        T: Clone,
    {
        let mut item = item;
        loop {
            let store_obj = self.store.load(Ordering::SeqCst);
            // SAFETY: protected by the caller's reservation.
            let store = unsafe { (*store_obj).value() };
            let bucket = match store.reserve_bucket(hv) {
                Reserve::Full => {
                    self.migrate(store_obj, th);
                    continue;
                }
                Reserve::New(b) => {
                    let used = store.used_count.fetch_add(1, Ordering::SeqCst) + 1;
                    if used > store.threshold {
                        self.migrate(store_obj, th);
                        continue;
                    }
                    b
                }
                Reserve::Found(b) => b,
            };
            let head = bucket.head.load(Ordering::SeqCst);
            if head & HEAD_FLAGS != 0 {
                self.migrate(store_obj, th);
                continue;
            }
            let old = (head & !HEAD_FLAGS) as RecordPtr<T>;
            let old_is_used = !old.is_null() && record_is_used(old);
            if !old.is_null() {
                // Keep write epochs non-decreasing along the stack even if
                // the displaced writer stalled before committing.
                // SAFETY: reachable under the caller's reservation.
                unsafe { (*old).header().help_commit(self.mmm.current_epoch()) };
            }
            let rec = self.make_record(item, head, old, th);
            match bucket
                .head
                .compare_exchange(head, rec as u64, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => {
                    // SAFETY: `rec` is published; committing through the
                    // shared header is the linearization timestamp.
                    unsafe { (*rec).header().commit_write(self.mmm.current_epoch()) };
                    if old_is_used {
                        let displaced = self.take_item(old);
                        // SAFETY: the head CAS unlinked `old`.
                        unsafe { th.retire(old) };
                        return displaced;
                    }
                    self.item_count.fetch_add(1, Ordering::SeqCst);
                    if !old.is_null() {
                        // Displaced a deletion record.
                        // SAFETY: unlinked by the head CAS.
                        unsafe { th.retire(old) };
                    }
                    return None;
                }
                Err(now) => {
                    item = self.unmake_record(rec, th);
                    if now & HEAD_MOVING != 0 {
                        self.migrate(store_obj, th);
                        continue;
                    }
                    // A concurrent writer won. Linearize immediately behind
                    // it: our value went in and was instantly overwritten.
                    self.run_return_hook(&item);
                    return Some(item);
                }
            }
        }
    }

    /// Insert only if the key has no live record. Returns the rejected
    /// item on failure. Wait-free.
    pub fn add(&self, hv: u128, item: T, th: &MmmThread) -> Result<(), T> {
        debug_assert!(hv != 0, "hash value 0 is reserved for empty buckets");
        debug_assert_same_mmm!(&self.mmm, th.mmm());
        th.begin_linearized_op();
        let result = self.add_inner(hv, item, th);
        th.end_op();
        result
    }

    fn add_inner(&self, hv: u128, item: T, th: &MmmThread) -> Result<(), T> {
        let mut item = item;
        loop {
            let store_obj = self.store.load(Ordering::SeqCst);
            // SAFETY: protected by the caller's reservation.
            let store = unsafe { (*store_obj).value() };
            let bucket = match store.reserve_bucket(hv) {
                Reserve::Full => {
                    self.migrate(store_obj, th);
                    continue;
                }
                Reserve::New(b) => {
                    let used = store.used_count.fetch_add(1, Ordering::SeqCst) + 1;
                    if used > store.threshold {
                        self.migrate(store_obj, th);
                        continue;
                    }
                    b
                }
                Reserve::Found(b) => b,
            };
            let head = bucket.head.load(Ordering::SeqCst);
            if head & HEAD_FLAGS != 0 {
                self.migrate(store_obj, th);
                continue;
            }
            let old = (head & !HEAD_FLAGS) as RecordPtr<T>;
            if !old.is_null() && record_is_used(old) {
                return Err(item);
            }
            if !old.is_null() {
                // SAFETY: reachable under the caller's reservation.
                unsafe { (*old).header().help_commit(self.mmm.current_epoch()) };
            }
            let rec = self.make_record(item, head, old, th);
            match bucket
                .head
                .compare_exchange(head, rec as u64, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => {
                    // SAFETY: published above.
                    unsafe { (*rec).header().commit_write(self.mmm.current_epoch()) };
                    self.item_count.fetch_add(1, Ordering::SeqCst);
                    if !old.is_null() {
                        // SAFETY: unlinked by the head CAS.
                        unsafe { th.retire(old) };
                    }
                    return Ok(());
                }
                Err(now) => {
                    item = self.unmake_record(rec, th);
                    if now & HEAD_MOVING != 0 {
                        self.migrate(store_obj, th);
                        continue;
                    }
                    // Whatever the winner wrote, the key saw a write after
                    // our linearization point; the add loses.
                    return Err(item);
                }
            }
        }
    }

    /// Replace only if the key has a live record. Returns the displaced
    /// item. Lock-free (CAS-loop), not wait-free.
    pub fn replace(&self, hv: u128, item: T, th: &MmmThread) -> Option<T>
    where
        T: Clone,
    {
        debug_assert!(hv != 0, "hash value 0 is reserved for empty buckets");
        debug_assert_same_mmm!(&self.mmm, th.mmm());
        th.begin_linearized_op();
        let result = self.replace_inner(hv, item, th);
        th.end_op();
        result
    }

    fn replace_inner(&self, hv: u128, item: T, th: &MmmThread) -> Option<T>
    where
        T: Clone,
    {
        let mut item = item;
        loop {
            let store_obj = self.store.load(Ordering::SeqCst);
            // SAFETY: protected by the caller's reservation.
            let store = unsafe { (*store_obj).value() };
            let Some(bucket) = store.find_bucket(hv) else {
                return None;
            };
            let head = bucket.head.load(Ordering::SeqCst);
            if head & HEAD_FLAGS != 0 {
                self.migrate(store_obj, th);
                continue;
            }
            let old = (head & !HEAD_FLAGS) as RecordPtr<T>;
            if old.is_null() || !record_is_used(old) {
                return None;
            }
            // SAFETY: reachable under the caller's reservation.
            unsafe { (*old).header().help_commit(self.mmm.current_epoch()) };
            let rec = self.make_record(item, head, old, th);
            match bucket
                .head
                .compare_exchange(head, rec as u64, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => {
                    // SAFETY: published above.
                    unsafe { (*rec).header().commit_write(self.mmm.current_epoch()) };
                    let displaced = self.take_item(old);
                    // SAFETY: unlinked by the head CAS.
                    unsafe { th.retire(old) };
                    return displaced;
                }
                Err(_) => {
                    item = self.unmake_record(rec, th);
                }
            }
        }
    }

    /// Remove the key's live record. Returns the removed item. Lock-free
    /// (CAS-loop), not wait-free.
    pub fn remove(&self, hv: u128, th: &MmmThread) -> Option<T>
    where
        T: Clone,
    {
        debug_assert!(hv != 0, "hash value 0 is reserved for empty buckets");
        debug_assert_same_mmm!(&self.mmm, th.mmm());
        th.begin_linearized_op();
        let result = self.remove_inner(hv, th);
        th.end_op();
        result
    }

    fn remove_inner(&self, hv: u128, th: &MmmThread) -> Option<T>
    where
        T: Clone,
    {
        loop {
            let store_obj = self.store.load(Ordering::SeqCst);
            // SAFETY: protected by the caller's reservation.
            let store = unsafe { (*store_obj).value() };
            let Some(bucket) = store.find_bucket(hv) else {
                return None;
            };
            let head = bucket.head.load(Ordering::SeqCst);
            if head & HEAD_FLAGS != 0 {
                self.migrate(store_obj, th);
                continue;
            }
            let old = (head & !HEAD_FLAGS) as RecordPtr<T>;
            if old.is_null() || !record_is_used(old) {
                return None;
            }
            // SAFETY: reachable under the caller's reservation.
            unsafe { (*old).header().help_commit(self.mmm.current_epoch()) };
            let del = th.alloc_uncommitted(Record::<T> {
                item: None,
                next: head & !HEAD_FLAGS,
            });
            match bucket
                .head
                .compare_exchange(head, del as u64, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => {
                    // SAFETY: published above.
                    unsafe { (*del).header().commit_write(self.mmm.current_epoch()) };
                    let removed = self.take_item(old);
                    // SAFETY: unlinked by the head CAS.
                    unsafe { th.retire(old) };
                    self.item_count.fetch_sub(1, Ordering::SeqCst);
                    return removed;
                }
                Err(_) => {
                    // SAFETY: the deletion record was never published.
                    unsafe { th.retire_unused(del) };
                }
            }
        }
    }

    /// Linearizable snapshot of the table at a private epoch, optionally
    /// sorted by insertion order.
    pub fn view(&self, th: &MmmThread) -> Vec<ViewEntry<T>>
    where
        T: Clone,
    {
        debug_assert_same_mmm!(&self.mmm, th.mmm());
        let l = th.begin_linearized_op();
        let store_obj = self.store.load(Ordering::SeqCst);
        // SAFETY: protected by the reservation published above.
        let store = unsafe { (*store_obj).value() };
        let mut out = Vec::new();
        for b in store.buckets.iter() {
            let hv = b.hv.load(Ordering::SeqCst);
            if hv == 0 {
                continue;
            }
            let head = (b.head.load(Ordering::SeqCst) & !HEAD_FLAGS) as RecordPtr<T>;
            if head.is_null() {
                continue;
            }
            // SAFETY: reachable under the reservation.
            unsafe { (*head).header().help_commit(self.mmm.current_epoch()) };
            // Walk to the newest record committed at or before L.
            let mut rec = head;
            while !rec.is_null() {
                // SAFETY: records committed after L were created after this
                // view began, so everything they link to is still pinned.
                let hdr = unsafe { (*rec).header() };
                let we = hdr.write_epoch();
                if we != 0 && we <= l {
                    if record_is_used(rec) {
                        if let Some(item) = self.take_item(rec) {
                            out.push(ViewEntry {
                                hv,
                                item,
                                create_epoch: hdr.create_epoch(),
                            });
                        }
                    }
                    break;
                }
                rec = (unsafe { (*rec).value() }.next & !RECORD_USED) as RecordPtr<T>;
            }
        }
        th.end_op();
        if self.sort_views.load(Ordering::SeqCst) {
            out.sort_unstable_by_key(|e| e.create_epoch);
        }
        out
    }

    // ---------------------------------------------------------------------
    // BYTE-KEY CONVENIENCE WRAPPERS
    // ---------------------------------------------------------------------

    /// [`HashTable::get`] keyed through the installed hash function.
    pub fn get_key(&self, key: &[u8], th: &MmmThread) -> Option<T>
    where
        T: Clone,
    {
        self.get(self.hash_key(key), th)
    }

    /// [`HashTable::put`] keyed through the installed hash function.
    pub fn put_key(&self, key: &[u8], item: T, th: &MmmThread) -> Option<T>
    where
        T: Clone,
    {
        self.put(self.hash_key(key), item, th)
    }

    /// [`HashTable::add`] keyed through the installed hash function.
    pub fn add_key(&self, key: &[u8], item: T, th: &MmmThread) -> Result<(), T> {
        self.add(self.hash_key(key), item, th)
    }

    /// [`HashTable::replace`] keyed through the installed hash function.
    pub fn replace_key(&self, key: &[u8], item: T, th: &MmmThread) -> Option<T>
    where
        T: Clone,
    {
        self.replace(self.hash_key(key), item, th)
    }

    /// [`HashTable::remove`] keyed through the installed hash function.
    pub fn remove_key(&self, key: &[u8], th: &MmmThread) -> Option<T>
    where
        T: Clone,
    {
        self.remove(self.hash_key(key), th)
    }

    /// Migrate to a right-sized store: mark every bucket, agree on the
    /// replacement, copy live heads, commit counts, and swing the top
    /// pointer. Fully cooperative; every contender helps the same passes.
    fn migrate(&self, store_obj: *mut MmmObject<TableStore<T>>, th: &MmmThread) {
        // SAFETY: caller holds a reservation covering store_obj.
        let store = unsafe { (*store_obj).value() };

        // Mark pass: freeze every head and count live keys.
        let mut live = 0u64;
        for b in store.buckets.iter() {
            loop {
                let head = b.head.load(Ordering::SeqCst);
                if head & HEAD_FLAGS != 0 {
                    break;
                }
                if b.head
                    .compare_exchange(head, head | HEAD_MOVING, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    break;
                }
            }
            let ptr = (b.head.load(Ordering::SeqCst) & !HEAD_FLAGS) as RecordPtr<T>;
            if !ptr.is_null() && record_is_used(ptr) {
                live += 1;
            }
        }

        // Agree on the replacement store.
        if store.next.load(Ordering::SeqCst).is_null() {
            let size = store.size();
            let new_size = if live * 2 > size {
                size * 2
            } else if live * 4 <= size {
                (size / 2).max(MIN_SIZE)
            } else {
                size
            };
            let cand = self.mmm.alloc(TableStore::<T>::new(new_size));
            if store
                .next
                .compare_exchange(ptr::null_mut(), cand, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                // SAFETY: the losing candidate was never published.
                unsafe { th.retire_unused(cand) };
            }
        }
        let new_obj = store.next.load(Ordering::SeqCst);
        // SAFETY: published and pinned by our reservation.
        let new_store = unsafe { (*new_obj).value() };

        // Copy pass: live heads move; dead buckets just get flagged, and
        // whoever flags one holding a deletion record retires it.
        for b in store.buckets.iter() {
            let head = b.head.load(Ordering::SeqCst);
            if head & HEAD_MOVED != 0 {
                continue;
            }
            let ptr = (head & !HEAD_FLAGS) as RecordPtr<T>;
            if ptr.is_null() || !record_is_used(ptr) {
                if b.head
                    .compare_exchange(head, head | HEAD_MOVED, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                    && !ptr.is_null()
                {
                    // SAFETY: the winning flag CAS makes this thread the
                    // unique retirer of the dangling deletion record.
                    unsafe { th.retire(ptr) };
                }
                continue;
            }
            let hv = b.hv.load(Ordering::SeqCst);
            match new_store.reserve_bucket(hv) {
                Reserve::Found(target) | Reserve::New(target) => {
                    // Helpers all install the same frozen head; CAS from
                    // zero keeps the copy idempotent.
                    let _ = target.head.compare_exchange(
                        0,
                        ptr as u64,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    );
                }
                Reserve::Full => {
                    // The replacement is sized for every live key.
                    debug_assert!(false, "migration target store filled up");
                }
            }
            let _ = b
                .head
                .compare_exchange(head, head | HEAD_MOVED, Ordering::SeqCst, Ordering::SeqCst);
        }

        // Commit the live count, then swing the top-level store.
        let _ = new_store
            .used_count
            .compare_exchange(0, live, Ordering::SeqCst, Ordering::SeqCst);
        if self
            .store
            .compare_exchange(store_obj, new_obj, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            // SAFETY: unlinked; stalled readers hold reservations.
            unsafe { th.retire(store_obj) };
        }
    }
}

impl<T> Drop for HashTable<T> {
    fn drop(&mut self) {
        let mut cur = self.store.load(Ordering::Relaxed);
        while !cur.is_null() {
            // SAFETY: exclusive access in Drop.
            let store = unsafe { (*cur).value() };
            for b in store.buckets.iter() {
                let head = b.head.load(Ordering::Relaxed);
                // Heads already moved belong to the successor store.
                if head & HEAD_MOVED != 0 {
                    continue;
                }
                let ptr = (head & !HEAD_FLAGS) as RecordPtr<T>;
                if !ptr.is_null() {
                    // Displaced records down the stack were retired when
                    // they were displaced; only the head is ours.
                    unsafe { free_object_now(ptr) };
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
    use std::sync::atomic::AtomicUsize;

    fn setup() -> (Arc<Mmm>, MmmThread) {
        let mmm = Arc::new(Mmm::new());
        let th = mmm.register().unwrap();
        (mmm, th)
    }

    #[test]
    fn test_put_get_remove() {
        let (mmm, th) = setup();
        let t: HashTable<u64> = HashTable::new(Arc::clone(&mmm));

        assert_eq!(t.get(10, &th), None);
        assert_eq!(t.put(10, 100, &th), None);
        assert_eq!(t.get(10, &th), Some(100));
        assert_eq!(t.put(10, 200, &th), Some(100));
        assert_eq!(t.get(10, &th), Some(200));
        assert_eq!(t.len(), 1);

        assert_eq!(t.remove(10, &th), Some(200));
        assert_eq!(t.get(10, &th), None);
        assert_eq!(t.remove(10, &th), None);
        assert_eq!(t.len(), 0);
    }

    #[test]
    fn test_add_fails_on_live_key() {
        let (mmm, th) = setup();
        let t: HashTable<&str> = HashTable::new(Arc::clone(&mmm));

        assert!(t.add(5, "first", &th).is_ok());
        assert_eq!(t.add(5, "second", &th), Err("second"));
        // A removed key accepts add again.
        assert_eq!(t.remove(5, &th), Some("first"));
        assert!(t.add(5, "third", &th).is_ok());
        assert_eq!(t.get(5, &th), Some("third"));
    }

    #[test]
    fn test_replace_requires_live_key() {
        let (mmm, th) = setup();
        let t: HashTable<u64> = HashTable::new(Arc::clone(&mmm));

        assert_eq!(t.replace(3, 30, &th), None);
        assert_eq!(t.get(3, &th), None);

        t.put(3, 31, &th);
        assert_eq!(t.replace(3, 32, &th), Some(31));
        assert_eq!(t.get(3, &th), Some(32));

        t.remove(3, &th);
        assert_eq!(t.replace(3, 33, &th), None);
    }

    #[test]
    fn test_growth_keeps_all_keys() {
        let (mmm, th) = setup();
        let t: HashTable<u64> = HashTable::new(Arc::clone(&mmm));

        // Well past the initial 16-bucket threshold: several migrations.
        for i in 1..=200u128 {
            assert_eq!(t.put(i, i as u64, &th), None);
        }
        assert_eq!(t.len(), 200);
        for i in 1..=200u128 {
            assert_eq!(t.get(i, &th), Some(i as u64));
        }
    }

    #[test]
    fn test_shrink_after_removals() {
        let (mmm, th) = setup();
        let t: HashTable<u64> = HashTable::new(Arc::clone(&mmm));

        for i in 1..=100u128 {
            t.put(i, i as u64, &th);
        }
        for i in 1..=95u128 {
            t.remove(i, &th);
        }
        // Deletion records pile up in the store; force a cleanup cycle and
        // confirm the survivors.
        let store_obj = t.store.load(Ordering::SeqCst);
        th.begin_op();
        t.migrate(store_obj, &th);
        th.end_op();
        for i in 96..=100u128 {
            assert_eq!(t.get(i, &th), Some(i as u64));
        }
        assert_eq!(t.len(), 5);
    }

    #[test]
    fn test_linear_probing_on_colliding_hashes() {
        let (mmm, th) = setup();
        let t: HashTable<u64> = HashTable::new(Arc::clone(&mmm));

        // Distinct 128-bit hashes whose low bits all land on one bucket.
        let colliders: Vec<u128> = (1..=8u128).map(|i| (i << 64) | 5).collect();
        for (i, &hv) in colliders.iter().enumerate() {
            assert_eq!(t.put(hv, i as u64, &th), None);
        }
        assert_eq!(t.len(), colliders.len());
        for (i, &hv) in colliders.iter().enumerate() {
            assert_eq!(t.get(hv, &th), Some(i as u64));
        }
        // Removing one collider leaves the probe chain intact.
        assert_eq!(t.remove(colliders[3], &th), Some(3));
        assert_eq!(t.get(colliders[3], &th), None);
        assert_eq!(t.get(colliders[7], &th), Some(7));
    }

    #[test]
    fn test_view_insertion_order() {
        let (mmm, th) = setup();
        let t: HashTable<&str> = HashTable::new(Arc::clone(&mmm));
        t.set_sort_views(true);

        t.put(0xb, "b", &th);
        t.put(0xa, "a", &th);
        t.put(0xc, "c", &th);
        // Replacement keeps hv 0xb's original insertion slot.
        t.put(0xb, "b2", &th);

        let view = t.view(&th);
        let items: Vec<(u128, &str)> = view.iter().map(|e| (e.hv, e.item)).collect();
        assert_eq!(items, vec![(0xb, "b2"), (0xa, "a"), (0xc, "c")]);

        // Epochs strictly increase in insertion order.
        assert!(view[0].create_epoch < view[1].create_epoch);
        assert!(view[1].create_epoch < view[2].create_epoch);
    }

    #[test]
    fn test_view_excludes_removed_keys() {
        let (mmm, th) = setup();
        let t: HashTable<u64> = HashTable::new(Arc::clone(&mmm));

        t.put(1, 10, &th);
        t.put(2, 20, &th);
        t.remove(1, &th);

        let view = t.view(&th);
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].hv, 2);
        assert_eq!(view[0].item, 20);
    }

    #[test]
    fn test_free_handler_runs_on_reclamation() {
        static FREED: AtomicUsize = AtomicUsize::new(0);
        fn on_free(_item: &u64) {
            FREED.fetch_add(1, Ordering::SeqCst);
        }

        FREED.store(0, Ordering::SeqCst);
        let (mmm, th) = setup();
        {
            let t: HashTable<u64> = HashTable::new(Arc::clone(&mmm));
            t.set_free_handler(on_free);
            t.put(1, 10, &th);
            t.put(1, 11, &th); // retires the first record
            t.put(2, 20, &th);

            // Cycle the epoch so retired records drain.
            th.begin_linearized_op();
            th.end_op();
            assert!(FREED.load(Ordering::SeqCst) >= 1);
        }
        // Teardown releases the live records too.
        assert_eq!(FREED.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_return_hook_sees_returned_items() {
        static RETURNED: AtomicUsize = AtomicUsize::new(0);
        fn on_return(_item: &u64) {
            RETURNED.fetch_add(1, Ordering::SeqCst);
        }

        RETURNED.store(0, Ordering::SeqCst);
        let (mmm, th) = setup();
        let t: HashTable<u64> = HashTable::new(Arc::clone(&mmm));
        t.set_return_hook(on_return);

        t.put(1, 10, &th); // no displaced item, no hook
        assert_eq!(RETURNED.load(Ordering::SeqCst), 0);
        t.get(1, &th);
        assert_eq!(RETURNED.load(Ordering::SeqCst), 1);
        t.put(1, 11, &th); // displaced item returned
        assert_eq!(RETURNED.load(Ordering::SeqCst), 2);
        t.remove(1, &th);
        assert_eq!(RETURNED.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_key_wrappers_roundtrip() {
        let (mmm, th) = setup();
        let t: HashTable<u64> = HashTable::new(Arc::clone(&mmm));

        assert_eq!(t.put_key(b"alpha", 1, &th), None);
        assert_eq!(t.get_key(b"alpha", &th), Some(1));
        assert!(t.add_key(b"alpha", 2, &th).is_err());
        assert_eq!(t.replace_key(b"alpha", 3, &th), Some(1));
        assert_eq!(t.remove_key(b"alpha", &th), Some(3));
        assert_eq!(t.get_key(b"alpha", &th), None);
    }

    #[test]
    fn test_custom_hash_function() {
        fn constant_ish(key: &[u8]) -> u128 {
            // Degenerate on purpose: everything collides into two values.
            (key.len() as u128 % 2) + 1
        }

        let (mmm, th) = setup();
        let t: HashTable<u64> = HashTable::new(Arc::clone(&mmm));
        t.set_hash_function(constant_ish);

        t.put_key(b"ab", 1, &th);
        t.put_key(b"abc", 2, &th);
        // "abcd" collides with "ab" (both even length): same logical key.
        assert_eq!(t.put_key(b"abcd", 3, &th), Some(1));
        assert_eq!(t.get_key(b"ab", &th), Some(3));
        assert_eq!(t.get_key(b"abc", &th), Some(2));
    }
}
