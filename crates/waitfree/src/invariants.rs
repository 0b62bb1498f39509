//! Debug assertion macros for the structure invariants.
//!
//! Runtime checks for the properties each structure maintains under all
//! interleavings. Only active in debug builds (`#[cfg(debug_assertions)]`),
//! so there is zero overhead in release builds.

// =============================================================================
// Reclamation: reservation lifecycle
// =============================================================================

/// Assert that an operation is in flight when it is required to be.
///
/// **Invariant**: `end_op` is only called with a published reservation.
macro_rules! debug_assert_reservation_active {
    ($reservation:expr, $inactive:expr) => {
        debug_assert!(
            $reservation != $inactive,
            "reclamation invariant violated: ending an operation with no reservation published"
        )
    };
}

/// Assert that a retirement carries a real epoch.
///
/// **Invariant**: epoch 0 means "unset" everywhere; nothing is retired at it.
macro_rules! debug_assert_epoch_committed {
    ($epoch:expr) => {
        debug_assert!(
            $epoch > 0,
            "reclamation invariant violated: retirement at the unset epoch"
        )
    };
}

// =============================================================================
// Epoch ordering
// =============================================================================

/// Assert that an epoch sequence only moves forward.
///
/// **Invariant**: cell and header epochs are monotonically non-decreasing.
macro_rules! debug_assert_epoch_monotonic {
    ($name:literal, $old:expr, $new:expr) => {
        debug_assert!(
            $new >= $old,
            "epoch invariant violated: {} went backwards from {} to {}",
            $name,
            $old,
            $new
        )
    };
}

// =============================================================================
// Ring occupancy
// =============================================================================

/// Assert that the ring never claims more occupancy than capacity.
///
/// **Invariant**: `enqueue_epoch - dequeue_epoch <= size` after a
/// full-ring advance completes.
macro_rules! debug_assert_ring_bound {
    ($enq:expr, $deq:expr, $size:expr) => {
        debug_assert!(
            $enq.wrapping_sub($deq) <= $size,
            "ring invariant violated: occupancy {} exceeds capacity {}",
            $enq.wrapping_sub($deq),
            $size
        )
    };
}

// =============================================================================
// Migration discipline
// =============================================================================

/// Assert that a migration copy only reads frozen source cells.
///
/// **Invariant**: every cell is flagged before the copy pass scans it.
macro_rules! debug_assert_frozen_cell {
    ($state:expr, $flag:expr) => {
        debug_assert!(
            $state & $flag != 0,
            "migration invariant violated: copying from an unfrozen cell"
        )
    };
}

// =============================================================================
// Manager identity
// =============================================================================

/// Assert that a thread handle and a structure share one manager.
///
/// **Invariant**: pointers are only ever protected by reservations on the
/// manager that allocated them.
macro_rules! debug_assert_same_mmm {
    ($structure:expr, $thread:expr) => {
        debug_assert!(
            ::std::sync::Arc::ptr_eq($structure, $thread),
            "manager identity violated: thread handle registered with a different manager"
        )
    };
}

// =============================================================================
// Re-exports for crate-internal use
// =============================================================================

pub(crate) use debug_assert_epoch_committed;
pub(crate) use debug_assert_epoch_monotonic;
pub(crate) use debug_assert_frozen_cell;
pub(crate) use debug_assert_reservation_active;
pub(crate) use debug_assert_ring_bound;
pub(crate) use debug_assert_same_mmm;
