//! waitfree-rs - Lock-Free and Wait-Free Concurrent Data Structures
//!
//! A library of concurrent structures built over a shared epoch-based
//! safe-memory-reclamation substrate: readers publish a reservation before
//! touching shared memory, retirers defer frees until every reservation
//! that could reach them has ended, and no operation ever blocks behind a
//! lock.
//!
//! # Key Features
//!
//! - Epoch-based reclamation manager with per-thread reservation slots
//! - Linearizable wait-free segmented FIFO queue (fetch-add slot claims
//!   with exponential escape strides)
//! - Bounded wait-free MPMC ring with overwrite-on-full drop handlers and
//!   destructive snapshot views
//! - Compare-and-pop queue: `top()`/`cap(epoch)` for wait-free help
//!   patterns
//! - Lock-free array-backed LIFO stack with in-place compaction
//! - Wait-free 128-bit-keyed hash table with insertion-order views
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use waitfree_rs::{Mmm, Queue};
//!
//! let mmm = Arc::new(Mmm::new());
//! let th = mmm.register().unwrap();
//!
//! let queue = Queue::new(Arc::clone(&mmm));
//! queue.enqueue(1u64, &th);
//! queue.enqueue(2, &th);
//! assert_eq!(queue.dequeue(&th), Some(1));
//! assert_eq!(queue.dequeue(&th), Some(2));
//! assert_eq!(queue.dequeue(&th), None);
//! ```
//!
//! # Threading model
//!
//! The library never spawns threads. Each participating thread registers
//! with the shared [`Mmm`] manager and passes its [`MmmThread`] handle to
//! every operation; the handle carries the thread's reservation slot and
//! retirement list. Slots are bounded by [`MAX_THREADS`] at compile time.

mod backoff;
mod capq;
mod invariants;
mod mmm;
mod queue;
mod ring;
mod stack;
mod table;

pub use backoff::Backoff;
pub use capq::Capq;
pub use mmm::{Epoch, Mmm, MmmError, MmmHeader, MmmObject, MmmThread, MAX_THREADS};
pub use queue::Queue;
pub use ring::{Ring, RingView};
pub use stack::Stack;
pub use table::{HashTable, ViewEntry};
