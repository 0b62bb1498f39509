//! End-to-end scenarios with literal inputs, exercising every structure
//! through the public API exactly as a caller would.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use waitfree_rs::{Capq, HashTable, Mmm, Queue, Ring, Stack};

/// S1: one producer, then one consumer, strict FIFO.
#[test]
fn s1_queue_handoff_between_threads() {
    let mmm = Arc::new(Mmm::new());
    let queue = Arc::new(Queue::new(Arc::clone(&mmm)));

    {
        let mmm = Arc::clone(&mmm);
        let queue = Arc::clone(&queue);
        thread::spawn(move || {
            let th = mmm.register().unwrap();
            queue.enqueue(1u64, &th);
            queue.enqueue(2, &th);
            queue.enqueue(3, &th);
        })
        .join()
        .unwrap();
    }

    let consumer = thread::spawn(move || {
        let th = mmm.register().unwrap();
        (0..3).map(|_| queue.dequeue(&th)).collect::<Vec<_>>()
    });
    assert_eq!(
        consumer.join().unwrap(),
        vec![Some(1), Some(2), Some(3)]
    );
}

/// S2: 4 producers × (0..9), 2 consumers; conservation plus per-producer
/// FIFO.
#[test]
fn s2_queue_multi_producer_multi_consumer() {
    const PRODUCERS: u64 = 4;
    const PER_PRODUCER: u64 = 10;

    let mmm = Arc::new(Mmm::new());
    let queue = Arc::new(Queue::new(Arc::clone(&mmm)));
    let drained = Arc::new(AtomicU64::new(0));

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let mmm = Arc::clone(&mmm);
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let th = mmm.register().unwrap();
                for i in 0..PER_PRODUCER {
                    // Tag values with their producer so order is checkable.
                    queue.enqueue(p * 100 + i, &th);
                }
            })
        })
        .collect();

    let consumers: Vec<_> = (0..2)
        .map(|_| {
            let mmm = Arc::clone(&mmm);
            let queue = Arc::clone(&queue);
            let drained = Arc::clone(&drained);
            thread::spawn(move || {
                let th = mmm.register().unwrap();
                let mut got = Vec::new();
                while drained.load(Ordering::SeqCst) < PRODUCERS * PER_PRODUCER {
                    if let Some(v) = queue.dequeue(&th) {
                        drained.fetch_add(1, Ordering::SeqCst);
                        got.push(v);
                    }
                }
                got
            })
        })
        .collect();

    for p in producers {
        p.join().unwrap();
    }
    let mut all: Vec<u64> = Vec::new();
    let mut per_consumer: Vec<Vec<u64>> = Vec::new();
    for c in consumers {
        let got = c.join().unwrap();
        all.extend(&got);
        per_consumer.push(got);
    }

    // Union of dequeues equals the produced multiset.
    let mut sorted = all.clone();
    sorted.sort_unstable();
    let mut expected: Vec<u64> = (0..PRODUCERS)
        .flat_map(|p| (0..PER_PRODUCER).map(move |i| p * 100 + i))
        .collect();
    expected.sort_unstable();
    assert_eq!(sorted, expected);

    // Per-producer order is preserved within each consumer's stream.
    for got in &per_consumer {
        for p in 0..PRODUCERS {
            let seq: Vec<u64> = got
                .iter()
                .copied()
                .filter(|v| v / 100 == p)
                .collect();
            assert!(
                seq.windows(2).all(|w| w[0] < w[1]),
                "producer {p} order broken: {seq:?}"
            );
        }
    }
}

static S3_DROPS: AtomicU64 = AtomicU64::new(0);

fn s3_on_drop(v: u64) {
    // Exactly items 1 and 2 are overwritten; record them as a bitmask so
    // "exactly once" is checkable.
    let bit = 1 << v;
    let prev = S3_DROPS.fetch_or(bit, Ordering::SeqCst);
    assert_eq!(prev & bit, 0, "item {v} dropped twice");
}

/// S3: size-4 ring, six enqueues; the two oldest go to the drop handler.
#[test]
fn s3_ring_overwrites_oldest() {
    let mmm = Arc::new(Mmm::new());
    let th = mmm.register().unwrap();
    let ring = Ring::with_drop_handler(Arc::clone(&mmm), 2, s3_on_drop);

    for v in 1..=6u64 {
        ring.enqueue(v, &th);
    }
    let mut out = Vec::new();
    while let Some(v) = ring.dequeue(&th) {
        out.push(v);
    }
    assert_eq!(out, vec![3, 4, 5, 6]);
    assert_eq!(S3_DROPS.load(Ordering::SeqCst), (1 << 1) | (1 << 2));
}

/// S4: top/cap protocol on three items.
#[test]
fn s4_capq_top_and_cap() {
    let mmm = Arc::new(Mmm::new());
    let th = mmm.register().unwrap();
    let q = Capq::new(Arc::clone(&mmm));

    let e_a = q.enqueue('A', &th);
    let e_b = q.enqueue('B', &th);
    let e_c = q.enqueue('C', &th);
    assert!(e_a < e_b && e_b < e_c);

    assert_eq!(q.top(&th), Some(('A', e_a)));
    assert!(!q.cap(e_b, &th));
    assert!(q.cap(e_a, &th));
    assert_eq!(q.top(&th), Some(('B', e_b)));
}

/// S5: replacement keeps insertion order; removal drops the key from the
/// sorted view.
#[test]
fn s5_hash_sorted_view_after_replace_and_remove() {
    let mmm = Arc::new(Mmm::new());
    let th = mmm.register().unwrap();
    let t: HashTable<&str> = HashTable::new(Arc::clone(&mmm));
    t.set_sort_views(true);

    let hv1 = 0x1111;
    let hv2 = 0x2222;

    t.put(hv1, "a", &th);
    let created = t.view(&th)[0].create_epoch;

    t.put(hv2, "b", &th);
    t.put(hv1, "c", &th);
    t.remove(hv2, &th);

    let view = t.view(&th);
    assert_eq!(view.len(), 1);
    assert_eq!(view[0].hv, hv1);
    assert_eq!(view[0].item, "c");
    assert_eq!(view[0].create_epoch, created);
}

/// S6: LIFO order, including across a forced migration.
#[test]
fn s6_stack_lifo_across_migration() {
    let mmm = Arc::new(Mmm::new());
    let th = mmm.register().unwrap();
    let stack = Stack::new(Arc::clone(&mmm));

    stack.push(1u64, &th);
    stack.push(2, &th);
    stack.push(3, &th);
    assert_eq!(stack.pop(&th), Some(3));
    assert_eq!(stack.pop(&th), Some(2));
    assert_eq!(stack.pop(&th), Some(1));

    // Overflow the initial store so a grow migration lands mid-sequence;
    // the surviving items must still pop in LIFO order.
    let n = 100u64;
    for i in 0..n {
        stack.push(i, &th);
    }
    for i in (40..n).rev() {
        assert_eq!(stack.pop(&th), Some(i));
    }
    // Live suffix after the partial drain.
    for i in (0..40).rev() {
        assert_eq!(stack.pop(&th), Some(i));
    }
    assert_eq!(stack.pop(&th), None);
}
