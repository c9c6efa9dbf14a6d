//! Multi-threaded scenarios that can't be exercised as a colocated unit
//! test because they need real OS threads: a pointer allocated on one
//! thread freed by another, a null free under concurrent load, and the
//! no-overlap/no-deadlock property under many threads racing
//! `allocate`/`free` at once.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

use parc_alloc::{allocate, free, init};

#[test]
fn cross_arena_free() {
    assert_eq!(init(), 0);
    let (tx, rx) = mpsc::channel::<usize>();

    let producer = thread::spawn(move || {
        let p = allocate(64);
        assert!(!p.is_null());
        tx.send(p as usize).unwrap();
    });

    let consumer = thread::spawn(move || {
        let p = rx.recv().unwrap() as *mut u8;
        // `free` locates the owning arena from the pointer's own in-page
        // header, not from whatever CPU this thread happens to run on.
        free(p);
    });

    producer.join().unwrap();
    consumer.join().unwrap();
}

#[test]
fn null_free_under_concurrent_load() {
    assert_eq!(init(), 0);
    let handles: Vec<_> = (0..8)
        .map(|_| {
            thread::spawn(|| {
                for _ in 0..1000 {
                    free(std::ptr::null_mut());
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
}

/// Every live allocation made by `stress`, recorded as `(address, size)`
/// so the final check can verify no two ranges overlap.
fn overlaps(a: (usize, usize), b: (usize, usize)) -> bool {
    let (a_start, a_len) = a;
    let (b_start, b_len) = b;
    a_start < b_start + b_len && b_start < a_start + a_len
}

#[test]
fn concurrent_allocation_never_overlaps_and_never_deadlocks() {
    assert_eq!(init(), 0);

    const THREADS: usize = 8;
    const PER_THREAD: usize = 200;

    let live: Arc<Mutex<Vec<(usize, usize)>>> = Arc::new(Mutex::new(Vec::new()));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let live = Arc::clone(&live);
            thread::spawn(move || {
                let mut mine = Vec::with_capacity(PER_THREAD);
                for i in 0..PER_THREAD {
                    // Deterministic mix of subpage and large-object sizes,
                    // varied by thread and iteration so different classes
                    // and the large path all get exercised concurrently.
                    let size = match (t + i) % 5 {
                        0 => 8,
                        1 => 200,
                        2 => 2048,
                        3 => 3000,
                        _ => 50,
                    };
                    let p = allocate(size);
                    assert!(!p.is_null(), "allocate({size}) returned null");
                    mine.push((p as usize, size));
                }
                live.lock().unwrap().extend(mine.iter().copied());
                mine
            })
        })
        .collect();

    let mut all_batches = Vec::new();
    for h in handles {
        all_batches.push(h.join().unwrap());
    }

    // Property 2: no two still-live allocations overlap.
    let snapshot = live.lock().unwrap().clone();
    for i in 0..snapshot.len() {
        for j in (i + 1)..snapshot.len() {
            assert!(
                !overlaps(snapshot[i], snapshot[j]),
                "overlapping live allocations: {:?} and {:?}",
                snapshot[i],
                snapshot[j]
            );
        }
    }

    // Free everything from a different set of threads than allocated it,
    // exercising cross-thread frees the same way S5 does, at scale.
    let handles: Vec<_> = all_batches
        .into_iter()
        .map(|batch| {
            thread::spawn(move || {
                for (addr, _) in batch {
                    free(addr as *mut u8);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
}
