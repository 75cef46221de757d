//! Many threads borrowing from one pool.

use pool::{Connect, Pool};

use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;

#[derive(Default, Clone)]
struct Counter(Arc<AtomicUsize>);

impl Connect for Counter {
    type Conn = usize;
    type Err = Infallible;

    fn connect(&self) -> Result<usize, Infallible> {
        Ok(self.0.fetch_add(1, Ordering::SeqCst))
    }
}

fn assert_distinct(ids: &[u64]) {
    let unique: HashSet<_> = ids.iter().collect();
    assert_eq!(unique.len(), ids.len(), "duplicate idle ids: {:?}", ids);
}

#[test]
fn no_connection_is_ever_held_twice() {
    const THREADS: usize = 8;
    const ITERATIONS: usize = 2_000;

    let connector = Counter::default();
    let pool = Pool::new(connector.clone());
    let held = Arc::new(Mutex::new(HashSet::new()));
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let pool = pool.clone();
            let held = Arc::clone(&held);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..ITERATIONS {
                    let lease = pool.acquire().unwrap();
                    assert!(
                        held.lock().unwrap().insert(lease.id()),
                        "connection #{} handed to two borrowers",
                        lease.id()
                    );
                    if i % 7 == 0 {
                        thread::yield_now();
                    }
                    assert!(held.lock().unwrap().remove(&lease.id()));
                    pool.release(lease).unwrap();
                }
            })
        })
        .collect();

    for h in handles {
        h.join().expect("borrower panicked");
    }

    let state = pool.state();
    assert_eq!(state.borrowed, 0);
    assert_eq!(state.idle as u64, state.created);
    assert!(state.created as usize <= THREADS);
    assert_eq!(connector.0.load(Ordering::SeqCst) as u64, state.created);
    assert_distinct(&pool.lock_idle().ids());
}

#[test]
fn idle_sequence_never_holds_duplicates_while_in_flux() {
    const THREADS: usize = 4;
    const ITERATIONS: usize = 1_000;

    let pool = Pool::new(Counter::default());
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let pool = pool.clone();
            thread::spawn(move || {
                for _ in 0..ITERATIONS {
                    let a = pool.acquire().unwrap();
                    let b = pool.acquire().unwrap();
                    assert_ne!(a.id(), b.id());
                    drop(b);
                    drop(a);
                }
            })
        })
        .collect();

    for _ in 0..ITERATIONS {
        let idle = pool.lock_idle();
        assert_distinct(&idle.ids());
    }

    for h in handles {
        h.join().expect("borrower panicked");
    }
    assert_distinct(&pool.lock_idle().ids());
}
