//! Scenario: 4 threads x mixed alloc/free ops against one shared GPA;
//! check no leaks and every still-live block resolves through a real
//! allocator at the end.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};

use anchormem::{DefaultProcessProvider, GeneralAllocator, Options};

const OPS_PER_THREAD: usize = 250_000;
const THREADS: usize = 4;

#[test]
fn four_threads_mixed_ops_leave_no_leaks() {
    let gpa = Arc::new(GeneralAllocator::new(Options::default(), Arc::new(DefaultProcessProvider)).unwrap());
    let barrier = Arc::new(Barrier::new(THREADS));
    let live_count = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let gpa = gpa.clone();
            let barrier = barrier.clone();
            let live_count = live_count.clone();
            std::thread::spawn(move || {
                barrier.wait();
                let mut held = Vec::new();
                let mut rng_state: u64 = 0x9E3779B9 ^ (t as u64);
                for _ in 0..OPS_PER_THREAD {
                    rng_state = rng_state.wrapping_mul(6364136223846793005).wrapping_add(1);
                    let choice = rng_state % 3;
                    if choice == 0 || held.is_empty() {
                        let size = 16 + (rng_state as usize % 2048);
                        let b = gpa.allocate(size).unwrap();
                        unsafe {
                            b.as_mut_slice()[0] = (t & 0xFF) as u8;
                        }
                        held.push(b);
                        live_count.fetch_add(1, Ordering::Relaxed);
                    } else {
                        let idx = (rng_state as usize) % held.len();
                        let b = held.swap_remove(idx);
                        assert_eq!(gpa.free(b), Ok(true));
                        live_count.fetch_sub(1, Ordering::Relaxed);
                    }
                }
                for b in held {
                    assert_eq!(gpa.free(b), Ok(true));
                    live_count.fetch_sub(1, Ordering::Relaxed);
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(live_count.load(Ordering::Relaxed), 0);

    // The allocator must still be usable: no arena-level invariant broke.
    let b = gpa.allocate(64).unwrap();
    assert!(b.len() >= 64);
    assert_eq!(gpa.free(b), Ok(true));
}
