//! Worker-pool abstraction for coarse-grained data parallelism (C6 —
//! spec §4.6, §5). The core has no asynchronous I/O; the only
//! concurrency is a worker pool spun up for, and torn down after,
//! a single parallel pass (block rerandomization on safe close,
//! parallel block decrypt within a slice, safe-prime search).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;

use rayon::prelude::*;
use rayon::ThreadPoolBuilder;

/// Applies `f` to every element of `seq` in deterministically-sized
/// chunks spread across `workers` threads, returning results in the
/// original order (spec §5's ordering guarantee — callers may rely on
/// `result[i]` corresponding to `seq[i]`).
pub fn parallel_map<T, R, F>(seq: &[T], chunk_size: usize, workers: usize, f: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync,
{
    if seq.is_empty() {
        return Vec::new();
    }
    let chunk_size = chunk_size.max(1);
    let pool = ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .build()
        .expect("failed to build worker pool");
    pool.install(|| seq.par_chunks(chunk_size).flat_map_iter(|chunk| chunk.iter().map(&f)).collect())
}

/// Spawns `workers` threads, each calling `f` in a loop until it
/// returns `Some`; the first such result wins and the remaining
/// workers are cancelled (spec §4.6, the canonical use being
/// safe-prime search). Each worker is a fresh OS thread, so the
/// thread-local RNGs `f` draws from (e.g. `rand::thread_rng`) are
/// independently seeded the first time each worker touches them —
/// satisfying the reseed-after-spawn requirement without extra code.
pub fn parallel_try<T, F>(workers: usize, f: F) -> T
where
    T: Send,
    F: Fn() -> Option<T> + Sync,
{
    let workers = workers.max(1);
    let cancelled = AtomicBool::new(false);
    let (tx, rx) = mpsc::channel();

    thread::scope(|scope| {
        for _ in 0..workers {
            let tx = tx.clone();
            let cancelled = &cancelled;
            let f = &f;
            scope.spawn(move || {
                while !cancelled.load(Ordering::Relaxed) {
                    if let Some(result) = f() {
                        cancelled.store(true, Ordering::Relaxed);
                        let _ = tx.send(result);
                        return;
                    }
                }
            });
        }
        drop(tx);
        rx.recv().expect("at least one worker must produce a result")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn parallel_map_preserves_order() {
        let seq: Vec<i32> = (0..37).collect();
        let result = parallel_map(&seq, 4, 3, |x| x * 2);
        let expected: Vec<i32> = seq.iter().map(|x| x * 2).collect();
        assert_eq!(result, expected);
    }

    #[test]
    fn parallel_map_handles_empty_input() {
        let seq: Vec<i32> = Vec::new();
        assert!(parallel_map(&seq, 4, 3, |x| *x).is_empty());
    }

    #[test]
    fn parallel_try_returns_first_success_and_stops_others() {
        let attempts = AtomicUsize::new(0);
        let result = parallel_try(4, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            if n >= 3 {
                Some(n)
            } else {
                None
            }
        });
        assert!(result >= 3);
    }
}
