//! Explicit worker-pool handle
//!
//! The engine parallelizes by bundle index (inserts, removals, cache
//! regeneration, stripping) and by DAG level / bundle cache (queries). All
//! of that work runs on a [`WorkerPool`] passed in by the caller — there is
//! no process-wide singleton, so embedders control sizing and tests can pin
//! everything to a single thread for determinism.
//!
//! Tasks run to completion; nothing scheduled on the pool suspends waiting
//! for another task on the same pool.

#![forbid(unsafe_code)]

/// An explicit handle to a pool of worker threads.
pub struct WorkerPool {
    pool: rayon::ThreadPool,
}

impl WorkerPool {
    /// A pool sized to the machine's available parallelism.
    pub fn new() -> Self {
        Self::with_threads(0)
    }

    /// A pool with exactly `threads` workers (`0` = available parallelism).
    pub fn with_threads(threads: usize) -> Self {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("apsi-worker-{i}"))
            .build()
            .expect("worker pool construction cannot fail for valid thread counts");
        Self { pool }
    }

    /// A single-threaded pool; useful for deterministic tests.
    pub fn serial() -> Self {
        Self::with_threads(1)
    }

    /// Number of worker threads.
    #[inline]
    pub fn thread_count(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Run `op` with this pool installed as the rayon context, so nested
    /// parallel iterators inside `op` use these workers.
    #[inline]
    pub fn install<R: Send>(&self, op: impl FnOnce() -> R + Send) -> R {
        self.pool.install(op)
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("threads", &self.thread_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rayon::prelude::*;

    #[test]
    fn serial_pool_has_one_thread() {
        assert_eq!(WorkerPool::serial().thread_count(), 1);
    }

    #[test]
    fn install_scopes_parallel_iterators() {
        let pool = WorkerPool::with_threads(2);
        let sum: u64 = pool.install(|| (0..1000u64).into_par_iter().sum());
        assert_eq!(sum, 499_500);
    }
}
