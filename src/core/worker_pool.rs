//! Bounded worker pool for the data-parallel stages.
//!
//! Every parallel section of the pipeline (bounds checks, constant-residual folding,
//! residual evaluation, inner-iteration sweeps, linear solves) runs inside
//! [`WorkerPool::install`], so `num_threads` caps the threads it uses regardless of the
//! size of rayon's global pool. Without the `parallel` feature the sections run on the
//! calling thread.

#[cfg(feature = "parallel")]
use std::sync::Arc;

use crate::core::{CoreError, CoreResult};

/// Shared handle to a fixed-size thread pool. Clones refer to the same threads.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    num_threads: usize,
    #[cfg(feature = "parallel")]
    pool: Arc<rayon::ThreadPool>,
}

impl WorkerPool {
    /// Start a pool with exactly `num_threads` workers.
    ///
    /// # Errors
    /// `CoreError::InvalidInput` for zero threads, `CoreError::ThreadPool` if the workers
    /// cannot be spawned.
    pub fn new(num_threads: usize) -> CoreResult<Self> {
        if num_threads == 0 {
            return Err(CoreError::InvalidInput(
                "a worker pool needs at least one thread".to_string(),
            )
            .log());
        }

        #[cfg(feature = "parallel")]
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("apex-worker-{i}"))
            .build()
            .map_err(|e| {
                CoreError::ThreadPool(format!("failed to start {num_threads} worker threads"))
                    .log_with_source(e)
            })?;

        Ok(Self {
            num_threads,
            #[cfg(feature = "parallel")]
            pool: Arc::new(pool),
        })
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// Run `op` with this pool as the current rayon pool.
    pub fn install<R, F>(&self, op: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        #[cfg(feature = "parallel")]
        {
            self.pool.install(op)
        }
        #[cfg(not(feature = "parallel"))]
        {
            op()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[test]
    fn test_zero_threads_rejected() {
        assert!(matches!(WorkerPool::new(0), Err(CoreError::InvalidInput(_))));
    }

    #[cfg(feature = "parallel")]
    #[test]
    fn test_install_caps_parallelism() -> TestResult {
        use rayon::prelude::*;
        use std::collections::HashSet;

        let pool = WorkerPool::new(2)?;
        assert_eq!(pool.num_threads(), 2);
        assert_eq!(pool.install(rayon::current_num_threads), 2);

        let threads: HashSet<_> = pool.install(|| {
            (0..256)
                .into_par_iter()
                .map(|_| std::thread::current().id())
                .collect()
        });
        assert!(!threads.is_empty() && threads.len() <= 2);
        Ok(())
    }

    #[test]
    fn test_clones_share_threads() -> TestResult {
        let pool = WorkerPool::new(1)?;
        let clone = pool.clone();
        assert_eq!(clone.install(|| 40 + 2), 42);
        assert_eq!(clone.num_threads(), 1);
        Ok(())
    }
}
