//! Per-invocation configuration for the `parallel_for` family.

use std::thread;

use crate::thread_pool::ThreadPool;
use crate::thread_pool::default_pool;

// -----------------------------------------------------------------------------
// Strategy

/// Which execution backend a parallel call should prefer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Strategy {
    /// The pool-and-queue scheduler in this crate.
    #[default]
    Default,
    /// Reserved: prefer an alternate backend when one is compiled in. No
    /// alternate backend currently is, so this behaves like `Default`.
    TryAlternateBackend,
}

// -----------------------------------------------------------------------------
// Parallel options

/// Options consumed by every `parallel_for` variant: thread budget, minimum
/// chunk size, target pool, and nested-parallelism policy.
///
/// Options are resolved once per top-level call. Unset fields pick up their
/// defaults at that point: the pool becomes the [`default_pool`], and a zero
/// thread budget becomes the pool size plus one (the workers plus the
/// calling thread).
///
/// ```
/// use tutti::ParallelOptions;
///
/// let opt = ParallelOptions::new().max_threads(4).min_items(1024);
/// # let _ = opt;
/// ```
#[derive(Clone, Copy, Default)]
pub struct ParallelOptions<'pool> {
    pub(crate) max_threads: usize,
    pub(crate) min_items: i64,
    pub(crate) pool: Option<&'pool ThreadPool>,
    pub(crate) recursive: bool,
    pub(crate) strategy: Strategy,
}

impl<'pool> ParallelOptions<'pool> {
    /// Default options: auto thread budget, a minimum chunk of 16384 items,
    /// the default pool, nested parallel calls serialized.
    pub fn new() -> ParallelOptions<'pool> {
        ParallelOptions {
            max_threads: 0,
            min_items: 16384,
            pool: None,
            recursive: false,
            strategy: Strategy::Default,
        }
    }

    /// Caps the number of threads used, counting the calling thread. Zero
    /// means auto (pool size plus one).
    pub fn max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = max_threads;
        self
    }

    /// Sets the minimum number of items worth splitting into a chunk.
    pub fn min_items(mut self, min_items: i64) -> Self {
        self.min_items = min_items;
        self
    }

    /// Targets a specific pool instead of the process default.
    pub fn pool(mut self, pool: &'pool ThreadPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Allows a parallel call made from inside a pool task to fan out again.
    /// Off by default: nested calls run serially on the same worker, which
    /// prevents oversubscription and the worker-blocks-on-itself deadlock.
    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    /// Selects an execution [`Strategy`].
    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Fills unset fields and clamps the thread budget. Called once at the
    /// top of every parallel driver.
    pub(crate) fn resolve(&mut self) {
        if self.pool.is_none() {
            self.pool = Some(default_pool());
        }
        let pool = self.pool.unwrap();
        if self.max_threads == 0 {
            // Workers plus the calling thread.
            self.max_threads = pool.size() + 1;
        }
        if !self.recursive && pool.is_worker(thread::current().id()) {
            // The calling thread is already a pool worker; run any nested
            // parallelism serially on it.
            self.max_threads = 1;
        }
    }

    /// True once resolution decided this call runs on the calling thread
    /// only.
    #[inline]
    pub(crate) fn single_thread(&self) -> bool {
        self.max_threads == 1
    }

    /// The resolved pool. Only valid after [`ParallelOptions::resolve`].
    #[inline]
    pub(crate) fn resolved_pool(&self) -> &'pool ThreadPool {
        self.pool.expect("options not resolved")
    }
}
