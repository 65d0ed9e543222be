//! The thread pool: worker threads, the shared task queue, the worker-id
//! registry, and the process-wide default pool.
//!
//! Workers pull from one shared FIFO and sleep on a condition variable when
//! it runs dry. Each worker owns a reference-counted halt flag, captured by
//! copy into its run loop so the pool's thread list can be resized without
//! invalidating running workers. The registry tracks which native threads
//! are currently acting as pool workers; it drives both nested-parallelism
//! clamping and the choice of wait strategy in
//! [`TaskSet`](crate::TaskSet).

use core::num::NonZero;
use core::sync::atomic::AtomicBool;
use core::sync::atomic::AtomicUsize;
use core::sync::atomic::Ordering;
use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::thread;
use std::thread::ThreadId;

use tracing::debug;
use tracing::trace;

use crate::handle;
use crate::handle::TaskHandle;
use crate::sync::SpinMutex;
use crate::task::Task;
use crate::task::TaskQueue;

// -----------------------------------------------------------------------------
// Worker ids

/// Identifies the thread a task is running on. Tasks executed by a pool
/// worker see that worker's index; tasks executed inline on the submitting
/// thread (the last chunk of a `parallel_for`, a stolen task, or the
/// single-thread path) see [`WorkerId::CALLER`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WorkerId(Option<usize>);

impl WorkerId {
    /// The id passed to tasks run directly on the submitting thread.
    pub const CALLER: WorkerId = WorkerId(None);

    pub(crate) fn pool(index: usize) -> WorkerId {
        WorkerId(Some(index))
    }

    /// The worker's index within the pool, or `None` for inline execution.
    #[inline]
    pub fn index(self) -> Option<usize> {
        self.0
    }

    /// True when the task is running on a pool-owned thread.
    #[inline]
    pub fn is_pool_worker(self) -> bool {
        self.0.is_some()
    }
}

// -----------------------------------------------------------------------------
// Pool internals

/// State shared between the pool handle and its worker threads.
struct PoolInner {
    /// The shared FIFO of pending tasks.
    queue: TaskQueue,
    /// Paired with `task_ready`. Workers re-check the queue under this lock
    /// before sleeping, so a push-then-notify cannot be lost.
    sleep: Mutex<()>,
    /// Signaled on every push, broadcast on resize/stop.
    task_ready: Condvar,
    /// Number of workers currently blocked in the sleep loop.
    n_idle: AtomicUsize,
    /// Set by `stop(false)`; queued tasks are discarded.
    stopping: AtomicBool,
    /// Set by `stop(true)`; workers exit once the queue drains.
    draining: AtomicBool,
    /// Current pool size, kept in an atomic so `very_busy` stays lock-free.
    size: AtomicUsize,
    /// Refcount of threads currently acting as workers of this pool. Guarded
    /// by its own spin lock, separate from the queue lock, because
    /// `is_worker` is checked on every wait-poll iteration.
    registry: SpinMutex<HashMap<ThreadId, isize>>,
}

impl PoolInner {
    fn register_worker(&self, id: ThreadId) {
        *self.registry.lock().entry(id).or_insert(0) += 1;
    }

    fn deregister_worker(&self, id: ThreadId) {
        let mut registry = self.registry.lock();
        if let Some(count) = registry.get_mut(&id) {
            *count -= 1;
            if *count <= 0 {
                registry.remove(&id);
            }
        }
    }

    fn is_worker(&self, id: ThreadId) -> bool {
        self.registry.lock().get(&id).is_some_and(|count| *count > 0)
    }
}

/// A worker thread plus the halt flag its run loop watches. The flag is
/// behind an `Arc` because the run loop keeps its own clone, so the pool's
/// thread list can be trimmed while the departing thread is still winding
/// down.
struct WorkerThread {
    halt: Arc<AtomicBool>,
    handle: thread::JoinHandle<()>,
}

// -----------------------------------------------------------------------------
// Thread pool

/// A resizable pool of worker threads pulling from one shared FIFO queue.
///
/// Tasks are submitted with [`ThreadPool::push`], which returns a
/// [`TaskHandle`] immediately. Batches of related pushes are usually tracked
/// through a [`TaskSet`](crate::TaskSet), whose wait loop lets the
/// submitting thread execute queued tasks itself instead of blocking.
///
/// Most code wants the shared [`default_pool`] rather than a private pool.
///
/// Dropping a pool implies `stop(true)`: every task queued before the drop
/// completes first.
pub struct ThreadPool {
    inner: Arc<PoolInner>,
    threads: Mutex<Vec<WorkerThread>>,
}

impl ThreadPool {
    /// Creates a pool with `nthreads` workers. Zero or negative means
    /// auto-detect: the `TUTTI_THREADS` environment variable is consulted
    /// first (then the legacy alias `CUE_THREADS`), falling back to the
    /// hardware concurrency minus one, with a floor of one worker.
    pub fn new(nthreads: isize) -> ThreadPool {
        let nthreads = if nthreads <= 0 { -1 } else { nthreads };
        let pool = ThreadPool {
            inner: Arc::new(PoolInner {
                queue: TaskQueue::new(),
                sleep: Mutex::new(()),
                task_ready: Condvar::new(),
                n_idle: AtomicUsize::new(0),
                stopping: AtomicBool::new(false),
                draining: AtomicBool::new(false),
                size: AtomicUsize::new(0),
                registry: SpinMutex::new(HashMap::new()),
            }),
            threads: Mutex::new(Vec::new()),
        };
        pool.resize(nthreads);
        pool
    }

    /// Changes the number of worker threads. A negative count auto-detects
    /// as in [`ThreadPool::new`]; zero is honored literally and leaves the
    /// pool with no workers (queued tasks then only run via work-stealing
    /// waits). Growing spawns new workers; shrinking flags the trailing
    /// workers to halt, wakes all sleepers, and joins the departing threads
    /// before returning.
    ///
    /// Resizes are serialized internally, but must not be issued from inside
    /// a task running on this pool (a halting worker cannot join itself).
    /// Once the pool has been stopped this is a no-op.
    pub fn resize(&self, nthreads: isize) {
        if self.inner.stopping.load(Ordering::Relaxed) || self.inner.draining.load(Ordering::Relaxed)
        {
            return;
        }

        let new_size = resolve_thread_count(nthreads);
        let mut threads = self.threads.lock().unwrap();
        let current = threads.len();
        debug!("resizing thread pool from {current} to {new_size} worker(s)");

        if new_size >= current {
            for index in current..new_size {
                let halt = Arc::new(AtomicBool::new(false));
                let worker_halt = halt.clone();
                let worker_inner = self.inner.clone();
                let handle = thread::Builder::new()
                    .name(format!("tutti worker {index}"))
                    .spawn(move || worker_loop(worker_inner, index, worker_halt))
                    .expect("failed to spawn worker thread");
                threads.push(WorkerThread { halt, handle });
            }
        } else {
            let departing = threads.split_off(new_size);
            for worker in &departing {
                worker.halt.store(true, Ordering::Relaxed);
            }
            // Broadcast so sleeping workers notice their halt flag even with
            // an empty queue.
            {
                let _guard = self.inner.sleep.lock().unwrap();
                self.inner.task_ready.notify_all();
            }
            for worker in departing {
                let _ = worker.handle.join();
            }
        }

        self.inner.size.store(new_size, Ordering::Relaxed);
    }

    /// Submits a task to the pool and returns a handle for its result. The
    /// task receives the id of whichever worker ends up running it. Never
    /// blocks the caller.
    ///
    /// A panic inside `f` is captured into the handle rather than unwinding
    /// through the worker; see [`TaskHandle::join`].
    ///
    /// Pushing to a pool that is mid-`stop` is a contract violation: the
    /// task may be discarded without running.
    pub fn push<F, R>(&self, f: F) -> TaskHandle<R>
    where
        F: FnOnce(WorkerId) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (promise, handle) = handle::pair();
        self.inner.queue.push(Task::new(move |id| {
            promise.fulfill(handle::capture_panics(|| f(id)));
        }));
        // Notify under the sleep lock so the wake-up cannot slip between a
        // worker's final queue check and its wait.
        {
            let _guard = self.inner.sleep.lock().unwrap();
            self.inner.task_ready.notify_one();
        }
        handle
    }

    /// Pops one queued task, if any, and runs it on the calling thread. The
    /// calling thread is registered as a worker for the duration, so nested
    /// parallel calls made by the stolen task detect recursion correctly.
    /// Returns whether a task was found and run.
    ///
    /// This is how a thread waiting on a [`TaskSet`](crate::TaskSet) makes
    /// forward progress instead of blocking outright.
    pub fn run_one_task(&self) -> bool {
        match self.inner.queue.pop() {
            Some(task) => {
                let id = thread::current().id();
                self.inner.register_worker(id);
                task.run(WorkerId::CALLER);
                self.inner.deregister_worker(id);
                true
            }
            None => false,
        }
    }

    /// Stops the pool and joins every worker thread.
    ///
    /// With `wait = false`, queued-but-unstarted tasks are discarded and
    /// never run (their handles resolve to
    /// [`TaskError::Discarded`](crate::TaskError::Discarded)); workers stop
    /// after at most the task they are currently executing.
    ///
    /// With `wait = true`, workers keep pulling until the queue is empty, so
    /// every task queued before the call completes exactly once.
    ///
    /// Either way the pool stays stopped afterwards; construct a new pool to
    /// continue.
    pub fn stop(&self, wait: bool) {
        if wait {
            if self.inner.stopping.load(Ordering::Relaxed)
                || self.inner.draining.swap(true, Ordering::Relaxed)
            {
                return;
            }
            debug!("draining thread pool");
        } else {
            if self.inner.stopping.swap(true, Ordering::Relaxed) {
                return;
            }
            debug!("stopping thread pool, discarding queued tasks");
            {
                let threads = self.threads.lock().unwrap();
                for worker in threads.iter() {
                    worker.halt.store(true, Ordering::Relaxed);
                }
            }
            self.inner.queue.clear();
        }

        {
            let _guard = self.inner.sleep.lock().unwrap();
            self.inner.task_ready.notify_all();
        }

        let mut threads = self.threads.lock().unwrap();
        for worker in threads.drain(..) {
            let _ = worker.handle.join();
        }

        // A pool with no workers may still hold queued tasks; drop them so
        // their handles resolve.
        self.inner.queue.clear();
        self.inner.size.store(0, Ordering::Relaxed);
    }

    /// Number of worker threads currently in the pool.
    #[inline]
    pub fn size(&self) -> usize {
        self.inner.size.load(Ordering::Relaxed)
    }

    /// Number of workers currently asleep waiting for tasks.
    #[inline]
    pub fn idle(&self) -> usize {
        self.inner.n_idle.load(Ordering::Relaxed)
    }

    /// Number of tasks sitting in the queue, not yet claimed by a worker.
    #[inline]
    pub fn jobs_in_queue(&self) -> usize {
        self.inner.queue.len()
    }

    /// Heuristic: the queue holds more than four times as many tasks as
    /// there are workers. The `parallel_for` drivers use this to run chunks
    /// inline rather than pile onto a saturated queue; it never changes the
    /// set of work performed, only where it runs.
    #[inline]
    pub fn very_busy(&self) -> bool {
        self.jobs_in_queue() > 4 * self.size()
    }

    /// Marks `id` as currently executing as a worker of this pool. The
    /// registry is a refcount, so nested registration is allowed.
    pub fn register_worker(&self, id: ThreadId) {
        self.inner.register_worker(id);
    }

    /// Reverses one [`ThreadPool::register_worker`] call for `id`.
    pub fn deregister_worker(&self, id: ThreadId) {
        self.inner.deregister_worker(id);
    }

    /// True when `id` is currently executing as a worker of this pool,
    /// either as a pool-owned thread or inside a stolen task.
    pub fn is_worker(&self, id: ThreadId) -> bool {
        self.inner.is_worker(id)
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.stop(true);
    }
}

// -----------------------------------------------------------------------------
// Worker run loop

/// The run loop executed by every pool-owned worker thread: drain the queue,
/// then sleep on the condvar until a task arrives, the halt flag is set, or
/// the pool is draining with nothing left to do.
fn worker_loop(pool: Arc<PoolInner>, index: usize, halt: Arc<AtomicBool>) {
    trace!("worker {index} starting");
    let thread_id = thread::current().id();
    pool.register_worker(thread_id);
    let id = WorkerId::pool(index);

    'run: loop {
        // Execute whatever is queued. The halt flag is honored between
        // tasks, so a shrinking pool releases this thread after at most one
        // more task even if the queue is still full.
        while let Some(task) = pool.queue.pop() {
            task.run(id);
            if halt.load(Ordering::Relaxed) {
                break 'run;
            }
        }

        // The queue looked empty; re-check it under the sleep lock and wait.
        let mut guard = pool.sleep.lock().unwrap();
        pool.n_idle.fetch_add(1, Ordering::Relaxed);
        let task = loop {
            if let Some(task) = pool.queue.pop() {
                break Some(task);
            }
            if halt.load(Ordering::Relaxed) || pool.draining.load(Ordering::Relaxed) {
                break None;
            }
            guard = pool.task_ready.wait(guard).unwrap();
        };
        pool.n_idle.fetch_sub(1, Ordering::Relaxed);
        drop(guard);

        match task {
            Some(task) => {
                task.run(id);
                if halt.load(Ordering::Relaxed) {
                    break 'run;
                }
            }
            None => break 'run,
        }
    }

    pool.deregister_worker(thread_id);
    trace!("worker {index} exiting");
}

// -----------------------------------------------------------------------------
// Thread count resolution

/// Maps a requested thread count to an actual one: non-negative counts are
/// taken as-is, negative auto-detects, leaving one core for the submitting
/// thread.
fn resolve_thread_count(nthreads: isize) -> usize {
    if nthreads >= 0 {
        nthreads as usize
    } else {
        threads_default().saturating_sub(1).max(1)
    }
}

/// The process's preferred total concurrency: the `TUTTI_THREADS` env var,
/// the legacy `CUE_THREADS` alias, or the hardware concurrency.
fn threads_default() -> usize {
    for var in ["TUTTI_THREADS", "CUE_THREADS"] {
        if let Ok(value) = env::var(var) {
            if let Ok(n) = value.trim().parse::<usize>() {
                if n > 0 {
                    return n;
                }
            }
        }
    }
    thread::available_parallelism()
        .map(NonZero::get)
        .unwrap_or(1)
}

// -----------------------------------------------------------------------------
// Default pool

static DEFAULT_POOL: OnceLock<ThreadPool> = OnceLock::new();

/// Returns the process-wide default pool, constructing it (with auto-detected
/// size) on first use.
pub fn default_pool() -> &'static ThreadPool {
    DEFAULT_POOL.get_or_init(|| {
        debug!("constructing default thread pool");
        ThreadPool::new(0)
    })
}

/// Drains and shuts down the default pool, if it was ever constructed. Safe
/// to call more than once; intended as a teardown hook at process exit.
/// After shutdown the default pool has no workers, so parallel-for calls
/// resolve to single-threaded execution.
pub fn shutdown_default_pool() {
    if let Some(pool) = DEFAULT_POOL.get() {
        pool.stop(true);
    }
}
