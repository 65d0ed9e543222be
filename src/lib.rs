//! A task-parallel compute substrate built around a resizable thread pool.
//!
//! Tutti provides four pieces that stack on each other: a thread-safe FIFO
//! task queue, a [`ThreadPool`] of worker threads pulling from that queue, a
//! per-caller [`TaskSet`] handle for waiting on a batch of submitted tasks
//! without deadlocking, and a family of chunk-partitioning `parallel_for`
//! drivers layered on top.
//!
//! The design favors predictability over cleverness: one shared unbounded
//! queue, condition-variable wake-up for idle workers, and an opportunistic
//! "work-stealing wait" for callers blocked on their own submissions. A
//! caller waiting on a [`TaskSet`] polls briefly, then starts executing
//! queued tasks itself, so forward progress is guaranteed whenever the queue
//! is non-empty. Nested parallel calls launched from inside a worker's task
//! body are detected and serialized onto that worker, which rules out the
//! classic submit-and-block-on-yourself deadlock.
//!
//! # Example
//!
//! ```
//! use std::sync::atomic::{AtomicU64, Ordering};
//! use tutti::ParallelOptions;
//!
//! let total = AtomicU64::new(0);
//! tutti::parallel_for_range(
//!     0,
//!     1000,
//!     |begin, end| {
//!         let mut partial = 0;
//!         for i in begin..end {
//!             partial += (i * i) as u64;
//!         }
//!         total.fetch_add(partial, Ordering::Relaxed);
//!     },
//!     ParallelOptions::new(),
//! );
//! assert_eq!(total.into_inner(), (0..1000u64).map(|i| i * i).sum());
//! ```
//!
//! A process-wide default pool is constructed lazily on first use; see
//! [`default_pool`] and [`shutdown_default_pool`].

// -----------------------------------------------------------------------------
// Modules

mod handle;
mod options;
mod parallel;
mod sync;
mod task;
mod task_set;
mod thread_pool;

// -----------------------------------------------------------------------------
// Top-level exports

pub use handle::TaskError;
pub use handle::TaskHandle;
pub use options::ParallelOptions;
pub use options::Strategy;
pub use parallel::parallel_for;
pub use parallel::parallel_for_2d;
pub use parallel::parallel_for_chunked;
pub use parallel::parallel_for_chunked_2d;
pub use parallel::parallel_for_chunked_2d_id;
pub use parallel::parallel_for_chunked_id;
pub use parallel::parallel_for_range;
pub use task_set::TaskSet;
pub use task_set::WaitPolicy;
pub use thread_pool::ThreadPool;
pub use thread_pool::WorkerId;
pub use thread_pool::default_pool;
pub use thread_pool::shutdown_default_pool;
