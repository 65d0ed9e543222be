//! The promise/handle pair that carries a task's outcome back to whoever
//! submitted it. One [`Promise`] is baked into every pushed task; the
//! matching [`TaskHandle`] is returned to the caller.
//!
//! The pair is a one-shot channel built on a futex word (via `atomic-wait`)
//! rather than a mutex, because [`TaskSet`](crate::TaskSet) hammers
//! `is_ready` in its polling loop and that check must stay a single atomic
//! load.

use core::cell::UnsafeCell;
use core::fmt;
use core::panic::AssertUnwindSafe;
use core::sync::atomic::AtomicU32;
use core::sync::atomic::Ordering;
use std::any::Any;
use std::panic::catch_unwind;
use std::sync::Arc;

// -----------------------------------------------------------------------------
// States

/// No outcome yet, nobody asleep.
const PENDING: u32 = 0b00;

/// A bit set by the handle before sleeping, telling the promise to wake it.
const WAITING: u32 = 0b01;

/// A bit set by the promise once the outcome slot has been written.
const READY: u32 = 0b10;

// -----------------------------------------------------------------------------
// Task errors

/// Why a task failed to produce a value.
pub enum TaskError {
    /// The task body panicked. The payload is whatever the panic carried,
    /// suitable for `std::panic::resume_unwind`.
    Panicked(Box<dyn Any + Send + 'static>),
    /// The task was discarded before it ever ran, e.g. by
    /// [`ThreadPool::stop`](crate::ThreadPool::stop) with `wait = false`.
    Discarded,
}

impl TaskError {
    /// Resumes unwinding if this error carries a panic payload.
    pub fn resume(self) -> Self {
        if let TaskError::Panicked(payload) = self {
            std::panic::resume_unwind(payload);
        }
        self
    }
}

impl fmt::Debug for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::Panicked(_) => f.write_str("TaskError::Panicked(..)"),
            TaskError::Discarded => f.write_str("TaskError::Discarded"),
        }
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::Panicked(_) => f.write_str("task panicked"),
            TaskError::Discarded => f.write_str("task was discarded before running"),
        }
    }
}

impl std::error::Error for TaskError {}

/// Runs `f`, converting any panic into a [`TaskError::Panicked`]. Worker
/// threads rely on this to keep task panics from unwinding through the run
/// loop; the panic is re-surfaced to whoever observes the task's handle.
#[inline]
pub(crate) fn capture_panics<F, R>(f: F) -> Result<R, TaskError>
where
    F: FnOnce() -> R,
{
    catch_unwind(AssertUnwindSafe(f)).map_err(TaskError::Panicked)
}

// -----------------------------------------------------------------------------
// Shared state

struct Shared<T> {
    /// Futex word; `WAITING` and `READY` bits as defined above.
    state: AtomicU32,
    /// Written exactly once by the promise side before `READY` is set.
    outcome: UnsafeCell<Option<Result<T, TaskError>>>,
}

// SAFETY: The state word serializes access to the outcome slot: the promise
// writes it before publishing `READY`, the handle reads it only after
// observing `READY`. The value itself crosses threads, hence `T: Send`.
unsafe impl<T: Send> Sync for Shared<T> {}

// SAFETY: See the `Sync` impl; ownership of the shared block may move freely.
unsafe impl<T: Send> Send for Shared<T> {}

impl<T> Shared<T> {
    fn fulfill(&self, outcome: Result<T, TaskError>) {
        // SAFETY: Only the promise side writes this slot, exactly once,
        // before the `READY` bit is published below.
        unsafe { *self.outcome.get() = Some(outcome) };
        let state = self.state.fetch_or(READY, Ordering::Release);
        if state & WAITING != 0 {
            atomic_wait::wake_all(&self.state);
        }
    }
}

/// Creates a connected promise/handle pair.
pub(crate) fn pair<T: Send>() -> (Promise<T>, TaskHandle<T>) {
    let shared = Arc::new(Shared {
        state: AtomicU32::new(PENDING),
        outcome: UnsafeCell::new(None),
    });
    let promise = Promise {
        shared: Some(shared.clone()),
    };
    let handle = TaskHandle { shared };
    (promise, handle)
}

// -----------------------------------------------------------------------------
// Promise

/// The sending half, owned by the task closure. Fulfilled exactly once; if
/// the promise is dropped unfulfilled (the task was discarded rather than
/// run), the handle resolves to [`TaskError::Discarded`] so waiters never
/// hang.
pub(crate) struct Promise<T> {
    shared: Option<Arc<Shared<T>>>,
}

impl<T> Promise<T> {
    /// Publishes the task's outcome and wakes the handle if it is asleep.
    pub fn fulfill(mut self, outcome: Result<T, TaskError>) {
        let shared = self
            .shared
            .take()
            .expect("a promise can only be fulfilled once");
        shared.fulfill(outcome);
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.fulfill(Err(TaskError::Discarded));
        }
    }
}

// -----------------------------------------------------------------------------
// Task handle

/// The receiving half of a pushed task, returned by
/// [`ThreadPool::push`](crate::ThreadPool::push). Supports a non-blocking
/// readiness check, a blocking wait, and a consuming [`TaskHandle::join`]
/// that yields the task's return value or error.
pub struct TaskHandle<T = ()> {
    shared: Arc<Shared<T>>,
}

impl<T: Send> TaskHandle<T> {
    /// Returns true once the task has completed (or been discarded).
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.shared.state.load(Ordering::Acquire) & READY != 0
    }

    /// Blocks until the task has completed. Does not consume the outcome.
    pub fn wait(&self) {
        // Announce that we intend to sleep. The promise checks this bit
        // after setting `READY`, so the wake cannot be lost.
        let mut state = self.shared.state.fetch_or(WAITING, Ordering::Acquire) | WAITING;
        while state & READY == 0 {
            atomic_wait::wait(&self.shared.state, state);
            state = self.shared.state.load(Ordering::Acquire);
        }
    }

    /// Blocks until the task has completed and returns its outcome.
    ///
    /// A panic inside the task body is reported as
    /// [`TaskError::Panicked`]; call [`TaskError::resume`] to re-raise it
    /// on the current thread.
    pub fn join(self) -> Result<T, TaskError> {
        self.wait();
        // SAFETY: `READY` is set, so the promise side has finished its one
        // write and will never touch the slot again. Consuming `self` makes
        // this the only reader.
        let outcome = unsafe { (*self.shared.outcome.get()).take() };
        outcome.expect("task outcome taken twice")
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.load(Ordering::Relaxed);
        f.debug_struct("TaskHandle")
            .field("ready", &(state & READY != 0))
            .finish()
    }
}
