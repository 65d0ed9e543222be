//! The type-erased unit of work and the shared FIFO it sits in.
//!
//! A [`Task`] owns its closure on the heap; whichever entity holds the task
//! (the queue, or the thread executing it) is responsible for it, and the
//! closure is dropped exactly once on every path, including the discard path
//! taken by `stop(false)`.

use std::collections::VecDeque;

use crate::sync::SpinMutex;
use crate::thread_pool::WorkerId;

// -----------------------------------------------------------------------------
// Task

/// One unit of work: a boxed closure taking the id of the worker that runs
/// it. The closure built by [`ThreadPool::push`](crate::ThreadPool::push)
/// also owns the promise for the task's outcome, so dropping an unexecuted
/// task resolves its handle to "discarded" automatically.
pub struct Task {
    body: Box<dyn FnOnce(WorkerId) + Send>,
}

impl Task {
    /// Wraps a closure into a task.
    pub fn new<F>(body: F) -> Task
    where
        F: FnOnce(WorkerId) + Send + 'static,
    {
        Task {
            body: Box::new(body),
        }
    }

    /// Runs the task on the current thread, consuming it.
    #[inline]
    pub fn run(self, worker: WorkerId) {
        (self.body)(worker);
    }
}

// -----------------------------------------------------------------------------
// Task queue

/// An unbounded FIFO of pending tasks, shared between all workers of a pool
/// and any callers doing work-stealing waits. Insertion order is the only
/// ordering guarantee; completion order across workers is unordered.
pub struct TaskQueue {
    tasks: SpinMutex<VecDeque<Task>>,
}

impl TaskQueue {
    /// Creates an empty queue.
    pub fn new() -> TaskQueue {
        TaskQueue {
            tasks: SpinMutex::new(VecDeque::new()),
        }
    }

    /// Appends a task at the back. The queue is unbounded, so this never
    /// fails and never blocks.
    #[inline]
    pub fn push(&self, task: Task) {
        self.tasks.lock().push_back(task);
    }

    /// Removes and returns the front task, or `None` if the queue is empty.
    /// Never blocks.
    #[inline]
    pub fn pop(&self) -> Option<Task> {
        self.tasks.lock().pop_front()
    }

    /// Number of tasks currently queued.
    #[inline]
    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Drops every queued task without running it. The dropped closures take
    /// their promises with them, resolving the associated handles to
    /// "discarded".
    pub fn clear(&self) {
        // Move the tasks out before dropping them, so no drop glue (and in
        // particular no promise wake-up) runs under the spin lock.
        let drained = std::mem::take(&mut *self.tasks.lock());
        drop(drained);
    }
}
