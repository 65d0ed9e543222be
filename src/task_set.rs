//! A per-caller handle tracking a batch of related pushes, with a wait loop
//! that opportunistically executes queued tasks instead of blocking.
//!
//! If a submitter blocks outright while its subtasks sit in a saturated
//! queue, it wastes a thread at best and deadlocks at worst. The wait here
//! is a small state machine instead: poll the handles for a few rounds to
//! amortize scheduling jitter, then try to steal one queued task and run it
//! on the calling thread, and yield to the OS scheduler whenever the queue
//! is empty. Work-stealing guarantees forward progress as long as anything
//! is queued.

use std::panic::resume_unwind;
use std::thread;
use std::thread::ThreadId;

use tracing::trace;

use crate::handle::TaskError;
use crate::handle::TaskHandle;
use crate::sync;
use crate::thread_pool::ThreadPool;

// -----------------------------------------------------------------------------
// Wait policy

/// Tuning knobs for the polling phase of [`TaskSet::wait`].
#[derive(Clone, Copy, Debug)]
pub struct WaitPolicy {
    /// Number of cheap poll-and-recheck rounds before the waiter starts
    /// stealing queued tasks.
    pub poll_tries: u32,
    /// Pause hints issued between polls.
    pub poll_spins: u32,
}

impl Default for WaitPolicy {
    fn default() -> WaitPolicy {
        WaitPolicy {
            poll_tries: 4,
            poll_spins: 4,
        }
    }
}

// -----------------------------------------------------------------------------
// Task set

/// Tracks the handles returned by a batch of [`ThreadPool::push`] calls and
/// waits for their joint completion.
///
/// A `TaskSet` belongs to the thread that created it; only that thread may
/// push into it or wait on it. Dropping an unwaited set waits for the
/// outstanding tasks first, so a set can never outlive work that borrows
/// from the submitter's stack.
pub struct TaskSet<'pool> {
    handles: Vec<TaskHandle<()>>,
    pool: &'pool ThreadPool,
    submitter: ThreadId,
    policy: WaitPolicy,
    waited: bool,
}

impl<'pool> TaskSet<'pool> {
    /// Creates an empty set bound to `pool`, owned by the calling thread.
    pub fn new(pool: &'pool ThreadPool) -> TaskSet<'pool> {
        TaskSet::with_policy(pool, WaitPolicy::default())
    }

    /// Like [`TaskSet::new`], with explicit wait tuning.
    pub fn with_policy(pool: &'pool ThreadPool, policy: WaitPolicy) -> TaskSet<'pool> {
        TaskSet {
            handles: Vec::new(),
            pool,
            submitter: thread::current().id(),
            policy,
            waited: false,
        }
    }

    /// Records a handle in the set. Must be called by the submitter.
    pub fn push(&mut self, handle: TaskHandle<()>) {
        debug_assert_eq!(
            self.submitter,
            thread::current().id(),
            "a TaskSet may only be used by the thread that created it"
        );
        self.handles.push(handle);
    }

    /// Number of tasks tracked by the set.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// True when the set tracks no tasks.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Waits until every task in the set has completed, then resumes the
    /// first captured panic, if any, on the calling thread. Tasks discarded
    /// by a pool stop count as completed.
    ///
    /// With `block = true`, or when the submitter is itself a pool worker
    /// (nested work-stealing loops are not worth their stack depth), this
    /// blocks on each handle in turn. Otherwise it polls, steals queued
    /// tasks, and yields per the set's [`WaitPolicy`].
    pub fn wait(&mut self, block: bool) {
        self.wait_all(block);
        for handle in self.handles.drain(..) {
            if let Err(TaskError::Panicked(payload)) = handle.join() {
                resume_unwind(payload);
            }
        }
    }

    /// Waits for a single task in the set, by push order. Does not consume
    /// its outcome. Out-of-range indices return immediately.
    pub fn wait_for_task(&mut self, index: usize, block: bool) {
        debug_assert_eq!(
            self.submitter,
            thread::current().id(),
            "a TaskSet may only be used by the thread that created it"
        );
        let Some(handle) = self.handles.get(index) else {
            return;
        };
        if block || self.pool.is_worker(self.submitter) {
            handle.wait();
            return;
        }
        let mut tries = 0;
        while !handle.is_ready() {
            tries += 1;
            if tries < self.policy.poll_tries {
                sync::pause(self.policy.poll_spins);
            } else if !self.pool.run_one_task() {
                thread::yield_now();
            }
        }
    }

    /// The joint-completion wait, without outcome handling. Used by both
    /// the explicit `wait` and the drop guard.
    fn wait_all(&mut self, block: bool) {
        debug_assert_eq!(
            self.submitter,
            thread::current().id(),
            "a TaskSet may only be waited on by the thread that created it"
        );
        self.waited = true;

        // A submitter that is itself inside the pool must not start a nested
        // stealing loop; block on the handles directly.
        if block || self.pool.is_worker(self.submitter) {
            for handle in &self.handles {
                handle.wait();
            }
            return;
        }

        let mut tries = 0;
        loop {
            if self.handles.iter().all(TaskHandle::is_ready) {
                return;
            }
            tries += 1;
            if tries < self.policy.poll_tries {
                // Polling: a few cheap spins cover the common case where the
                // last chunks are finishing right now.
                sync::pause(self.policy.poll_spins);
                continue;
            }
            // Stealing: run one queued task ourselves; if the queue is
            // empty, yielding is all that's left to do.
            if !self.pool.run_one_task() {
                thread::yield_now();
            }
        }
    }
}

impl Drop for TaskSet<'_> {
    fn drop(&mut self) {
        if !self.waited && !self.handles.is_empty() {
            trace!("waiting on dropped TaskSet with {} task(s)", self.handles.len());
            self.wait_all(false);
        }
    }
}
