//! Fork-join drivers that turn an index range into chunk tasks on a
//! [`ThreadPool`](crate::ThreadPool), plus a directly-executed final chunk.
//!
//! Every variant funnels through [`parallel_for_chunked_id`] (or its 2D
//! counterpart). The driver partitions `[begin, end)` into chunks, pushes
//! all but the last onto the pool, runs the last one itself to skip a
//! pointless handoff, and waits on the resulting
//! [`TaskSet`](crate::TaskSet) before returning. No ordering is promised
//! between chunks; the only guarantee is that every chunk has completed by
//! the time the call returns.
//!
//! Nested calls are tracked with a thread-local depth carried by an RAII
//! guard: any parallel call started from inside another one (on the same
//! thread) runs serially, as does any call made from inside a pool worker
//! unless [`ParallelOptions::recursive`] was set.

use core::cell::Cell;
use core::mem;
use std::thread_local;

use crate::options::ParallelOptions;
use crate::task_set::TaskSet;
use crate::thread_pool::WorkerId;

// -----------------------------------------------------------------------------
// Nesting depth

thread_local! {
    static NESTING: Cell<usize> = const { Cell::new(0) };
}

/// Scoped increment of the thread's parallel-call depth.
struct NestingGuard {
    depth: usize,
}

impl NestingGuard {
    fn enter() -> NestingGuard {
        let depth = NESTING.get() + 1;
        NESTING.set(depth);
        NestingGuard { depth }
    }
}

impl Drop for NestingGuard {
    fn drop(&mut self) {
        NESTING.set(self.depth - 1);
    }
}

// -----------------------------------------------------------------------------
// 1D drivers

/// Runs `task(id, chunk_begin, chunk_end)` over `[begin, end)` split into
/// chunks of `chunksize` items, potentially in parallel.
///
/// A `chunksize < 1` asks the driver to choose: the whole range when the
/// call resolves to a single thread, otherwise
/// `max(min_items, (end - begin) / (2 * max_threads))`. An explicit
/// `chunksize` is honored (clamped to the range length) even on the
/// single-thread path.
///
/// The last chunk (and every chunk, when single-threaded or when the pool
/// is [`very_busy`](crate::ThreadPool::very_busy)) runs directly on the
/// calling thread with [`WorkerId::CALLER`]. An empty range returns
/// immediately without touching the pool. The union of the chunk ranges
/// passed to `task` tiles `[begin, end)` exactly, with no gaps or overlaps.
pub fn parallel_for_chunked_id<F>(
    begin: i64,
    end: i64,
    chunksize: i64,
    task: F,
    mut opt: ParallelOptions<'_>,
) where
    F: Fn(WorkerId, i64, i64) + Send + Sync,
{
    if begin >= end {
        return;
    }

    let nesting = NestingGuard::enter();
    if nesting.depth > 1 {
        opt = opt.max_threads(1);
    }
    opt.resolve();
    let pool = opt.resolved_pool();

    let mut chunksize = chunksize.min(end - begin);
    if chunksize < 1 {
        if opt.single_thread() {
            chunksize = end - begin;
        } else {
            let splits = 2 * opt.max_threads as i64;
            chunksize = opt.min_items.max((end - begin) / splits);
        }
    }
    // min_items may be zero; never iterate on an empty chunk.
    chunksize = chunksize.max(1);

    let mut set = TaskSet::new(pool);

    // SAFETY: Every chunk task pushed below is recorded in `set`, and `set`
    // is waited before this function returns on every path: explicitly at
    // the end, or by its drop guard if the inline call unwinds. A queued
    // chunk therefore cannot outlive the borrowed task body, so erasing the
    // body's lifetime is sound.
    let body: &'static (dyn Fn(WorkerId, i64, i64) + Sync) =
        unsafe { mem::transmute(&task as &(dyn Fn(WorkerId, i64, i64) + Sync)) };

    let mut b = begin;
    while b < end {
        let e = (b + chunksize).min(end);
        if e == end || opt.single_thread() || pool.very_busy() {
            // The last (or only) chunk, or a saturated queue: run it here
            // instead of paying for a handoff between threads.
            task(WorkerId::CALLER, b, e);
        } else {
            set.push(pool.push(move |id| body(id, b, e)));
        }
        b = e;
    }

    set.wait(false);
}

/// Like [`parallel_for_chunked_id`], without the worker id.
pub fn parallel_for_chunked<F>(
    begin: i64,
    end: i64,
    chunksize: i64,
    task: F,
    opt: ParallelOptions<'_>,
) where
    F: Fn(i64, i64) + Send + Sync,
{
    parallel_for_chunked_id(begin, end, chunksize, |_id, b, e| task(b, e), opt);
}

/// Runs `task(i)` for every `i` in `[begin, end)`, potentially in parallel.
/// Chunking is chosen by the driver.
pub fn parallel_for<F>(begin: i64, end: i64, task: F, opt: ParallelOptions<'_>)
where
    F: Fn(i64) + Send + Sync,
{
    parallel_for_chunked_id(
        begin,
        end,
        0,
        |_id, b, e| {
            for i in b..e {
                task(i);
            }
        },
        opt,
    );
}

/// Runs `task(chunk_begin, chunk_end)` over driver-chosen sub-ranges of
/// `[begin, end)`, potentially in parallel. Use this instead of
/// [`parallel_for`] when the body can amortize per-chunk setup.
pub fn parallel_for_range<F>(begin: i64, end: i64, task: F, opt: ParallelOptions<'_>)
where
    F: Fn(i64, i64) + Send + Sync,
{
    parallel_for_chunked_id(begin, end, 0, |_id, b, e| task(b, e), opt);
}

// -----------------------------------------------------------------------------
// 2D drivers

/// Runs `task(id, xb, xe, yb, ye)` over 2D tiles of
/// `[xbegin, xend) × [ybegin, yend)`, potentially in parallel.
///
/// Chunk sizes `< 1` are chosen by the driver: the y chunk targets
/// `2 * max_threads` row bands, and the x chunk is derived so roughly
/// `max_threads` tiles are produced in total. Single-thread resolution, a
/// tile covering the whole domain, or a very busy pool all collapse to one
/// inline call over the full range. Empty domains return immediately.
pub fn parallel_for_chunked_2d_id<F>(
    xbegin: i64,
    xend: i64,
    xchunksize: i64,
    ybegin: i64,
    yend: i64,
    ychunksize: i64,
    task: F,
    mut opt: ParallelOptions<'_>,
) where
    F: Fn(WorkerId, i64, i64, i64, i64) + Send + Sync,
{
    if xbegin >= xend || ybegin >= yend {
        return;
    }

    let nesting = NestingGuard::enter();
    if nesting.depth > 1 {
        opt = opt.max_threads(1);
    }
    opt.resolve();
    let pool = opt.resolved_pool();

    if opt.single_thread()
        || (xchunksize >= xend - xbegin && ychunksize >= yend - ybegin)
        || pool.very_busy()
    {
        task(WorkerId::CALLER, xbegin, xend, ybegin, yend);
        return;
    }

    let mut ychunksize = ychunksize;
    if ychunksize < 1 {
        ychunksize = ((yend - ybegin) / (2 * opt.max_threads as i64)).max(1);
    }
    let mut xchunksize = xchunksize;
    if xchunksize < 1 {
        let ny = ((yend - ybegin) / ychunksize).max(1);
        let nx = (opt.max_threads as i64 / ny).max(1);
        xchunksize = ((xend - xbegin) / nx).max(1);
    }

    let mut set = TaskSet::new(pool);

    // SAFETY: Every tile task pushed below is recorded in `set`, and `set`
    // is waited before this function returns on every path (explicitly, or
    // via its drop guard when unwinding), so no queued tile can outlive the
    // borrowed task body.
    let body: &'static (dyn Fn(WorkerId, i64, i64, i64, i64) + Sync) =
        unsafe { mem::transmute(&task as &(dyn Fn(WorkerId, i64, i64, i64, i64) + Sync)) };

    let mut y = ybegin;
    while y < yend {
        let ye = (y + ychunksize).min(yend);
        let mut x = xbegin;
        while x < xend {
            let xe = (x + xchunksize).min(xend);
            set.push(pool.push(move |id| body(id, x, xe, y, ye)));
            x = xe;
        }
        y = ye;
    }

    set.wait(false);
}

/// Like [`parallel_for_chunked_2d_id`], without the worker id.
#[allow(clippy::too_many_arguments)]
pub fn parallel_for_chunked_2d<F>(
    xbegin: i64,
    xend: i64,
    xchunksize: i64,
    ybegin: i64,
    yend: i64,
    ychunksize: i64,
    task: F,
    opt: ParallelOptions<'_>,
) where
    F: Fn(i64, i64, i64, i64) + Send + Sync,
{
    parallel_for_chunked_2d_id(
        xbegin,
        xend,
        xchunksize,
        ybegin,
        yend,
        ychunksize,
        |_id, xb, xe, yb, ye| task(xb, xe, yb, ye),
        opt,
    );
}

/// Runs `task(x, y)` for every point of `[xbegin, xend) × [ybegin, yend)`,
/// potentially in parallel, with driver-chosen tiling.
pub fn parallel_for_2d<F>(
    xbegin: i64,
    xend: i64,
    ybegin: i64,
    yend: i64,
    task: F,
    opt: ParallelOptions<'_>,
) where
    F: Fn(i64, i64) + Send + Sync,
{
    parallel_for_chunked_2d_id(
        xbegin,
        xend,
        0,
        ybegin,
        yend,
        0,
        |_id, xb, xe, yb, ye| {
            for y in yb..ye {
                for x in xb..xe {
                    task(x, y);
                }
            }
        },
        opt,
    );
}
