//! Integration tests for the pool, task sets, and the parallel-for drivers.

use std::env;
use std::panic::AssertUnwindSafe;
use std::panic::catch_unwind;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use tracing::Level;
use tracing_subscriber::fmt::Subscriber;
use tutti::ParallelOptions;
use tutti::Strategy;
use tutti::TaskError;
use tutti::TaskSet;
use tutti::ThreadPool;
use tutti::default_pool;
use tutti::parallel_for;
use tutti::parallel_for_2d;
use tutti::parallel_for_chunked;
use tutti::parallel_for_chunked_2d_id;
use tutti::parallel_for_chunked_id;
use tutti::parallel_for_range;
use tutti::shutdown_default_pool;

// -----------------------------------------------------------------------------
// Task conservation

/// The headline scenario: 1000 counting tasks through one TaskSet on a pool
/// of four, waited without blocking. Every slot must be claimed exactly once.
#[test]
fn task_conservation() {
    let pool = ThreadPool::new(4);
    let slots: Arc<Vec<AtomicU32>> = Arc::new((0..1000).map(|_| AtomicU32::new(0)).collect());

    let mut set = TaskSet::new(&pool);
    for i in 0..1000 {
        let slots = slots.clone();
        set.push(pool.push(move |_| {
            slots[i].fetch_add(1, Ordering::SeqCst);
        }));
    }
    set.wait(false);

    for slot in slots.iter() {
        assert_eq!(slot.load(Ordering::SeqCst), 1);
    }
}

/// Dropping a pool implies `stop(true)`: everything queued before the drop
/// runs to completion.
#[test]
fn drop_drains_the_queue() {
    let ran = Arc::new(AtomicUsize::new(0));
    {
        let pool = ThreadPool::new(2);
        for _ in 0..50 {
            let ran = ran.clone();
            drop(pool.push(move |_| {
                ran.fetch_add(1, Ordering::SeqCst);
            }));
        }
    }
    assert_eq!(ran.load(Ordering::SeqCst), 50);
}

// -----------------------------------------------------------------------------
// Stop semantics

/// `stop(false)` discards queued-but-unstarted tasks; they never run and
/// their handles resolve to `Discarded`. Both workers are parked in gate
/// tasks while the backlog builds, so none of it can start early.
#[test]
fn stop_discards_unstarted_tasks() {
    let pool = Arc::new(ThreadPool::new(2));
    let started = Arc::new(AtomicUsize::new(0));
    let release = Arc::new(AtomicBool::new(false));

    let mut gates = Vec::new();
    for _ in 0..2 {
        let started = started.clone();
        let release = release.clone();
        gates.push(pool.push(move |_| {
            started.fetch_add(1, Ordering::SeqCst);
            while !release.load(Ordering::SeqCst) {
                thread::yield_now();
            }
        }));
    }
    while started.load(Ordering::SeqCst) < 2 {
        thread::yield_now();
    }

    let ran = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for _ in 0..100 {
        let ran = ran.clone();
        handles.push(pool.push(move |_| {
            ran.fetch_add(1, Ordering::SeqCst);
        }));
    }

    // `stop` clears the backlog before joining; release the gates once the
    // queue is empty so the join can complete.
    let unblocker = {
        let pool = pool.clone();
        let release = release.clone();
        thread::spawn(move || {
            while pool.jobs_in_queue() > 0 {
                thread::yield_now();
            }
            release.store(true, Ordering::SeqCst);
        })
    };

    pool.stop(false);
    unblocker.join().unwrap();

    assert_eq!(ran.load(Ordering::SeqCst), 0);
    for handle in handles {
        assert!(matches!(handle.join(), Err(TaskError::Discarded)));
    }
    for gate in gates {
        assert!(gate.join().is_ok());
    }
}

/// `stop(true)` lets the queue drain: every previously queued task runs
/// exactly once before the call returns.
#[test]
fn stop_waits_for_the_queue() {
    let pool = ThreadPool::new(2);
    let ran = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for _ in 0..200 {
        let ran = ran.clone();
        handles.push(pool.push(move |_| {
            ran.fetch_add(1, Ordering::SeqCst);
        }));
    }
    pool.stop(true);
    assert_eq!(ran.load(Ordering::SeqCst), 200);
    for handle in handles {
        assert!(handle.join().is_ok());
    }
}

// -----------------------------------------------------------------------------
// Resizing

/// Tasks pushed around a resize to zero and back are neither lost nor
/// duplicated. While the pool is empty, progress comes from the waiter's
/// work-stealing loop.
#[test]
fn resize_roundtrip_conserves_tasks() {
    let pool = ThreadPool::new(4);
    let slots: Arc<Vec<AtomicU32>> = Arc::new((0..600).map(|_| AtomicU32::new(0)).collect());

    let mut set = TaskSet::new(&pool);
    for i in 0..300 {
        let slots = slots.clone();
        set.push(pool.push(move |_| {
            slots[i].fetch_add(1, Ordering::SeqCst);
        }));
    }

    pool.resize(0);
    assert_eq!(pool.size(), 0);

    for i in 300..600 {
        let slots = slots.clone();
        set.push(pool.push(move |_| {
            slots[i].fetch_add(1, Ordering::SeqCst);
        }));
    }

    pool.resize(4);
    assert_eq!(pool.size(), 4);
    set.wait(false);

    for slot in slots.iter() {
        assert_eq!(slot.load(Ordering::SeqCst), 1);
    }
}

/// A pool with zero workers still makes progress through stolen tasks, which
/// run with the caller id.
#[test]
fn zero_worker_pool_runs_via_stealing() {
    let pool = Arc::new(ThreadPool::new(1));
    pool.resize(0);

    let registered = {
        let pool = pool.clone();
        pool.clone()
            .push(move |id| (id.is_pool_worker(), pool.is_worker(thread::current().id())))
    };
    assert!(pool.run_one_task());
    assert!(!pool.run_one_task());

    let (pool_worker, registered_during_task) = registered.join().unwrap();
    assert!(!pool_worker);
    assert!(registered_during_task);
    assert!(!pool.is_worker(thread::current().id()));
}

// -----------------------------------------------------------------------------
// Introspection

#[test]
fn introspection() {
    let pool = ThreadPool::new(3);
    assert_eq!(pool.size(), 3);
    while pool.idle() < 3 {
        thread::yield_now();
    }
    assert_eq!(pool.jobs_in_queue(), 0);
    assert!(!pool.very_busy());

    let worker = pool.push(|id| id.is_pool_worker());
    assert!(worker.join().unwrap());

    pool.resize(0);
    let mut handles = Vec::new();
    for _ in 0..13 {
        handles.push(pool.push(|_| ()));
    }
    assert_eq!(pool.jobs_in_queue(), 13);
    assert!(pool.very_busy());
    while pool.run_one_task() {}
    for handle in handles {
        assert!(handle.join().is_ok());
    }
}

/// A full spawn/resize/stop cycle run under a test subscriber, so the
/// lifecycle events emitted at spawn, resize, and stop are captured into the
/// test output rather than dropped.
#[test]
fn lifecycle_under_a_subscriber() {
    let subscriber = Subscriber::builder()
        .with_max_level(Level::TRACE)
        .with_test_writer()
        .without_time()
        .finish();

    tracing::subscriber::with_default(subscriber, || {
        let pool = ThreadPool::new(2);
        let handle = pool.push(|_| 42);
        assert_eq!(handle.join().unwrap(), 42);
        pool.resize(1);
        assert_eq!(pool.size(), 1);
        pool.stop(true);
        assert_eq!(pool.size(), 0);
    });
}

#[test]
fn thread_count_env_override() {
    // SAFETY: This test is the only one touching these variables, and every
    // other test constructs its pools with explicit sizes.
    unsafe { env::set_var("TUTTI_THREADS", "3") };
    let pool = ThreadPool::new(0);
    // One core is left for the submitting thread.
    assert_eq!(pool.size(), 2);

    // SAFETY: As above.
    unsafe {
        env::remove_var("TUTTI_THREADS");
        env::set_var("CUE_THREADS", "5");
    }
    let pool = ThreadPool::new(-1);
    assert_eq!(pool.size(), 4);

    // SAFETY: As above.
    unsafe { env::remove_var("CUE_THREADS") };
}

// -----------------------------------------------------------------------------
// Panic handling

/// A panicking task resolves its handle instead of killing the worker; the
/// pool keeps running.
#[test]
fn panic_is_captured_into_the_handle() {
    let pool = ThreadPool::new(1);
    let failing = pool.push(|_| panic!("boom"));
    assert!(matches!(failing.join(), Err(TaskError::Panicked(_))));

    let ok = pool.push(|_| 7);
    assert_eq!(ok.join().unwrap(), 7);
}

/// A panic inside a parallel-for body resurfaces on the submitting thread
/// once all chunks have completed.
#[test]
fn parallel_for_propagates_panics() {
    let pool = ThreadPool::new(2);
    let result = catch_unwind(AssertUnwindSafe(|| {
        parallel_for(
            0,
            1000,
            |i| {
                if i == 433 {
                    panic!("chunk failure");
                }
            },
            ParallelOptions::new().pool(&pool).min_items(1),
        );
    }));
    assert!(result.is_err());
}

// -----------------------------------------------------------------------------
// Task sets

#[test]
fn wait_for_single_task() {
    let pool = ThreadPool::new(2);
    let mut set = TaskSet::new(&pool);
    set.push(pool.push(|_| ()));
    set.push(pool.push(|_| thread::sleep(Duration::from_millis(10))));

    set.wait_for_task(0, false);
    // Out of range is a no-op.
    set.wait_for_task(5, false);
    set.wait(true);
    assert!(set.is_empty());
}

// -----------------------------------------------------------------------------
// Nested parallelism

/// A task body calling `parallel_for` on its own pool must not block on
/// itself; the nested loop runs serially on the same worker.
#[test]
fn no_self_deadlock_from_workers() {
    let pool = Arc::new(ThreadPool::new(2));
    let total = Arc::new(AtomicI64::new(0));

    let handle = {
        let pool = pool.clone();
        let total = total.clone();
        pool.clone().push(move |_| {
            parallel_for(
                0,
                100,
                |i| {
                    total.fetch_add(i, Ordering::SeqCst);
                },
                ParallelOptions::new().pool(&pool).min_items(1),
            );
        })
    };

    assert!(handle.join().is_ok());
    assert_eq!(total.load(Ordering::SeqCst), 4950);
}

/// Nesting on the submitting thread itself (an outer body starting an inner
/// loop) serializes the inner loop and stays correct.
#[test]
fn nested_parallel_for_completes() {
    let pool = ThreadPool::new(2);
    let cells: Vec<AtomicU32> = (0..100).map(|_| AtomicU32::new(0)).collect();

    parallel_for(
        0,
        10,
        |y| {
            parallel_for(
                0,
                10,
                |x| {
                    cells[(y * 10 + x) as usize].fetch_add(1, Ordering::SeqCst);
                },
                ParallelOptions::new().pool(&pool).min_items(1),
            );
        },
        ParallelOptions::new().pool(&pool).min_items(1),
    );

    for cell in &cells {
        assert_eq!(cell.load(Ordering::SeqCst), 1);
    }
}

// -----------------------------------------------------------------------------
// Reductions

/// Per-chunk partial sums reduced afterward match the serial result, across
/// range lengths and pool sizes (including a pool with no workers).
#[test]
fn reduction_matches_serial() {
    for &size in &[0isize, 1, 4] {
        let pool = ThreadPool::new(1);
        pool.resize(size);
        for &k in &[0i64, 1, 7, 100, 10_000] {
            let total = AtomicI64::new(0);
            parallel_for_range(
                0,
                k,
                |b, e| {
                    let mut partial = 0;
                    for i in b..e {
                        partial += i;
                    }
                    total.fetch_add(partial, Ordering::SeqCst);
                },
                ParallelOptions::new().pool(&pool).min_items(1),
            );
            assert_eq!(total.into_inner(), k * (k - 1) / 2, "k = {k}, size = {size}");
        }
    }
}

#[test]
fn alternate_strategy_behaves_like_default() {
    let pool = ThreadPool::new(2);
    let total = AtomicI64::new(0);
    parallel_for(
        0,
        1000,
        |i| {
            total.fetch_add(i, Ordering::SeqCst);
        },
        ParallelOptions::new()
            .pool(&pool)
            .min_items(1)
            .strategy(Strategy::TryAlternateBackend),
    );
    assert_eq!(total.into_inner(), 499_500);
}

// -----------------------------------------------------------------------------
// Chunk coverage

fn assert_tiles_exactly(begin: i64, end: i64, chunksize: i64, pool: &ThreadPool) {
    let ranges = Mutex::new(Vec::new());
    parallel_for_chunked_id(
        begin,
        end,
        chunksize,
        |_id, b, e| {
            ranges.lock().unwrap().push((b, e));
        },
        ParallelOptions::new().pool(pool).min_items(1),
    );

    let mut ranges = ranges.into_inner().unwrap();
    ranges.sort_unstable();
    let mut cursor = begin;
    for (b, e) in ranges {
        assert_eq!(b, cursor, "gap or overlap at {b} (chunksize {chunksize})");
        assert!(e > b);
        cursor = e;
    }
    assert_eq!(cursor, end);
}

/// The chunk sub-ranges tile `[begin, end)` exactly: chunksize one, the full
/// range, values that don't divide the range, and the driver-chosen default.
#[test]
fn chunk_ranges_tile_exactly() {
    let pool = ThreadPool::new(4);
    for &chunksize in &[1, 13, 50, 127, 0] {
        assert_tiles_exactly(10, 137, chunksize, &pool);
    }

    // An explicit chunksize is honored even single-threaded.
    let serial = ThreadPool::new(1);
    serial.resize(0);
    let ranges = Mutex::new(Vec::new());
    parallel_for_chunked(
        0,
        35,
        10,
        |b, e| {
            ranges.lock().unwrap().push((b, e));
        },
        ParallelOptions::new().pool(&serial),
    );
    assert_eq!(
        ranges.into_inner().unwrap(),
        vec![(0, 10), (10, 20), (20, 30), (30, 35)]
    );
}

/// Empty ranges produce zero tasks and never touch the pool.
#[test]
fn empty_ranges_are_a_no_op() {
    let pool = ThreadPool::new(1);
    pool.resize(0);
    let called = AtomicUsize::new(0);
    let opt = ParallelOptions::new().pool(&pool);

    parallel_for(
        5,
        5,
        |_| {
            called.fetch_add(1, Ordering::SeqCst);
        },
        opt,
    );
    parallel_for_chunked_id(
        3,
        -2,
        7,
        |_, _, _| {
            called.fetch_add(1, Ordering::SeqCst);
        },
        opt,
    );
    parallel_for_chunked_2d_id(
        0,
        10,
        0,
        4,
        4,
        0,
        |_, _, _, _, _| {
            called.fetch_add(1, Ordering::SeqCst);
        },
        opt,
    );

    assert_eq!(called.into_inner(), 0);
    assert_eq!(pool.jobs_in_queue(), 0);
}

// -----------------------------------------------------------------------------
// 2D coverage

fn assert_tiles_cover_grid(xchunksize: i64, ychunksize: i64, pool: &ThreadPool) {
    const W: i64 = 37;
    const H: i64 = 23;
    let grid: Vec<AtomicU32> = (0..W * H).map(|_| AtomicU32::new(0)).collect();

    parallel_for_chunked_2d_id(
        0,
        W,
        xchunksize,
        0,
        H,
        ychunksize,
        |_id, xb, xe, yb, ye| {
            for y in yb..ye {
                for x in xb..xe {
                    grid[(y * W + x) as usize].fetch_add(1, Ordering::SeqCst);
                }
            }
        },
        ParallelOptions::new().pool(pool).min_items(1),
    );

    for cell in &grid {
        assert_eq!(cell.load(Ordering::SeqCst), 1);
    }
}

/// 2D tiles cover the domain exactly once, for explicit, oversized (inline
/// whole-range path), and driver-chosen chunk sizes.
#[test]
fn chunked_2d_tiles_cover_the_grid() {
    let pool = ThreadPool::new(4);
    for &(xcs, ycs) in &[(10, 7), (64, 64), (0, 0)] {
        assert_tiles_cover_grid(xcs, ycs, &pool);
    }
}

#[test]
fn elementwise_2d_visits_every_point() {
    let pool = ThreadPool::new(2);
    let grid: Vec<AtomicU32> = (0..16 * 9).map(|_| AtomicU32::new(0)).collect();
    parallel_for_2d(
        0,
        16,
        0,
        9,
        |x, y| {
            grid[(y * 16 + x) as usize].fetch_add(1, Ordering::SeqCst);
        },
        ParallelOptions::new().pool(&pool).min_items(1),
    );
    for cell in &grid {
        assert_eq!(cell.load(Ordering::SeqCst), 1);
    }
}

// -----------------------------------------------------------------------------
// Default pool

#[test]
fn default_pool_lifecycle() {
    let pool = default_pool();
    assert!(pool.size() >= 1);
    let handle = pool.push(|_| 1 + 1);
    assert_eq!(handle.join().unwrap(), 2);

    shutdown_default_pool();
    assert_eq!(default_pool().size(), 0);

    // Parallel calls still complete, now single-threaded.
    let total = AtomicI64::new(0);
    parallel_for(
        0,
        10,
        |i| {
            total.fetch_add(i, Ordering::SeqCst);
        },
        ParallelOptions::new(),
    );
    assert_eq!(total.into_inner(), 45);

    // Shutting down twice is fine.
    shutdown_default_pool();
}
