//! Small synchronization primitives shared by the queue and the worker
//! registry. Both sit on hot paths (every push, pop and `is_worker` check
//! goes through them), so they use a spin lock rather than a full mutex.

use core::cell::UnsafeCell;
use core::hint;
use core::ops::Deref;
use core::ops::DerefMut;
use core::sync::atomic::AtomicBool;
use core::sync::atomic::Ordering;

// -----------------------------------------------------------------------------
// Spin lock

/// A minimal test-and-test-and-set spin lock. Critical sections guarded by
/// this lock must be short and must never block, park, or re-enter the lock.
pub struct SpinMutex<T> {
    locked: AtomicBool,
    value: UnsafeCell<T>,
}

// SAFETY: The lock hands out access to the inner value to one thread at a
// time, so it is enough for the value to be `Send`.
unsafe impl<T: Send> Sync for SpinMutex<T> {}

// SAFETY: Sending the lock sends the value with it.
unsafe impl<T: Send> Send for SpinMutex<T> {}

impl<T> SpinMutex<T> {
    /// Creates a new unlocked spin lock wrapping `value`.
    pub const fn new(value: T) -> SpinMutex<T> {
        SpinMutex {
            locked: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock, spinning until it is available.
    #[inline]
    pub fn lock(&self) -> SpinGuard<'_, T> {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            // Spin on a plain load to keep the cache line shared while the
            // holder works.
            while self.locked.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        }
        SpinGuard { lock: self }
    }
}

/// RAII guard produced by [`SpinMutex::lock`]; releases the lock on drop.
pub struct SpinGuard<'a, T> {
    lock: &'a SpinMutex<T>,
}

impl<T> Deref for SpinGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // SAFETY: Holding the guard means the lock is held, so no other
        // thread can touch the value.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SpinGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: Holding the guard means the lock is held, so no other
        // thread can touch the value.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for SpinGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

// -----------------------------------------------------------------------------
// Busy-wait pause

/// Issues a handful of pause hints. Used by polling waits to burn a few
/// cycles between status checks without giving up the time slice.
#[inline]
pub fn pause(spins: u32) {
    for _ in 0..spins {
        hint::spin_loop();
    }
}
