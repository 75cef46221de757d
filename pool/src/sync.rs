//! A mutex whose state can be re-initialized in a forked child.
//!
//! `std::sync::Mutex` gives no way to observe or overwrite the lock word. After
//! `fork()` the child inherits the lock word verbatim, including a "held" state
//! owned by a thread that was not duplicated. `ForkMutex` keeps the lock word
//! in a single atomic so the child can put it back to unlocked.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicI32, Ordering};

const UNLOCKED: i32 = 0;
const LOCKED: i32 = 1;
const CONTENDED: i32 = 2;

/// Futex based lock word (spin/yield off Linux).
pub struct RawLock {
    state: AtomicI32,
}

impl RawLock {
    pub const fn new() -> Self {
        RawLock {
            state: AtomicI32::new(UNLOCKED),
        }
    }

    #[inline]
    pub fn lock(&self) {
        if self
            .state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
        self.lock_slow();
    }

    #[cold]
    fn lock_slow(&self) {
        loop {
            if self.state.swap(CONTENDED, Ordering::Acquire) == UNLOCKED {
                return;
            }
            #[cfg(target_os = "linux")]
            unsafe {
                libc::syscall(
                    libc::SYS_futex,
                    &self.state as *const AtomicI32,
                    libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                    CONTENDED,
                    std::ptr::null::<libc::timespec>(),
                );
            }
            #[cfg(not(target_os = "linux"))]
            std::thread::yield_now();
        }
    }

    #[inline]
    pub fn try_lock(&self) -> bool {
        self.state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// # Safety
    /// The caller must hold the lock, either through a successful `lock` or
    /// `try_lock` on this thread.
    #[inline]
    pub unsafe fn unlock(&self) {
        if self.state.swap(UNLOCKED, Ordering::Release) == CONTENDED {
            self.wake_one();
        }
    }

    #[cold]
    fn wake_one(&self) {
        #[cfg(target_os = "linux")]
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                &self.state as *const AtomicI32,
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                1i32,
            );
        }
    }

    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) != UNLOCKED
    }

    /// Forget whoever held the lock and any waiters.
    ///
    /// # Safety
    /// Only valid when no other thread can be inside the critical section or
    /// waiting on it, i.e. in a freshly forked child before it spawns threads.
    pub unsafe fn reset(&self) {
        self.state.store(UNLOCKED, Ordering::Release);
    }
}

impl Default for RawLock {
    fn default() -> Self {
        RawLock::new()
    }
}

/// A mutex around `T` built on [`RawLock`].
pub struct ForkMutex<T> {
    raw: RawLock,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for ForkMutex<T> {}
unsafe impl<T: Send> Sync for ForkMutex<T> {}

impl<T> ForkMutex<T> {
    pub const fn new(data: T) -> Self {
        ForkMutex {
            raw: RawLock::new(),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> ForkMutexGuard<'_, T> {
        self.raw.lock();
        ForkMutexGuard { mutex: self }
    }

    pub fn try_lock(&self) -> Option<ForkMutexGuard<'_, T>> {
        if self.raw.try_lock() {
            Some(ForkMutexGuard { mutex: self })
        } else {
            None
        }
    }

    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }

    /// The lock word, for holding the lock across a fork without a guard.
    pub fn raw(&self) -> &RawLock {
        &self.raw
    }

    /// Pointer to the protected data. Dereferencing it is only sound while the
    /// lock is held through [`ForkMutex::raw`].
    pub fn data_ptr(&self) -> *mut T {
        self.data.get()
    }
}

pub struct ForkMutexGuard<'a, T> {
    mutex: &'a ForkMutex<T>,
}

impl<T> Deref for ForkMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for ForkMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for ForkMutexGuard<'_, T> {
    fn drop(&mut self) {
        unsafe { self.mutex.raw.unlock() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn try_lock_fails_while_held() {
        let m = ForkMutex::new(0u32);
        let guard = m.lock();
        assert!(m.is_locked());
        assert!(m.try_lock().is_none());
        drop(guard);
        assert!(!m.is_locked());
        assert!(m.try_lock().is_some());
    }

    #[test]
    fn reset_forgets_holder() {
        let m = ForkMutex::new(Vec::<u8>::new());
        m.raw().lock();
        assert!(m.is_locked());
        unsafe { m.raw().reset() };
        let mut guard = m.try_lock().expect("reset lock should be free");
        guard.push(1);
        drop(guard);
        assert_eq!(*m.lock(), vec![1]);
    }

    #[test]
    fn contended_increments_are_not_lost() {
        const THREADS: usize = 8;
        const ITERATIONS: usize = 10_000;

        let m = Arc::new(ForkMutex::new(0usize));
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let m = Arc::clone(&m);
                thread::spawn(move || {
                    for _ in 0..ITERATIONS {
                        *m.lock() += 1;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().expect("thread panicked");
        }
        assert_eq!(*m.lock(), THREADS * ITERATIONS);
    }
}
