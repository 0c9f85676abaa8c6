//! Kernel locks.
//!
//! Two families: the yielding [`Mutex`]/[`RwLock`] for anything that may be
//! held across an allocation or a long walk (a contended acquire offers the
//! CPU back to the scheduler), and the pure-spinning [`SpinLock`] for the
//! paths that must never re-enter the scheduler — its own queues, and
//! everything an interrupt handler touches.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use lock_api::{GuardSend, RawMutex, RawRwLock};

/// pause iterations a contended acquire burns before yielding
const SPIN_AMOUNT: u32 = 10_000;

#[inline(always)]
fn contended_spin(spin_count: &mut u32) {
    core::hint::spin_loop();
    *spin_count += 1;
    if *spin_count > SPIN_AMOUNT {
        crate::scheduler::yield_now();
        *spin_count = 0;
    }
}

pub struct YieldingRawMutex(AtomicBool);

unsafe impl RawMutex for YieldingRawMutex {
    const INIT: Self = Self(AtomicBool::new(false));
    type GuardMarker = GuardSend;

    fn lock(&self) {
        let mut spin_count = 0;
        while !self.try_lock() {
            contended_spin(&mut spin_count);
        }
    }

    #[inline(always)]
    fn try_lock(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[inline(always)]
    fn is_locked(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    unsafe fn unlock(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Reader-writer state: a plain reader count, with [`WRITER`] as the
/// exclusive sentinel
pub struct YieldingRawRwLock(AtomicU32);

const WRITER: u32 = u32::MAX;

unsafe impl RawRwLock for YieldingRawRwLock {
    const INIT: Self = Self(AtomicU32::new(0));
    type GuardMarker = GuardSend;

    fn lock_shared(&self) {
        let mut spin_count = 0;
        while !self.try_lock_shared() {
            contended_spin(&mut spin_count);
        }
    }

    fn lock_exclusive(&self) {
        let mut spin_count = 0;
        while !self.try_lock_exclusive() {
            contended_spin(&mut spin_count);
        }
    }

    fn try_lock_shared(&self) -> bool {
        let mut readers = self.0.load(Ordering::Relaxed);
        loop {
            // a writer holds it, or the count would collide with the sentinel
            if readers >= WRITER - 1 {
                return false;
            }

            match self.0.compare_exchange_weak(
                readers,
                readers + 1,
                Ordering::Acquire, // Sync when acquired
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => readers = observed,
            }
        }
    }

    fn try_lock_exclusive(&self) -> bool {
        self.0
            .compare_exchange(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn is_locked(&self) -> bool {
        self.0.load(Ordering::Relaxed) != 0
    }

    fn is_locked_exclusive(&self) -> bool {
        self.0.load(Ordering::Relaxed) == WRITER
    }

    unsafe fn unlock_shared(&self) {
        self.0.fetch_sub(1, Ordering::Release);
    }

    unsafe fn unlock_exclusive(&self) {
        self.0.store(0, Ordering::Release);
    }
}

pub type Mutex<T> = lock_api::Mutex<YieldingRawMutex, T>;
pub type MutexGuard<'a, T> = lock_api::MutexGuard<'a, YieldingRawMutex, T>;

pub type RwLock<T> = lock_api::RwLock<YieldingRawRwLock, T>;
pub type RwLockReadGuard<'a, T> = lock_api::RwLockReadGuard<'a, YieldingRawRwLock, T>;
pub type RwLockWriteGuard<'a, T> = lock_api::RwLockWriteGuard<'a, YieldingRawRwLock, T>;

/// Never yields. The scheduler's queues and anything an interrupt handler
/// takes live behind these.
pub type SpinLock<T> = spin::Mutex<T>;
pub type SpinLockGuard<'a, T> = spin::MutexGuard<'a, T>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn rwlock_reader_writer_exclusion() {
        let lock: RwLock<u32> = RwLock::new(7);

        {
            let a = lock.read();
            let b = lock.read();
            assert_eq!(*a + *b, 14);
            // readers block writers...
            assert!(lock.try_write().is_none());
        }

        {
            let mut w = lock.write();
            *w += 1;
            // ...and a writer blocks everyone
            assert!(lock.try_read().is_none());
        }

        assert_eq!(*lock.read(), 8);
    }

    #[test_case]
    fn mutex_try_lock_reports_contention() {
        let lock: Mutex<()> = Mutex::new(());
        let held = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(held);
        assert!(lock.try_lock().is_some());
    }
}
