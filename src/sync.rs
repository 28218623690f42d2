//! Synchronization
//!
//! Two flavours of lock are used by the kernel core:
//! - [`KSpinLock`] busy-waits and is only held across short, bounded critical sections that touch
//!   in-memory metadata.
//! - [`KSleepLock`] gives up the processor while it waits and may be held across device I/O.
//!
//! A spin lock must never be held while acquiring a sleep lock.

mod sleep_lock;

pub use sleep_lock::{KSleepLock, KSleepLockGuard};

use core::{
    cell::UnsafeCell,
    fmt,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

/// Identifies an execution context (a process or kernel thread) to the locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(pub u64);
impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

/// The hooks the blocking lock needs from the process scheduler.
pub trait Scheduler: Sync {
    /// The context currently running on this CPU.
    fn current(&self) -> ContextId;

    /// Give up the processor, returning once the scheduler runs this context again.
    fn yield_now(&self);
}

impl<S: Scheduler + ?Sized> Scheduler for &S {
    fn current(&self) -> ContextId {
        (**self).current()
    }

    fn yield_now(&self) {
        (**self).yield_now();
    }
}

/// A lock which "spins" when contended.
pub struct KSpinLock<T: ?Sized> {
    /// The lock state.
    ///
    /// `false` means the lock is not held, and `true` means the lock is held.
    flag: AtomicBool,
    /// The value stored in the lock.
    value: UnsafeCell<T>,
}
impl<T> KSpinLock<T> {
    /// Construct a [`KSpinLock`] to wrap the given value.
    pub const fn new(value: T) -> Self {
        Self {
            flag: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    /// Destruct the mutex and return the inner value.
    ///
    /// This function does not have to lock because consuming the value means it cannot be in use
    /// anywhere else.
    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: ?Sized> KSpinLock<T> {
    /// Lock the mutex, returning an RAII guard.
    ///
    /// If the mutex is already locked, then this method busy-waits until the holder releases it.
    /// It never gives up the processor, so the holder must not block while holding it.
    pub fn lock(&self) -> KSpinLockGuard<'_, T> {
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            while self.flag.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
    }

    /// Attempt to lock the mutex without waiting.
    pub fn try_lock(&self) -> Option<KSpinLockGuard<'_, T>> {
        self.flag
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| KSpinLockGuard {
                // SAFETY:
                // We've locked `flag`, so we have exclusive access.
                data: unsafe { &mut *self.value.get() },
                flag: &self.flag,
            })
    }

    /// Get an exclusive reference to the inner value from an exclusive reference to the outer
    /// value.
    ///
    /// This function does not have to lock because the exclusive reference to the value means it
    /// cannot be in use anywhere else.
    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }
}
impl<T: Default> Default for KSpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

// UnsafeCell implements `Send` as appropriate, so we only need `Sync`.

// SAFETY:
// Sharing the mutex between threads corresponds to sending the value to whichever thread locks
// the mutex.
unsafe impl<T: ?Sized + Send> Sync for KSpinLock<T> {}

/// An RAII guard for a [`KSpinLock`].
///
/// This value is constructed by calling [`KSpinLock::lock`] and related methods.
pub struct KSpinLockGuard<'a, T: ?Sized> {
    data: &'a mut T,
    flag: &'a AtomicBool,
}
impl<T: ?Sized> Deref for KSpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        self.data
    }
}
impl<T: ?Sized> DerefMut for KSpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.data
    }
}
impl<T: ?Sized> Drop for KSpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}
