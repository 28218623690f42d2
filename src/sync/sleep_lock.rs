//! A lock which gives up the processor when contended.
//!
//! See [`KSleepLock`].

use core::{
    cell::UnsafeCell,
    marker::PhantomData,
    ops::{Deref, DerefMut},
};

use super::{ContextId, KSpinLock, Scheduler};

/// A lock whose waiters yield to the scheduler instead of spinning.
///
/// Unlike [`KSpinLock`], this lock may be held across long operations such as device I/O. It
/// remembers which context holds it, so callers can check [`Self::holding`] before touching data
/// that requires the lock.
pub struct KSleepLock<T: ?Sized> {
    /// The context holding the lock, if any.
    ///
    /// The spin lock only protects this field and is never held while waiting.
    holder: KSpinLock<Option<ContextId>>,
    /// The value stored in the lock.
    value: UnsafeCell<T>,
}
impl<T> KSleepLock<T> {
    /// Construct a [`KSleepLock`] to wrap the given value.
    pub const fn new(value: T) -> Self {
        Self {
            holder: KSpinLock::new(None),
            value: UnsafeCell::new(value),
        }
    }

    /// Destruct the lock and return the inner value.
    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: ?Sized> KSleepLock<T> {
    /// Lock on behalf of the scheduler's current context, returning an RAII guard.
    ///
    /// While another context holds the lock, this yields the processor and tries again once
    /// rescheduled. There is no timeout.
    pub fn lock<S: Scheduler + ?Sized>(&self, scheduler: &S) -> KSleepLockGuard<'_, T> {
        let me = scheduler.current();
        loop {
            if let Some(guard) = self.try_lock_as(me) {
                return guard;
            }
            scheduler.yield_now();
        }
    }

    /// Attempt to lock on behalf of the scheduler's current context without waiting.
    pub fn try_lock<S: Scheduler + ?Sized>(
        &self,
        scheduler: &S,
    ) -> Option<KSleepLockGuard<'_, T>> {
        self.try_lock_as(scheduler.current())
    }

    /// Get whether `ctx` currently holds this lock.
    pub fn holding(&self, ctx: ContextId) -> bool {
        *self.holder.lock() == Some(ctx)
    }

    /// Get whether anyone currently holds this lock.
    pub fn is_locked(&self) -> bool {
        self.holder.lock().is_some()
    }

    /// Get an exclusive reference to the inner value without locking.
    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    fn try_lock_as(&self, ctx: ContextId) -> Option<KSleepLockGuard<'_, T>> {
        let mut holder = self.holder.lock();
        if holder.is_some() {
            return None;
        }
        *holder = Some(ctx);
        drop(holder);
        Some(KSleepLockGuard {
            // SAFETY:
            // We recorded ourselves as the holder, so nobody else can get here until the guard
            // clears it again.
            data: unsafe { &mut *self.value.get() },
            holder: &self.holder,
            _not_send: PhantomData,
        })
    }
}
impl<T: Default> Default for KSleepLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

// SAFETY:
// Sharing the lock between threads corresponds to sending the value to whichever context locks
// it.
unsafe impl<T: ?Sized + Send> Sync for KSleepLock<T> {}

/// An RAII guard for a [`KSleepLock`].
///
/// The guard belongs to the context that locked it, so it cannot be sent to another thread.
pub struct KSleepLockGuard<'a, T: ?Sized> {
    data: &'a mut T,
    holder: &'a KSpinLock<Option<ContextId>>,
    _not_send: PhantomData<*const ()>,
}
impl<T: ?Sized> Deref for KSleepLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        self.data
    }
}
impl<T: ?Sized> DerefMut for KSleepLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.data
    }
}
impl<T: ?Sized> Drop for KSleepLockGuard<'_, T> {
    fn drop(&mut self) {
        *self.holder.lock() = None;
    }
}
