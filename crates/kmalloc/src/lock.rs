use core::{
    cell::UnsafeCell,
    fmt,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicU32, Ordering},
};

use crate::error::{LockHeldSnafu, MallocError};

/// Non-reentrant lock around the allocator state.
///
/// The lock never waits. Interrupts are disabled around every entry point,
/// so finding the lock taken means re-entry or a lost unlock, and
/// [`try_lock`](Self::try_lock) reports that as an error.
pub(crate) struct MallocLock<T> {
    state: AtomicU32,
    data: UnsafeCell<T>,
}

unsafe impl<T> Sync for MallocLock<T> where T: Send {}

impl<T> MallocLock<T> {
    pub(crate) const fn new(data: T) -> Self {
        Self {
            state: AtomicU32::new(0),
            data: UnsafeCell::new(data),
        }
    }

    #[track_caller]
    pub(crate) fn try_lock(
        &self,
        operation: &'static str,
    ) -> Result<MallocLockGuard<'_, T>, MallocError> {
        let state = self.state.fetch_add(1, Ordering::Acquire);
        if state != 0 {
            self.state.fetch_sub(1, Ordering::Release);
            return LockHeldSnafu { operation, state }.fail();
        }
        Ok(MallocLockGuard { lock: self })
    }
}

pub(crate) struct MallocLockGuard<'a, T> {
    lock: &'a MallocLock<T>,
}

impl<T> fmt::Debug for MallocLockGuard<'_, T>
where
    T: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MallocLockGuard").field(&**self).finish()
    }
}

impl<T> Drop for MallocLockGuard<'_, T> {
    fn drop(&mut self) {
        let state = self.lock.state.fetch_sub(1, Ordering::Release);
        assert_eq!(state, 1, "malloc lock released in state {state}");
    }
}

impl<T> Deref for MallocLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for MallocLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.data.get() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_and_unlock() {
        let lock = MallocLock::new(0_u32);
        {
            let mut guard = lock.try_lock("test").unwrap();
            *guard += 5;
        }
        assert_eq!(*lock.try_lock("test").unwrap(), 5);
    }

    #[test]
    fn test_reentry_is_rejected() {
        let lock = MallocLock::new(());
        let _guard = lock.try_lock("outer").unwrap();
        let err = lock.try_lock("inner").unwrap_err();
        assert!(matches!(
            err,
            MallocError::LockHeld {
                operation: "inner",
                state: 1,
                ..
            }
        ));
    }

    #[test]
    fn test_rejected_entry_leaves_state_intact() {
        let lock = MallocLock::new(());
        let guard = lock.try_lock("outer").unwrap();
        let _ = lock.try_lock("inner").unwrap_err();
        drop(guard);
        assert!(lock.try_lock("again").is_ok());
    }

    #[test]
    #[should_panic(expected = "malloc lock released in state 2")]
    fn test_corrupted_state_detected_on_release() {
        let lock = MallocLock::new(());
        let guard = lock.try_lock("test").unwrap();
        lock.state.fetch_add(1, Ordering::Relaxed);
        drop(guard);
    }
}
