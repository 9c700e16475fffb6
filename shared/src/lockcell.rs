//! Spin based lock cells usable without an operating system

use core::{
    cell::UnsafeCell,
    fmt::Display,
    hint::spin_loop,
    marker::PhantomData,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

#[doc(hidden)]
pub trait LockCellInternal<T> {
    /// Returns a reference to the data behind the mutex
    ///
    /// # Safety:
    ///
    /// this thread needs to hold the lock
    unsafe fn get(&self) -> &T;
    /// Returns a mutable reference to the data behind the mutex
    ///
    /// # Safety:
    ///
    /// this thread needs to hold the lock
    #[allow(clippy::mut_from_ref)]
    unsafe fn get_mut(&self) -> &mut T;

    /// unlocks the mutex
    ///
    /// # Safety:
    ///
    /// this should only be called when the [LockCellGuard] corresponding to this
    /// LockCell is droped.
    unsafe fn unlock<'s, 'l: 's>(&'s self, guard: &mut LockCellGuard<'l, T, Self>);
}

/// Guard giving access to the data of a [LockCell].
///
/// The lock is released when this is dropped.
#[derive(Debug)]
pub struct LockCellGuard<'l, T, M: ?Sized + LockCellInternal<T>> {
    mutex: &'l M,
    _t: PhantomData<T>,
    // guards must be released on the thread that acquired them
    _not_send: PhantomData<*const ()>,
}

impl<T, M: ?Sized + LockCellInternal<T>> Deref for LockCellGuard<'_, T, M> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // Safety: There can always be only 1 guard for a given mutex so this is safe
        unsafe { self.mutex.get() }
    }
}

impl<T, M: ?Sized + LockCellInternal<T>> DerefMut for LockCellGuard<'_, T, M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // Safety: There can always be only 1 guard for a given mutex so this is safe
        unsafe { self.mutex.get_mut() }
    }
}

impl<T: Display, M: ?Sized + LockCellInternal<T>> Display for LockCellGuard<'_, T, M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        (**self).fmt(f)
    }
}

impl<T, M: ?Sized + LockCellInternal<T>> Drop for LockCellGuard<'_, T, M> {
    fn drop(&mut self) {
        unsafe { self.mutex.unlock(self) }
    }
}

/// A cell that gives exclusive access to its data through a [LockCellGuard]
pub trait LockCell<T>
where
    Self: LockCellInternal<T>,
{
    /// Blocks until the lock is acquired
    fn lock(&self) -> LockCellGuard<'_, T, Self>;

    /// Acquires the lock only if it is currently open.
    ///
    /// Returns `None` without waiting if another guard exists.
    fn try_lock(&self) -> Option<LockCellGuard<'_, T, Self>>;
}

/// A [LockCell] that busy waits until the lock is released.
#[derive(Debug)]
pub struct SpinLock<T> {
    open: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> LockCellInternal<T> for SpinLock<T> {
    unsafe fn get(&self) -> &T {
        &*self.data.get()
    }

    unsafe fn get_mut(&self) -> &mut T {
        &mut *self.data.get()
    }

    unsafe fn unlock<'s, 'l: 's>(&'s self, _guard: &mut LockCellGuard<'l, T, Self>) {
        self.open.store(true, Ordering::Release);
    }
}

impl<T> SpinLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            open: AtomicBool::new(true),
            data: UnsafeCell::new(data),
        }
    }

    /// Consumes the lock, returning the inner data
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    fn guard(&self) -> LockCellGuard<'_, T, SpinLock<T>> {
        LockCellGuard {
            mutex: self,
            _t: PhantomData,
            _not_send: PhantomData,
        }
    }
}

impl<T> LockCell<T> for SpinLock<T> {
    fn lock(&self) -> LockCellGuard<'_, T, SpinLock<T>> {
        loop {
            match self
                .open
                .compare_exchange_weak(true, false, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(_) => spin_loop(),
            }
        }

        self.guard()
    }

    fn try_lock(&self) -> Option<LockCellGuard<'_, T, SpinLock<T>>> {
        self.open
            .compare_exchange(true, false, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| self.guard())
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> From<T> for SpinLock<T> {
    fn from(value: T) -> Self {
        Self::new(value)
    }
}

#[cfg(test)]
mod test {
    use super::{LockCell, SpinLock};
    use std::{sync::Arc, thread, vec::Vec};

    #[test]
    fn try_lock_fails_while_locked() {
        let lock = SpinLock::new(5u32);

        let guard = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(guard);

        let mut guard = lock.try_lock().expect("lock should be open");
        *guard += 1;
        drop(guard);

        assert_eq!(*lock.lock(), 6);
    }

    #[test]
    fn lock_is_exclusive_between_threads() {
        let lock = Arc::new(SpinLock::new(0u64));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = lock.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        *lock.lock() += 1;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(*lock.lock(), 4000);
    }
}
