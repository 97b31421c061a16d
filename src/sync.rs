//! Locking primitives without lock poisoning, and a [`WaitGroup`] join counter.
//!
//! Task panics are caught by the workers of a [`Pool`][crate::Pool] and delivered as failed results.
//! A panicking task that happened to hold one of the caller's locks would otherwise poison it and
//! turn every later `lock().unwrap()` into a knock-on panic on an unrelated worker. The wrappers in
//! this module simply hand out the guard regardless, so one failing task stays isolated.
//!
//! Prefer the higher-level types of this crate ([`Counter`][crate::shared::Counter],
//! [`SharedMap`][crate::shared::SharedMap], [`Gate`][crate::Gate]) where they fit.

use std::{
    fmt,
    ops::{Deref, DerefMut},
    sync::{self, LockResult, PoisonError},
    time::{Duration, Instant},
};

fn unpoison<G>(res: LockResult<G>) -> G {
    res.unwrap_or_else(PoisonError::into_inner)
}

/// A mutual exclusion lock that ignores poisoning.
#[derive(Default)]
pub struct Mutex<T: ?Sized> {
    inner: sync::Mutex<T>,
}

/// Guard returned by [`Mutex::lock`].
pub struct MutexGuard<'a, T: ?Sized + 'a> {
    inner: sync::MutexGuard<'a, T>,
}

impl<T> Mutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: sync::Mutex::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        unpoison(self.inner.into_inner())
    }
}

impl<T: ?Sized> Mutex<T> {
    pub fn lock(&self) -> MutexGuard<'_, T> {
        MutexGuard {
            inner: unpoison(self.inner.lock()),
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        unpoison(self.inner.get_mut())
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = match self.inner.try_lock() {
            Ok(guard) => Some(guard),
            Err(sync::TryLockError::Poisoned(poison)) => Some(poison.into_inner()),
            Err(sync::TryLockError::WouldBlock) => None,
        };
        let mut s = f.debug_struct("Mutex");
        match &guard {
            Some(guard) => s.field("data", &&**guard),
            None => s.field("data", &"<locked>"),
        }
        .finish_non_exhaustive()
    }
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

/// A condition variable paired with [`Mutex`].
#[derive(Debug, Default)]
pub struct Condvar {
    inner: sync::Condvar,
}

impl Condvar {
    pub const fn new() -> Self {
        Self {
            inner: sync::Condvar::new(),
        }
    }

    pub fn wait_while<'a, T, F>(&self, guard: MutexGuard<'a, T>, condition: F) -> MutexGuard<'a, T>
    where
        F: FnMut(&mut T) -> bool,
    {
        MutexGuard {
            inner: unpoison(self.inner.wait_while(guard.inner, condition)),
        }
    }

    /// Waits while `condition` holds, for at most `dur`.
    ///
    /// Returns the guard and whether the wait timed out with `condition` still holding.
    pub fn wait_timeout_while<'a, T, F>(
        &self,
        guard: MutexGuard<'a, T>,
        dur: Duration,
        condition: F,
    ) -> (MutexGuard<'a, T>, bool)
    where
        F: FnMut(&mut T) -> bool,
    {
        let (inner, res) = unpoison(self.inner.wait_timeout_while(guard.inner, dur, condition));
        (MutexGuard { inner }, res.timed_out())
    }

    pub fn notify_one(&self) {
        self.inner.notify_one();
    }

    pub fn notify_all(&self) {
        self.inner.notify_all();
    }
}

/// A reader-writer lock that ignores poisoning.
///
/// Allows any number of concurrent readers, or one exclusive writer.
#[derive(Default)]
pub struct RwLock<T: ?Sized> {
    inner: sync::RwLock<T>,
}

impl<T> RwLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: sync::RwLock::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        unpoison(self.inner.into_inner())
    }
}

impl<T: ?Sized> RwLock<T> {
    pub fn read(&self) -> sync::RwLockReadGuard<'_, T> {
        unpoison(self.inner.read())
    }

    pub fn write(&self) -> sync::RwLockWriteGuard<'_, T> {
        unpoison(self.inner.write())
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for RwLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("RwLock");
        match self.inner.try_read() {
            Ok(guard) => s.field("data", &&*guard),
            Err(_) => s.field("data", &"<locked>"),
        }
        .finish_non_exhaustive()
    }
}

/// A counter of outstanding units of work that threads can wait on until it drops to zero.
///
/// [`Pool`][crate::Pool] uses one to detect that every worker thread it started has exited.
#[derive(Debug, Default)]
pub struct WaitGroup {
    count: Mutex<usize>,
    condvar: Condvar,
}

impl WaitGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `n` outstanding units.
    pub fn add(&self, n: usize) {
        *self.count.lock() += n;
    }

    /// Marks one unit as done, waking all waiters if it was the last one.
    ///
    /// # Panics
    ///
    /// Panics if the counter is already zero (a `done` without a matching `add`).
    pub fn done(&self) {
        let mut count = self.count.lock();
        assert_ne!(*count, 0, "WaitGroup::done called more often than WaitGroup::add");
        *count -= 1;
        if *count == 0 {
            self.condvar.notify_all();
        }
    }

    /// Adds one unit and returns a guard that marks it as done when dropped, including when the
    /// owning thread unwinds.
    pub fn guard(&self) -> WaitGroupGuard<'_> {
        self.add(1);
        WaitGroupGuard { group: self }
    }

    /// Returns the number of outstanding units.
    pub fn count(&self) -> usize {
        *self.count.lock()
    }

    /// Blocks until the counter reaches zero.
    pub fn wait(&self) {
        drop(self.condvar.wait_while(self.count.lock(), |n| *n != 0));
    }

    /// Blocks until the counter reaches zero or `timeout` elapses.
    ///
    /// Returns `true` if the counter reached zero.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (_guard, timed_out) =
            self.condvar
                .wait_timeout_while(self.count.lock(), timeout, |n| *n != 0);
        !timed_out
    }

    /// Blocks until the counter reaches zero or `deadline` passes.
    pub fn wait_deadline(&self, deadline: Instant) -> bool {
        self.wait_timeout(deadline.saturating_duration_since(Instant::now()))
    }
}

/// Marks one unit of a [`WaitGroup`] as done on drop.
///
/// Created by [`WaitGroup::guard`].
#[must_use = "dropping the guard immediately marks the unit as done"]
pub struct WaitGroupGuard<'a> {
    group: &'a WaitGroup,
}

impl Drop for WaitGroupGuard<'_> {
    fn drop(&mut self) {
        self.group.done();
    }
}
