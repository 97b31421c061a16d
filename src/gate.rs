//! A counting semaphore bounding how many threads run a section concurrently.
//!
//! The permits of a [`Gate`] are tokens in a bounded channel: acquiring a permit puts a token in,
//! releasing one takes a token out. A full channel means every permit is held, so acquiring blocks
//! (and can be raced against a [`Signal`]) until some holder releases.
//!
//! Permits taken without a guard ([`Gate::acquire_raw`]) are counted separately, so that a stray
//! [`Gate::release`] can never hand out the token of a live [`Permit`].

use std::{fmt, sync::Arc};

use crossbeam_channel::{Receiver, Sender};

use crate::{sync::Mutex, Error, Signal};

/// Limits the number of concurrent holders of a permit to a fixed capacity.
///
/// This is independent of how many threads exist: a [`Pool`][crate::Pool] with 16 workers can use
/// a [`Gate`] of capacity 3 to make sure at most 3 tasks talk to some rate-limited service at once.
///
/// Cloning a [`Gate`] yields another handle to the same set of permits.
///
/// # Examples
///
/// ```
/// use weft::Gate;
///
/// let gate = Gate::new(2);
/// let a = gate.acquire();
/// let b = gate.acquire();
/// assert!(gate.try_acquire().is_none());
/// drop(a);
/// assert!(gate.try_acquire().is_some());
/// # drop(b);
/// ```
#[derive(Clone)]
pub struct Gate {
    held: Sender<()>,
    free: Receiver<()>,
    /// Permits taken by `acquire_raw` and not yet released.
    raw: Arc<Mutex<usize>>,
}

impl fmt::Debug for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gate")
            .field("in_use", &self.in_use())
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl Gate {
    /// Creates a gate with `capacity` permits.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0, since such a gate could never be passed.
    pub fn new(capacity: usize) -> Self {
        assert_ne!(capacity, 0, "gate capacity must be at least 1");
        let (held, free) = crossbeam_channel::bounded(capacity);
        Self {
            held,
            free,
            raw: Arc::new(Mutex::new(0)),
        }
    }

    /// Blocks until a permit is available and takes it.
    ///
    /// The permit is returned when the [`Permit`] is dropped, on every exit path of the guarded
    /// section, including unwinding.
    pub fn acquire(&self) -> Permit {
        self.acquire_raw();
        Permit { gate: self.clone() }
    }

    /// Like [`Gate::acquire`], but gives up when `signal` fires.
    pub fn acquire_with(&self, signal: &Signal) -> Result<Permit, Error> {
        let deadline = signal.deadline_event();
        crossbeam_channel::select_biased! {
            recv(signal.observe()) -> _ => Err(Error::Cancelled),
            recv(deadline) -> _ => Err(Error::DeadlineExceeded),
            // The gate holds a receiver of its own, so this send cannot fail.
            send(self.held, ()) -> _ => Ok(Permit { gate: self.clone() }),
        }
    }

    /// Takes a permit if one is available, without blocking.
    pub fn try_acquire(&self) -> Option<Permit> {
        self.held.try_send(()).ok()?;
        Some(Permit { gate: self.clone() })
    }

    /// Blocks until a permit is available and takes it, without a guard.
    ///
    /// Every call must be paired with exactly one [`Gate::release`]. Prefer [`Gate::acquire`],
    /// which cannot be misused this way.
    pub fn acquire_raw(&self) {
        // The gate holds a receiver of its own, so this cannot fail.
        self.held.send(()).ok();
        *self.raw.lock() += 1;
    }

    /// Returns a permit taken by [`Gate::acquire_raw`].
    ///
    /// Returns [`Error::GateMisuse`] if no such permit is currently held. Permits held through a
    /// [`Permit`] guard do not count: they can only be returned by dropping the guard.
    pub fn release(&self) -> Result<(), Error> {
        let mut raw = self.raw.lock();
        if *raw == 0 {
            return Err(Error::GateMisuse);
        }
        // Every raw permit has its token in the channel.
        self.free.try_recv().map_err(|_| Error::GateMisuse)?;
        *raw -= 1;
        Ok(())
    }

    /// Runs `f` while holding a permit.
    pub fn run<T>(&self, f: impl FnOnce() -> T) -> T {
        let _permit = self.acquire();
        f()
    }

    /// Runs `f` while holding a permit, giving up on the wait for a permit when `signal` fires.
    pub fn run_with<T>(&self, signal: &Signal, f: impl FnOnce() -> T) -> Result<T, Error> {
        let _permit = self.acquire_with(signal)?;
        Ok(f())
    }

    /// Number of permits currently held.
    pub fn in_use(&self) -> usize {
        self.held.len()
    }

    /// Number of permits that can be acquired without blocking.
    pub fn available(&self) -> usize {
        self.capacity() - self.in_use()
    }

    pub fn capacity(&self) -> usize {
        self.held.capacity().unwrap_or(usize::MAX)
    }
}

/// A held permit of a [`Gate`]. The permit is returned when this is dropped.
#[must_use = "the permit is released as soon as the `Permit` is dropped"]
pub struct Permit {
    gate: Gate,
}

impl fmt::Debug for Permit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Permit").finish_non_exhaustive()
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if self.gate.free.try_recv().is_err() {
            log::error!("permit dropped, but its gate holds no token");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        panic::{catch_unwind, resume_unwind, AssertUnwindSafe},
        sync::Arc,
        thread,
        time::Duration,
    };

    use crate::sync::Mutex;

    use super::*;

    #[test]
    fn never_exceeds_capacity() {
        struct Inside {
            now: usize,
            max: usize,
        }

        let gate = Gate::new(3);
        let inside = Arc::new(Mutex::new(Inside { now: 0, max: 0 }));
        thread::scope(|s| {
            for _ in 0..50 {
                let gate = gate.clone();
                let inside = inside.clone();
                s.spawn(move || {
                    gate.run(|| {
                        {
                            let mut inside = inside.lock();
                            inside.now += 1;
                            inside.max = inside.max.max(inside.now);
                        }
                        thread::sleep(Duration::from_millis(2));
                        inside.lock().now -= 1;
                    });
                });
            }
        });

        let inside = inside.lock();
        assert!(inside.max <= 3, "{} threads inside the gate", inside.max);
        assert!(inside.max >= 1);
        assert_eq!(inside.now, 0);
        assert_eq!(gate.in_use(), 0);
    }

    #[test]
    fn permit_released_on_unwind() {
        let gate = Gate::new(1);
        catch_unwind(AssertUnwindSafe(|| {
            gate.run(|| resume_unwind(Box::new("guarded section failed")))
        }))
        .unwrap_err();
        assert_eq!(gate.in_use(), 0);
        assert!(gate.try_acquire().is_some());
    }

    #[test]
    fn release_without_acquire_is_misuse() {
        let gate = Gate::new(2);
        assert!(matches!(gate.release(), Err(Error::GateMisuse)));

        gate.acquire_raw();
        assert_eq!(gate.in_use(), 1);
        assert_eq!(gate.available(), 1);
        gate.release().unwrap();
        assert!(matches!(gate.release(), Err(Error::GateMisuse)));
    }

    #[test]
    fn stray_release_cannot_free_a_guarded_permit() {
        let gate = Gate::new(1);
        let held = gate.acquire();
        assert!(matches!(gate.release(), Err(Error::GateMisuse)));
        assert!(gate.try_acquire().is_none());
        assert_eq!(gate.in_use(), 1);
        drop(held);
        assert_eq!(gate.in_use(), 0);

        let gate = Gate::new(2);
        let _held = gate.acquire();
        gate.acquire_raw();
        gate.release().unwrap();
        assert!(matches!(gate.release(), Err(Error::GateMisuse)));
        assert_eq!(gate.in_use(), 1);
    }

    #[test]
    fn acquire_with_gives_up_on_deadline() {
        let gate = Gate::new(1);
        let _held = gate.acquire();
        let signal = Signal::with_timeout(Duration::from_millis(10));
        assert!(matches!(
            gate.acquire_with(&signal),
            Err(Error::DeadlineExceeded)
        ));
        assert!(matches!(
            gate.run_with(&signal, || ()),
            Err(Error::DeadlineExceeded)
        ));
        assert_eq!(gate.in_use(), 1);
    }

    #[test]
    fn blocked_acquire_wakes_on_release() {
        let gate = Gate::new(1);
        let held = gate.acquire();
        thread::scope(|s| {
            let waiter = s.spawn(|| gate.acquire_with(&Signal::new()).map(drop));
            thread::sleep(Duration::from_millis(10));
            drop(held);
            waiter.join().unwrap().unwrap();
        });
        assert_eq!(gate.in_use(), 0);
    }

    #[test]
    #[should_panic = "at least 1"]
    fn zero_capacity_panics() {
        Gate::new(0);
    }
}
