//! Cooperative cancellation.
//!
//! A [`Signal`] is a one-shot, broadcast "stop" flag. Every blocking operation in this crate takes
//! a [`Signal`] and returns [`Error::Cancelled`] once it has been triggered, or
//! [`Error::DeadlineExceeded`] once its deadline has passed.
//!
//! Signals form a tree: [`Signal::child`] derives a signal that fires when its parent fires (but
//! not the other way around), and [`any_of`] derives a signal that fires when *any* of its inputs
//! fire.
//!
//! # Examples
//!
//! ```
//! use std::time::Duration;
//! use weft::{Error, Signal};
//!
//! let root = Signal::new();
//! let request = root.child_with_timeout(Duration::from_secs(60));
//!
//! root.trigger();
//! assert!(request.is_triggered());
//! assert!(matches!(request.check(), Err(Error::Cancelled)));
//! ```

use std::{
    convert::Infallible,
    fmt, mem,
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender};

use crate::{sync::Mutex, Error};

/// Message type of the [`Signal::observe`] channel. No value of it is ever sent.
pub type Never = Infallible;

/// A broadcast cancellation flag with an optional deadline.
///
/// Cloning a [`Signal`] yields another handle to the *same* flag. Triggering is idempotent, and a
/// triggered signal stays triggered.
#[derive(Clone)]
pub struct Signal {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    /// Becomes disconnected once `State::trigger` is dropped.
    observed: Receiver<Never>,
    deadline: Option<Instant>,
}

struct State {
    /// `None` once triggered.
    trigger: Option<Sender<Never>>,
    children: Vec<Weak<Inner>>,
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("triggered", &self.is_triggered())
            .field("deadline", &self.inner.deadline)
            .finish()
    }
}

impl Signal {
    /// Creates an untriggered signal without a deadline.
    pub fn new() -> Self {
        Self::with_optional_deadline(None)
    }

    /// Creates a signal that reports [`Error::DeadlineExceeded`] once `timeout` has elapsed.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    /// Creates a signal that reports [`Error::DeadlineExceeded`] once `deadline` has passed.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self::with_optional_deadline(Some(deadline))
    }

    fn with_optional_deadline(deadline: Option<Instant>) -> Self {
        let (trigger, observed) = crossbeam_channel::bounded(0);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    trigger: Some(trigger),
                    children: Vec::new(),
                }),
                observed,
                deadline,
            }),
        }
    }

    /// Triggers the signal, waking every thread blocked on it and triggering all children.
    ///
    /// Calling this more than once has no further effect.
    pub fn trigger(&self) {
        let children = {
            let mut state = self.inner.state.lock();
            if state.trigger.take().is_none() {
                return;
            }
            mem::take(&mut state.children)
        };
        log::trace!("signal triggered ({} children)", children.len());

        for child in children {
            if let Some(inner) = child.upgrade() {
                Signal { inner }.trigger();
            }
        }
    }

    /// Returns whether [`Signal::trigger`] has been called on this signal or one of its ancestors.
    ///
    /// This does not take the deadline into account; see [`Signal::check`] for that.
    pub fn is_triggered(&self) -> bool {
        self.inner.state.lock().trigger.is_none()
    }

    /// Returns the deadline of this signal, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Returns an error if the signal has fired, preferring [`Error::Cancelled`] over
    /// [`Error::DeadlineExceeded`] when both apply.
    pub fn check(&self) -> Result<(), Error> {
        if self.is_triggered() {
            return Err(Error::Cancelled);
        }
        match self.inner.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(Error::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Returns a receiver that becomes ready (disconnected) once the signal is triggered.
    ///
    /// This is meant to be used as an arm of [`crossbeam_channel::select!`], alongside the
    /// operation that should be cancellable. It is not consumed by being observed.
    pub fn observe(&self) -> &Receiver<Never> {
        &self.inner.observed
    }

    /// Returns a fresh receiver that delivers a message when the deadline passes, or never if there
    /// is no deadline.
    ///
    /// Like [`Signal::observe`], this is meant to be raced against other operations. Every call
    /// creates a new timer.
    pub fn deadline_event(&self) -> Receiver<Instant> {
        match self.inner.deadline {
            Some(deadline) => crossbeam_channel::at(deadline),
            None => crossbeam_channel::never(),
        }
    }

    /// Blocks until the signal fires, and returns why.
    ///
    /// Blocks forever if the signal is never triggered and has no deadline.
    pub fn wait(&self) -> Error {
        let deadline = self.deadline_event();
        crossbeam_channel::select_biased! {
            recv(self.observe()) -> _ => Error::Cancelled,
            recv(deadline) -> _ => Error::DeadlineExceeded,
        }
    }

    /// Blocks until the signal fires or `timeout` elapses.
    ///
    /// Returns the reason the signal fired, or `None` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Error> {
        let deadline = self.deadline_event();
        crossbeam_channel::select_biased! {
            recv(self.observe()) -> _ => Some(Error::Cancelled),
            recv(deadline) -> _ => Some(Error::DeadlineExceeded),
            default(timeout) => None,
        }
    }

    /// Derives a signal that fires when `self` fires, and that can also be triggered on its own.
    ///
    /// The child inherits the parent's deadline.
    pub fn child(&self) -> Signal {
        let child = Signal::with_optional_deadline(self.inner.deadline);
        self.adopt(&child);
        child
    }

    /// Derives a child signal whose deadline is `timeout` from now, or the parent's deadline if
    /// that is earlier.
    pub fn child_with_timeout(&self, timeout: Duration) -> Signal {
        let deadline = earliest([self.inner.deadline, Some(Instant::now() + timeout)]);
        let child = Signal::with_optional_deadline(deadline);
        self.adopt(&child);
        child
    }

    /// Registers `child` to be triggered together with `self`.
    fn adopt(&self, child: &Signal) {
        {
            let mut state = self.inner.state.lock();
            if state.trigger.is_some() {
                state.children.retain(|weak| weak.strong_count() > 0);
                state.children.push(Arc::downgrade(&child.inner));
                return;
            }
        }
        child.trigger();
    }
}

/// Returns a signal that fires as soon as any signal in `signals` fires.
///
/// The returned signal carries the earliest deadline among the inputs. With no inputs, the returned
/// signal only fires when triggered directly.
pub fn any_of(signals: &[Signal]) -> Signal {
    let combined =
        Signal::with_optional_deadline(earliest(signals.iter().map(|signal| signal.deadline())));
    for signal in signals {
        signal.adopt(&combined);
    }
    combined
}

fn earliest(deadlines: impl IntoIterator<Item = Option<Instant>>) -> Option<Instant> {
    deadlines.into_iter().flatten().min()
}
