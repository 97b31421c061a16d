//! The ordered buffer of pending work that feeds a [`Pool`][crate::Pool].

use std::fmt;

use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::{stream::ReadOne, sync::Mutex, Error, Signal, TrySubmitError};

/// A closable multi-producer, multi-consumer queue of tasks.
///
/// Bounded queues apply backpressure: [`TaskQueue::submit`] blocks while the queue is at capacity,
/// until a consumer claims an item. Items are claimed in submission order, but consumers racing
/// each other may finish them in any order.
///
/// The queue is owned by whoever calls [`TaskQueue::close`]. After that, submissions fail with
/// [`Error::QueueClosed`], while consumers keep draining the remaining items and then observe the
/// closure as `Ok(None)` from [`TaskQueue::claim`].
pub struct TaskQueue<T> {
    /// `None` once closed.
    tx: Mutex<Option<Sender<T>>>,
    rx: Receiver<T>,
}

impl<T> fmt::Debug for TaskQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<T> TaskQueue<T> {
    /// Creates a queue holding at most `capacity` unclaimed items.
    ///
    /// With a capacity of 0, every submission waits until a consumer takes the item directly.
    pub fn bounded(capacity: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        Self {
            tx: Mutex::new(Some(tx)),
            rx,
        }
    }

    /// Creates a queue without a capacity limit. Submissions never block.
    pub fn unbounded() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            tx: Mutex::new(Some(tx)),
            rx,
        }
    }

    fn sender(&self) -> Option<Sender<T>> {
        self.tx.lock().clone()
    }

    /// Enqueues `task`, blocking while the queue is full.
    pub fn submit(&self, task: T) -> Result<(), Error> {
        let tx = self.sender().ok_or(Error::QueueClosed)?;
        // The queue holds a receiver, so this cannot observe a disconnected channel.
        tx.send(task).map_err(|_| Error::QueueClosed)
    }

    /// Like [`TaskQueue::submit`], but gives up when `signal` fires.
    pub fn submit_with(&self, task: T, signal: &Signal) -> Result<(), Error> {
        let tx = self.sender().ok_or(Error::QueueClosed)?;
        let deadline = signal.deadline_event();
        crossbeam_channel::select_biased! {
            recv(signal.observe()) -> _ => Err(Error::Cancelled),
            recv(deadline) -> _ => Err(Error::DeadlineExceeded),
            send(tx, task) -> res => res.map_err(|_| Error::QueueClosed),
        }
    }

    /// Enqueues `task` if there is room for it, handing it back otherwise.
    pub fn try_submit(&self, task: T) -> Result<(), TrySubmitError<T>> {
        let Some(tx) = self.sender() else {
            return Err(TrySubmitError::Closed(task));
        };
        tx.try_send(task).map_err(|e| match e {
            TrySendError::Full(task) => TrySubmitError::Full(task),
            TrySendError::Disconnected(task) => TrySubmitError::Closed(task),
        })
    }

    /// Closes the queue for submissions.
    ///
    /// Closing an already closed queue returns [`Error::QueueClosed`], since it means two parties
    /// both believe they own the queue.
    pub fn close(&self) -> Result<(), Error> {
        match self.tx.lock().take() {
            Some(_) => Ok(()),
            None => Err(Error::QueueClosed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().is_none()
    }

    /// Claims the next item, blocking until one is available.
    ///
    /// Returns `Ok(None)` once the queue is closed and empty. If `signal` fires first (or has
    /// already fired), returns the matching error even when items are still queued.
    pub fn claim(&self, signal: &Signal) -> Result<Option<T>, Error> {
        let deadline = signal.deadline_event();
        crossbeam_channel::select_biased! {
            recv(signal.observe()) -> _ => Err(Error::Cancelled),
            recv(deadline) -> _ => Err(Error::DeadlineExceeded),
            recv(self.rx) -> task => Ok(task.ok()),
        }
    }

    /// Claims the next item if one is queued, without blocking.
    pub fn try_claim(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Number of queued, unclaimed items.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Maximum number of unclaimed items, or `None` for unbounded queues.
    pub fn capacity(&self) -> Option<usize> {
        self.rx.capacity()
    }

    /// Removes every unclaimed item, returning how many were dropped.
    pub(crate) fn discard(&self) -> usize {
        self.rx.try_iter().count()
    }
}

impl<T> ReadOne for TaskQueue<T> {
    type Item = T;

    fn read_one(&self, signal: &Signal) -> Result<Option<T>, Error> {
        self.claim(signal)
    }
}
