//! Error types shared by all components.

use std::any::Any;

/// Errors returned by the blocking operations of this crate, and carried inside failed
/// [`TaskResult`][crate::TaskResult]s.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A task was submitted after the owner closed the queue (or a queue was closed twice).
    #[error("the task queue has been closed")]
    QueueClosed,

    /// A task's function returned an error or panicked.
    ///
    /// This error never unwinds past a worker. It is delivered as the outcome of the task's result.
    #[error("task failed: {cause}")]
    TaskFailed {
        #[source]
        cause: anyhow::Error,
    },

    /// The deadline attached to the [`Signal`][crate::Signal] elapsed while waiting.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The [`Signal`][crate::Signal] was triggered while waiting.
    #[error("operation cancelled")]
    Cancelled,

    /// [`Gate::release`][crate::Gate::release] was called without a matching acquire.
    #[error("gate released without a matching acquire")]
    GateMisuse,

    /// The reading side of a stream was dropped, so the written value could not be delivered.
    #[error("the receiving side of the stream has been dropped")]
    Disconnected,
}

impl Error {
    pub(crate) fn task_failed(cause: anyhow::Error) -> Self {
        Error::TaskFailed { cause }
    }

    /// Converts the payload of a caught panic into a [`Error::TaskFailed`].
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "<non-string panic payload>".to_string()
        };
        Error::task_failed(anyhow::anyhow!("task panicked: {message}"))
    }

    /// Returns `true` for the two errors caused by a [`Signal`][crate::Signal] firing.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled | Error::DeadlineExceeded)
    }
}

/// Error returned by the non-blocking submission methods. The rejected value is handed back.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum TrySubmitError<T> {
    /// The queue is at capacity.
    #[error("the task queue is full")]
    Full(T),
    /// The queue has been closed.
    #[error("the task queue has been closed")]
    Closed(T),
}

impl<T> TrySubmitError<T> {
    /// Returns the value that could not be submitted.
    pub fn into_inner(self) -> T {
        match self {
            TrySubmitError::Full(t) | TrySubmitError::Closed(t) => t,
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, TrySubmitError::Full(_))
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, TrySubmitError::Closed(_))
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{catch_unwind, resume_unwind};

    use super::*;

    #[test]
    fn panic_payloads_become_task_failures() {
        let payload = catch_unwind(|| resume_unwind(Box::new(format!("boom {}", 42)))).unwrap_err();
        let err = Error::from_panic(payload);
        assert!(matches!(err, Error::TaskFailed { .. }));
        assert_eq!(err.to_string(), "task failed: task panicked: boom 42");

        let payload = catch_unwind(|| resume_unwind(Box::new("static"))).unwrap_err();
        assert!(Error::from_panic(payload).to_string().ends_with("static"));

        let payload = catch_unwind(|| resume_unwind(Box::new(1u8))).unwrap_err();
        assert!(Error::from_panic(payload).to_string().contains("non-string"));
    }

    #[test]
    fn try_submit_error_hands_value_back() {
        let err = TrySubmitError::Full(7);
        assert!(err.is_full());
        assert_eq!(err.into_inner(), 7);
        assert!(TrySubmitError::Closed(()).is_closed());
    }
}
