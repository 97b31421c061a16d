//! Closable, typed conduits between concurrent routines.
//!
//! A stream has two ends: a [`Sink`] that writes values and a [`Stream`] that reads them. The
//! [`Sink`] is the single logical closer of the stream. It is not [`Clone`], and closing it (via
//! [`Sink::close`] or by dropping it) consumes it, so a closed stream can never be written to again.
//! Readers observe the closure as `None` once all buffered values have been read.
//!
//! [`ReadOne`] and [`WriteOne`] are the capabilities that the composition primitives in
//! [`fan`][crate::fan] and [`pipeline`][crate::pipeline] are written against.

use std::{io, time::Duration};

use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::{thread::spawn_detached, Error, Signal};

/// Reading capability: anything a stage or forwarder can pull values out of.
pub trait ReadOne {
    type Item;

    /// Reads the next value, blocking until one is available.
    ///
    /// Returns `Ok(None)` once the source is closed and drained, and an error if `signal` fires
    /// first. Cancellation is preferred when both are ready.
    fn read_one(&self, signal: &Signal) -> Result<Option<Self::Item>, Error>;
}

/// Writing capability: anything a stage or forwarder can push values into.
pub trait WriteOne {
    type Item;

    /// Writes a value, blocking while the destination is full.
    ///
    /// Fails with [`Error::Disconnected`] when nobody is left to read the value, and with a
    /// cancellation error if `signal` fires first. The value is lost in both cases.
    fn write_one(&self, item: Self::Item, signal: &Signal) -> Result<(), Error>;

    /// Closes the destination. No further values can be written.
    fn close(self);
}

/// Creates a stream that buffers up to `capacity` values.
///
/// A capacity of 0 creates a rendezvous stream: every write blocks until a reader takes the value.
pub fn bounded<T>(capacity: usize) -> (Sink<T>, Stream<T>) {
    let (tx, rx) = crossbeam_channel::bounded(capacity);
    (Sink { tx }, Stream { rx })
}

/// Creates a stream with an unlimited buffer. Writes never block.
pub fn unbounded<T>() -> (Sink<T>, Stream<T>) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (Sink { tx }, Stream { rx })
}

/// The writing end of a stream.
#[derive(Debug)]
pub struct Sink<T> {
    tx: Sender<T>,
}

impl<T> Sink<T> {
    /// Writes a value, blocking while the stream is full.
    ///
    /// Returns [`Error::Disconnected`] if every [`Stream`] handle has been dropped.
    pub fn send(&self, value: T) -> Result<(), Error> {
        self.tx.send(value).map_err(|_| Error::Disconnected)
    }

    /// Like [`Sink::send`], but gives up when `signal` fires.
    pub fn send_with(&self, value: T, signal: &Signal) -> Result<(), Error> {
        let deadline = signal.deadline_event();
        crossbeam_channel::select_biased! {
            recv(signal.observe()) -> _ => Err(Error::Cancelled),
            recv(deadline) -> _ => Err(Error::DeadlineExceeded),
            send(self.tx, value) -> res => res.map_err(|_| Error::Disconnected),
        }
    }

    /// Writes a value right away if the stream has room for it, and otherwise waits like
    /// [`Sink::send_with`].
    ///
    /// Unlike [`Sink::send_with`], a value that fits is delivered even if `signal` has already
    /// fired. Used to publish work that has already been completed.
    pub fn deliver(&self, value: T, signal: &Signal) -> Result<(), Error> {
        match self.tx.try_send(value) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(value)) => self.send_with(value, signal),
            Err(TrySendError::Disconnected(_)) => Err(Error::Disconnected),
        }
    }

    /// Closes the stream. Equivalent to dropping the [`Sink`].
    pub fn close(self) {}

    /// Number of values buffered and not yet read.
    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    /// Additional writer used by the forwarding routines of a fan-in. The stream closes once all of
    /// them are dropped.
    pub(crate) fn fork(&self) -> Sink<T> {
        Sink {
            tx: self.tx.clone(),
        }
    }

    pub(crate) fn sender(&self) -> &Sender<T> {
        &self.tx
    }
}

impl<T> WriteOne for Sink<T> {
    type Item = T;

    fn write_one(&self, item: T, signal: &Signal) -> Result<(), Error> {
        self.send_with(item, signal)
    }

    fn close(self) {}
}

/// The reading end of a stream.
///
/// Cloning a [`Stream`] creates another reader of the *same* stream: each value is delivered to
/// exactly one of the readers.
#[derive(Debug)]
pub struct Stream<T> {
    rx: Receiver<T>,
}

impl<T> Clone for Stream<T> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
        }
    }
}

impl<T> Stream<T> {
    /// Returns a stream that is already closed.
    pub fn closed() -> Self {
        let (_, stream) = bounded(0);
        stream
    }

    /// Reads the next value, blocking until one is available.
    ///
    /// Returns `None` once the stream is closed and every buffered value has been read.
    pub fn recv(&self) -> Option<T> {
        self.rx.recv().ok()
    }

    /// Like [`Stream::recv`], but gives up when `signal` fires.
    pub fn recv_with(&self, signal: &Signal) -> Result<Option<T>, Error> {
        let deadline = signal.deadline_event();
        crossbeam_channel::select_biased! {
            recv(signal.observe()) -> _ => Err(Error::Cancelled),
            recv(deadline) -> _ => Err(Error::DeadlineExceeded),
            recv(self.rx) -> msg => Ok(msg.ok()),
        }
    }

    /// Like [`Stream::recv`], but fails with [`Error::DeadlineExceeded`] after `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<T>, Error> {
        match self.rx.recv_timeout(timeout) {
            Ok(value) => Ok(Some(value)),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => Ok(None),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => Err(Error::DeadlineExceeded),
        }
    }

    /// Returns a value if one is buffered, without blocking.
    pub fn try_recv(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Reads every remaining value until the stream closes or `signal` fires.
    pub fn collect_with(&self, signal: &Signal) -> Result<Vec<T>, Error> {
        let mut out = Vec::new();
        while let Some(value) = self.recv_with(signal)? {
            out.push(value);
        }
        Ok(out)
    }

    /// Number of buffered values.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Returns a blocking iterator that ends when the stream closes.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter { stream: self }
    }
}

impl<T> ReadOne for Stream<T> {
    type Item = T;

    fn read_one(&self, signal: &Signal) -> Result<Option<T>, Error> {
        self.recv_with(signal)
    }
}

/// Blocking iterator over a borrowed [`Stream`].
pub struct Iter<'a, T> {
    stream: &'a Stream<T>,
}

impl<T> Iterator for Iter<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.stream.recv()
    }
}

/// Blocking iterator over an owned [`Stream`].
pub struct IntoIter<T> {
    stream: Stream<T>,
}

impl<T> Iterator for IntoIter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.stream.recv()
    }
}

impl<T> IntoIterator for Stream<T> {
    type Item = T;
    type IntoIter = IntoIter<T>;

    fn into_iter(self) -> IntoIter<T> {
        IntoIter { stream: self }
    }
}

impl<'a, T> IntoIterator for &'a Stream<T> {
    type Item = T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Iter<'a, T> {
        self.iter()
    }
}

/// Spawns a generator: a routine that calls `next` until it returns `None`, writing each value to
/// the returned stream.
///
/// The returned stream is a rendezvous stream, so `next` is only called again once the previous
/// value has been read. The generator stops early if `signal` fires or the stream is dropped.
pub fn generate<T, F>(signal: &Signal, mut next: F) -> io::Result<Stream<T>>
where
    T: Send + 'static,
    F: FnMut() -> Option<T> + Send + 'static,
{
    let (sink, stream) = bounded(0);
    let signal = signal.clone();
    spawn_detached("weft-generator".into(), move || {
        while let Some(value) = next() {
            if let Err(e) = sink.send_with(value, &signal) {
                log::trace!("generator stopping: {e}");
                break;
            }
        }
    })?;
    Ok(stream)
}

/// Spawns a generator that yields the items of `iter`.
pub fn from_iter<I>(iter: I, signal: &Signal) -> io::Result<Stream<I::Item>>
where
    I: IntoIterator,
    I::IntoIter: Send + 'static,
    I::Item: Send + 'static,
{
    let mut iter = iter.into_iter();
    generate(signal, move || iter.next())
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Instant};

    use super::*;

    #[test]
    fn closure_is_distinguishable_from_values() {
        let (sink, stream) = bounded(4);
        sink.send(1).unwrap();
        sink.send(2).unwrap();
        sink.close();
        assert_eq!(stream.recv(), Some(1));
        assert_eq!(stream.recv(), Some(2));
        assert_eq!(stream.recv(), None);
        assert_eq!(stream.recv(), None);
    }

    #[test]
    fn send_to_dropped_reader_fails() {
        let (sink, stream) = unbounded();
        drop(stream);
        assert!(matches!(sink.send(1), Err(Error::Disconnected)));
    }

    #[test]
    fn closed_stream() {
        assert_eq!(Stream::<u8>::closed().recv(), None);
    }

    #[test]
    fn recv_with_is_cancellable() {
        let (_sink, stream) = bounded::<u8>(0);
        let signal = Signal::new();
        let trigger = signal.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            trigger.trigger();
        });
        assert!(matches!(stream.recv_with(&signal), Err(Error::Cancelled)));
        handle.join().unwrap();
    }

    #[test]
    fn cancellation_preferred_over_ready_value() {
        let (sink, stream) = bounded(1);
        sink.send(1).unwrap();
        let signal = Signal::new();
        signal.trigger();
        assert!(matches!(stream.recv_with(&signal), Err(Error::Cancelled)));
        // The value is still there for a reader that is not cancelled.
        assert_eq!(stream.recv(), Some(1));
    }

    #[test]
    fn send_with_times_out_when_full() {
        let (sink, _stream) = bounded(1);
        sink.send(1).unwrap();
        let signal = Signal::with_timeout(Duration::from_millis(10));
        let start = Instant::now();
        assert!(matches!(
            sink.send_with(2, &signal),
            Err(Error::DeadlineExceeded)
        ));
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn deliver_ignores_fired_signal_when_there_is_room() {
        let (sink, stream) = bounded(1);
        let signal = Signal::new();
        signal.trigger();
        sink.deliver(1, &signal).unwrap();
        assert!(matches!(sink.deliver(2, &signal), Err(Error::Cancelled)));
        assert_eq!(stream.recv(), Some(1));
    }

    #[test]
    fn recv_timeout() {
        let (sink, stream) = bounded::<u8>(0);
        assert!(matches!(
            stream.recv_timeout(Duration::from_millis(5)),
            Err(Error::DeadlineExceeded)
        ));
        drop(sink);
        assert!(matches!(stream.recv_timeout(Duration::from_millis(5)), Ok(None)));
    }

    #[test]
    fn generator_yields_in_order() {
        let mut i = 0;
        let stream = generate(&Signal::new(), move || {
            i += 1;
            (i <= 5).then_some(i)
        })
        .unwrap();
        assert_eq!(stream.into_iter().collect::<Vec<_>>(), [1, 2, 3, 4, 5]);
    }

    #[test]
    fn generator_stops_on_cancel() {
        let signal = Signal::new();
        let stream = from_iter(0.., &signal).unwrap();
        assert_eq!(stream.recv(), Some(0));
        assert_eq!(stream.recv(), Some(1));
        signal.trigger();
        // At most one value may already be in flight at the rendezvous point.
        let rest = stream.iter().count();
        assert!(rest <= 1, "{rest} values after cancellation");
    }

    #[test]
    fn collect_with_reads_until_closed() {
        let stream = from_iter(vec!["a", "b"], &Signal::new()).unwrap();
        assert_eq!(stream.collect_with(&Signal::new()).unwrap(), ["a", "b"]);
    }
}
