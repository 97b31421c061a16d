//! Pipelines: chains of stages, each transforming one stream into the next.
//!
//! Every stage runs on its own thread, reading a value, transforming it, and writing the result to
//! its output stream, which closes when the input closes. Since each stage processes one value at a
//! time, values leave a linear chain in the order they entered it.
//!
//! Errors are values: [`try_stage`] and [`and_then`] produce streams of `Result`s, so that a
//! failing transform does not bring the pipeline down, and whoever reads the stream decides what to
//! do with the failure.
//!
//! # Examples
//!
//! ```
//! use weft::{pipeline::Pipeline, stream, Signal};
//!
//! let signal = Signal::new();
//! let numbers = stream::from_iter([1, 2, 3], &signal)?;
//! let out = Pipeline::new(numbers)
//!     .with_signal(&signal)
//!     .stage(|n| n * 2)?
//!     .stage(|n| n + 1)?
//!     .into_stream();
//! assert_eq!(out.into_iter().collect::<Vec<_>>(), [3, 5, 7]);
//! # Ok::<(), std::io::Error>(())
//! ```

use std::io;

use crate::{
    stream::{self, ReadOne, Stream, WriteOne},
    thread::spawn_detached,
    Error, Signal,
};

/// Moves values from `source` to `sink`, transforming each with `f`, until the source closes, the
/// sink is dropped, or `signal` fires.
///
/// Returns the number of values moved.
pub(crate) fn pump<S, W, F>(source: &S, sink: &W, signal: &Signal, mut f: F) -> usize
where
    S: ReadOne,
    W: WriteOne,
    F: FnMut(S::Item) -> W::Item,
{
    let mut moved = 0;
    loop {
        let value = match source.read_one(signal) {
            Ok(Some(value)) => value,
            Ok(None) => break,
            Err(e) => {
                log::trace!("input abandoned after {moved} values: {e}");
                break;
            }
        };
        if let Err(e) = sink.write_one(f(value), signal) {
            log::trace!("output abandoned after {moved} values: {e}");
            break;
        }
        moved += 1;
    }
    moved
}

fn spawn_stage<S, U, F>(name: String, input: S, signal: &Signal, f: F) -> io::Result<Stream<U>>
where
    S: ReadOne + Send + 'static,
    U: Send + 'static,
    F: FnMut(S::Item) -> U + Send + 'static,
{
    let (sink, output) = stream::bounded(0);
    let signal = signal.clone();
    spawn_detached(name, move || {
        pump(&input, &sink, &signal, f);
        sink.close();
    })?;
    Ok(output)
}

/// Spawns a stage applying `f` to every value of `input`.
pub fn stage<S, U, F>(input: S, signal: &Signal, f: F) -> io::Result<Stream<U>>
where
    S: ReadOne + Send + 'static,
    U: Send + 'static,
    F: FnMut(S::Item) -> U + Send + 'static,
{
    spawn_stage("weft-stage".into(), input, signal, f)
}

/// Spawns a stage applying the fallible `f` to every value of `input`.
///
/// Failures are passed downstream as [`Error::TaskFailed`] values, and processing continues with
/// the next value.
pub fn try_stage<S, U, F>(input: S, signal: &Signal, mut f: F) -> io::Result<Stream<Result<U, Error>>>
where
    S: ReadOne + Send + 'static,
    U: Send + 'static,
    F: FnMut(S::Item) -> anyhow::Result<U> + Send + 'static,
{
    stage(input, signal, move |value| f(value).map_err(Error::task_failed))
}

/// Spawns a stage applying the fallible `f` to every successful value of `input`.
///
/// Errors arriving from upstream are forwarded untouched.
pub fn and_then<S, T, U, F>(input: S, signal: &Signal, mut f: F) -> io::Result<Stream<Result<U, Error>>>
where
    S: ReadOne<Item = Result<T, Error>> + Send + 'static,
    U: Send + 'static,
    F: FnMut(T) -> anyhow::Result<U> + Send + 'static,
{
    stage(input, signal, move |value: Result<T, Error>| {
        value.and_then(|value| f(value).map_err(Error::task_failed))
    })
}

/// Builder for a linear chain of stages sharing one [`Signal`].
#[derive(Debug)]
pub struct Pipeline<T> {
    stream: Stream<T>,
    signal: Signal,
    name: String,
    depth: usize,
}

impl<T: Send + 'static> Pipeline<T> {
    /// Starts a pipeline reading from `source`.
    pub fn new(source: Stream<T>) -> Self {
        Self {
            stream: source,
            signal: Signal::new(),
            name: "weft-stage".into(),
            depth: 0,
        }
    }

    /// Makes every stage added from now on stop when `signal` fires.
    pub fn with_signal(self, signal: &Signal) -> Self {
        Self {
            signal: signal.clone(),
            ..self
        }
    }

    /// Sets the base name of stage threads. Each thread is named after this and its depth.
    pub fn named<N: Into<String>>(self, name: N) -> Self {
        Self {
            name: name.into(),
            ..self
        }
    }

    /// Appends a stage applying `f`.
    pub fn stage<U, F>(self, f: F) -> io::Result<Pipeline<U>>
    where
        U: Send + 'static,
        F: FnMut(T) -> U + Send + 'static,
    {
        let name = format!("{}-{}", self.name, self.depth);
        let stream = spawn_stage(name, self.stream, &self.signal, f)?;
        Ok(Pipeline {
            stream,
            signal: self.signal,
            name: self.name,
            depth: self.depth + 1,
        })
    }

    /// Appends a stage applying the fallible `f`. Failures become [`Error::TaskFailed`] values.
    pub fn try_stage<U, F>(self, mut f: F) -> io::Result<Pipeline<Result<U, Error>>>
    where
        U: Send + 'static,
        F: FnMut(T) -> anyhow::Result<U> + Send + 'static,
    {
        self.stage(move |value| f(value).map_err(Error::task_failed))
    }

    /// Number of stages in the chain.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Returns the output of the last stage.
    pub fn into_stream(self) -> Stream<T> {
        self.stream
    }
}

impl<T: Send + 'static, E: Send + 'static> Pipeline<Result<T, E>>
where
    Error: From<E>,
{
    /// Appends a stage applying the fallible `f` to successful values, forwarding errors.
    pub fn and_then<U, F>(self, mut f: F) -> io::Result<Pipeline<Result<U, Error>>>
    where
        U: Send + 'static,
        F: FnMut(T) -> anyhow::Result<U> + Send + 'static,
    {
        self.stage(move |value: Result<T, E>| match value {
            Ok(value) => f(value).map_err(Error::task_failed),
            Err(e) => Err(Error::from(e)),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::bail;

    use super::*;
    use crate::stream::from_iter;

    #[test]
    fn linear_chain_preserves_order() {
        let signal = Signal::new();
        let input = from_iter([1, 2, 3], &signal).unwrap();
        let doubled = stage(input, &signal, |n| n * 2).unwrap();
        let incremented = stage(doubled, &signal, |n| n + 1).unwrap();
        assert_eq!(incremented.into_iter().collect::<Vec<_>>(), [3, 5, 7]);
    }

    #[test]
    fn long_chain_keeps_order() {
        let signal = Signal::new();
        let mut pipeline = Pipeline::new(from_iter(0..200, &signal).unwrap())
            .with_signal(&signal)
            .named("long");
        for _ in 0..10 {
            pipeline = pipeline.stage(|n| n + 1).unwrap();
        }
        assert_eq!(pipeline.depth(), 10);
        let out: Vec<_> = pipeline.into_stream().into_iter().collect();
        assert_eq!(out, (10..210).collect::<Vec<_>>());
    }

    #[test]
    fn errors_ride_the_stream() {
        let signal = Signal::new();
        let input = from_iter([1, 0, 4], &signal).unwrap();
        let inverted = try_stage(input, &signal, |n: i32| {
            if n == 0 {
                bail!("division by zero");
            }
            Ok(100 / n)
        })
        .unwrap();
        let halved = and_then(inverted, &signal, |n| Ok(n / 2)).unwrap();

        let out: Vec<_> = halved.into_iter().collect();
        assert_eq!(out.len(), 3);
        assert_eq!(*out[0].as_ref().unwrap(), 50);
        let err = out[1].as_ref().unwrap_err();
        assert!(matches!(err, Error::TaskFailed { .. }));
        assert!(err.to_string().contains("division by zero"));
        assert_eq!(*out[2].as_ref().unwrap(), 12);
    }

    #[test]
    fn builder_try_stage_and_then() {
        let signal = Signal::new();
        let out = Pipeline::new(from_iter(["1", "x", "3"], &signal).unwrap())
            .try_stage(|s: &str| Ok(s.parse::<u32>()?))
            .unwrap()
            .and_then(|n| Ok(n * 10))
            .unwrap()
            .into_stream();
        let out: Vec<_> = out.into_iter().map(|r| r.ok()).collect();
        assert_eq!(out, [Some(10), None, Some(30)]);
    }

    #[test]
    fn cancelled_stage_closes_output() {
        let signal = Signal::new();
        // A source that never closes on its own.
        let (_sink, source) = stream::bounded::<u32>(0);
        let output = stage(source, &signal, |n| n).unwrap();
        signal.trigger();
        assert!(matches!(
            output.recv_timeout(Duration::from_secs(5)),
            Ok(None)
        ));
    }

    #[test]
    fn pump_counts_moved_values() {
        let signal = Signal::new();
        let source = from_iter(0..5, &signal).unwrap();
        let (sink, out) = stream::unbounded();
        assert_eq!(pump(&source, &sink, &signal, |n| n * n), 5);
        drop(sink);
        assert_eq!(out.into_iter().collect::<Vec<_>>(), [0, 1, 4, 9, 16]);
    }
}
