//! Fan-in and fan-out: merging streams, and splitting one stream across several readers.

use std::io;

use crossbeam_channel::{Select, SendError};

use crate::{
    pipeline::pump,
    stream::{self, ReadOne, Sink, Stream},
    thread::spawn_detached,
    Error, Signal,
};

/// Merges `sources` into a single stream.
///
/// One forwarding routine is spawned per source. The merged stream closes once *every* source has
/// closed (each forwarder holds a writer of the merged stream, and the stream closes when the last
/// one is gone). Values from the same source keep their relative order; there is no ordering
/// across sources. With no sources, the returned stream is already closed.
///
/// Forwarders also stop when `signal` fires or the merged stream is dropped.
pub fn fan_in<S>(sources: Vec<S>, signal: &Signal) -> io::Result<Stream<S::Item>>
where
    S: ReadOne + Send + 'static,
    S::Item: Send + 'static,
{
    let (sink, merged) = stream::bounded(0);
    for (index, source) in sources.into_iter().enumerate() {
        let sink = sink.fork();
        let signal = signal.clone();
        spawn_detached(format!("weft-fan-in-{index}"), move || {
            let moved = pump(&source, &sink, &signal, |value| value);
            log::trace!("fan-in source {index} done after {moved} values");
        })?;
    }
    Ok(merged)
}

/// Distributes the values of `source` across `n` output streams.
///
/// A single routine reads `source` and hands each value to whichever output has a reader waiting
/// for it first. There is no round-robin and no fairness guarantee. Each value is delivered to
/// exactly one output. If `signal` fires while a value is waiting for a reader, that value is lost.
///
/// Outputs whose stream was dropped are skipped from then on. All outputs close together when
/// `source` closes, when `signal` fires, or when every output was dropped. With `n == 0`, no
/// routine is spawned, `source` is dropped, and an empty list is returned.
pub fn fan_out<S>(source: S, n: usize, signal: &Signal) -> io::Result<Vec<Stream<S::Item>>>
where
    S: ReadOne + Send + 'static,
    S::Item: Send + 'static,
{
    if n == 0 {
        return Ok(Vec::new());
    }
    let (sinks, outputs): (Vec<_>, Vec<_>) = (0..n).map(|_| stream::bounded(0)).unzip();
    let signal = signal.clone();
    spawn_detached("weft-fan-out".into(), move || distribute(&source, sinks, &signal))?;
    Ok(outputs)
}

enum Offer<T> {
    Delivered,
    /// The output at this index has no reader left. The value is handed back.
    Disconnected(usize, T),
    Failed(Error),
}

fn distribute<S: ReadOne>(source: &S, mut sinks: Vec<Sink<S::Item>>, signal: &Signal) {
    let mut delivered = 0usize;
    'values: loop {
        let mut value = match source.read_one(signal) {
            Ok(Some(value)) => value,
            Ok(None) => break,
            Err(e) => {
                log::trace!("fan-out input abandoned after {delivered} values: {e}");
                break;
            }
        };

        loop {
            if sinks.is_empty() {
                log::debug!("fan-out stopping: every output was dropped");
                break 'values;
            }
            match offer(&sinks, value, signal) {
                Offer::Delivered => {
                    delivered += 1;
                    continue 'values;
                }
                Offer::Disconnected(index, rejected) => {
                    sinks.swap_remove(index);
                    value = rejected;
                }
                Offer::Failed(e) => {
                    log::warn!("fan-out lost an in-flight value: {e}");
                    break 'values;
                }
            }
        }
    }
    // Dropping `sinks` closes every output at once.
}

/// Offers `value` to every sink at once, handing it to the first one that is ready.
fn offer<T>(sinks: &[Sink<T>], value: T, signal: &Signal) -> Offer<T> {
    let deadline = signal.deadline_event();
    let mut sel = Select::new_biased();
    let cancelled = sel.recv(signal.observe());
    let expired = sel.recv(&deadline);
    // Operations are indexed in registration order, so output `k` is operation `first + k`.
    let first = expired + 1;
    for sink in sinks {
        sel.send(sink.sender());
    }

    let oper = sel.select();
    match oper.index() {
        i if i == cancelled => {
            let _ = oper.recv(signal.observe());
            Offer::Failed(Error::Cancelled)
        }
        i if i == expired => {
            let _ = oper.recv(&deadline);
            Offer::Failed(Error::DeadlineExceeded)
        }
        i => {
            let index = i - first;
            match oper.send(sinks[index].sender(), value) {
                Ok(()) => Offer::Delivered,
                Err(SendError(value)) => Offer::Disconnected(index, value),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashSet,
        thread,
        time::{Duration, Instant},
    };

    use super::*;
    use crate::stream::from_iter;

    #[test]
    fn fan_in_is_complete() {
        let signal = Signal::new();
        let sources = vec![
            from_iter(vec![1, 2, 3], &signal).unwrap(),
            from_iter(vec![4, 5], &signal).unwrap(),
            from_iter(vec![6], &signal).unwrap(),
        ];
        let merged = fan_in(sources, &signal).unwrap();
        let mut values: Vec<_> = merged.iter().collect();
        // The stream is closed after all six values.
        assert_eq!(merged.recv(), None);
        values.sort();
        assert_eq!(values, [1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn fan_in_keeps_per_source_order() {
        let signal = Signal::new();
        let sources = vec![
            from_iter((0..100).map(|i| (0usize, i)), &signal).unwrap(),
            from_iter((0..100).map(|i| (1usize, i)), &signal).unwrap(),
        ];
        let mut last = [None, None];
        for (source, i) in fan_in(sources, &signal).unwrap() {
            assert!(last[source] < Some(i));
            last[source] = Some(i);
        }
        assert_eq!(last, [Some(99), Some(99)]);
    }

    #[test]
    fn fan_in_of_nothing_is_closed() {
        let merged = fan_in(Vec::<Stream<u8>>::new(), &Signal::new()).unwrap();
        assert_eq!(merged.recv_timeout(Duration::from_secs(5)).unwrap(), None);
    }

    #[test]
    fn fan_in_stops_on_cancel() {
        let signal = Signal::new();
        let (_open, never_closes) = stream::bounded::<u8>(0);
        let merged = fan_in(vec![never_closes], &signal).unwrap();
        signal.trigger();
        assert_eq!(merged.recv_timeout(Duration::from_secs(5)).unwrap(), None);
    }

    #[test]
    fn fan_out_is_exclusive() {
        let signal = Signal::new();
        let outputs = fan_out(from_iter(0..100, &signal).unwrap(), 4, &signal).unwrap();
        assert_eq!(outputs.len(), 4);

        let per_output: Vec<Vec<i32>> = thread::scope(|s| {
            let readers: Vec<_> = outputs
                .into_iter()
                .map(|output| s.spawn(move || output.into_iter().collect::<Vec<_>>()))
                .collect();
            readers.into_iter().map(|r| r.join().unwrap()).collect()
        });

        let total: usize = per_output.iter().map(Vec::len).sum();
        assert_eq!(total, 100);
        let distinct: HashSet<_> = per_output.iter().flatten().copied().collect();
        assert_eq!(distinct.len(), 100);
    }

    #[test]
    fn fan_out_skips_dropped_outputs() {
        let signal = Signal::new();
        let mut outputs = fan_out(from_iter(0..10, &signal).unwrap(), 3, &signal).unwrap();
        let kept = outputs.remove(0);
        drop(outputs);
        assert_eq!(kept.into_iter().collect::<Vec<_>>(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn fan_out_closes_all_outputs_on_cancel() {
        let signal = Signal::new();
        let (_open, never_closes) = stream::bounded::<u8>(0);
        let outputs = fan_out(never_closes, 2, &signal).unwrap();
        signal.trigger();
        let deadline = Instant::now() + Duration::from_secs(5);
        for output in outputs {
            let left = deadline.saturating_duration_since(Instant::now());
            assert_eq!(output.recv_timeout(left).unwrap(), None);
        }
    }

    #[test]
    fn fan_out_to_zero_outputs() {
        let signal = Signal::new();
        assert!(fan_out(Stream::<u8>::closed(), 0, &signal).unwrap().is_empty());
    }
}
