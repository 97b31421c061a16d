//! Consuming the results of a [`Pool`][crate::Pool].

use crate::{Error, Signal, Stream, TaskId, TaskResult};

/// Running totals kept by an [`Aggregator`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    pub succeeded: usize,
    pub failed: usize,
}

impl Summary {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed
    }
}

/// The single consumer of a results stream.
///
/// Besides handing out results, the aggregator keeps a [`Summary`] of everything it has seen. Since
/// only the aggregator touches that state, it needs no locking.
///
/// # Examples
///
/// ```
/// use weft::{Aggregator, Pool, Signal, Task};
///
/// let pool = Pool::builder().workers(3).spawn()?;
/// for i in 0..10u32 {
///     pool.submit(Task::new(move || Ok(i * i)))?;
/// }
/// pool.shutdown(true);
///
/// let mut results = Aggregator::new(pool.results());
/// let values: Vec<u32> = results
///     .collect_ordered(&Signal::new())?
///     .into_iter()
///     .map(|r| r.outcome.unwrap())
///     .collect();
/// assert_eq!(values, [0, 1, 4, 9, 16, 25, 36, 49, 64, 81]);
/// assert_eq!(results.summary().succeeded, 10);
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug)]
pub struct Aggregator<R> {
    results: Stream<TaskResult<R>>,
    summary: Summary,
}

impl<R> Aggregator<R> {
    pub fn new(results: Stream<TaskResult<R>>) -> Self {
        Self {
            results,
            summary: Summary::default(),
        }
    }

    fn record(&mut self, result: &TaskResult<R>) {
        if result.is_ok() {
            self.summary.succeeded += 1;
        } else {
            self.summary.failed += 1;
        }
    }

    /// Waits for the next result.
    ///
    /// Returns `Ok(None)` once the results stream has closed.
    pub fn next(&mut self, signal: &Signal) -> Result<Option<TaskResult<R>>, Error> {
        let result = self.results.recv_with(signal)?;
        if let Some(result) = &result {
            self.record(result);
        }
        Ok(result)
    }

    /// Waits for up to `n` results, stopping early if the stream closes.
    pub fn take(&mut self, n: usize, signal: &Signal) -> Result<Vec<TaskResult<R>>, Error> {
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            match self.next(signal)? {
                Some(result) => out.push(result),
                None => break,
            }
        }
        Ok(out)
    }

    /// Collects results until the stream closes, in completion order.
    pub fn collect(&mut self, signal: &Signal) -> Result<Vec<TaskResult<R>>, Error> {
        let mut out = Vec::new();
        while let Some(result) = self.next(signal)? {
            out.push(result);
        }
        Ok(out)
    }

    /// Collects results until the stream closes, sorted by [`TaskId`] (i.e. submission order).
    pub fn collect_ordered(&mut self, signal: &Signal) -> Result<Vec<TaskResult<R>>, Error> {
        let mut out = self.collect(signal)?;
        out.sort_unstable_by_key(|result| result.id);
        Ok(out)
    }

    /// Collects results until the stream closes, split into successes and failures.
    #[allow(clippy::type_complexity)]
    pub fn partition(
        &mut self,
        signal: &Signal,
    ) -> Result<(Vec<(TaskId, R)>, Vec<(TaskId, Error)>), Error> {
        let mut ok = Vec::new();
        let mut failed = Vec::new();
        while let Some(result) = self.next(signal)? {
            match result.outcome {
                Ok(value) => ok.push((result.id, value)),
                Err(e) => failed.push((result.id, e)),
            }
        }
        Ok((ok, failed))
    }

    /// Folds every successful value into an accumulator, until the stream closes. Failures are
    /// only counted in the [`Summary`].
    pub fn fold<A>(
        &mut self,
        signal: &Signal,
        init: A,
        mut f: impl FnMut(A, R) -> A,
    ) -> Result<A, Error> {
        let mut acc = init;
        while let Some(result) = self.next(signal)? {
            if let Ok(value) = result.outcome {
                acc = f(acc, value);
            }
        }
        Ok(acc)
    }

    /// Totals of the results seen so far.
    pub fn summary(&self) -> Summary {
        self.summary
    }
}
