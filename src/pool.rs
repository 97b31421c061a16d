use std::{
    fmt, io,
    num::NonZeroUsize,
    panic::{self, resume_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crate::{
    stream::{self, Sink, Stream},
    sync::{Mutex, WaitGroup},
    thread::{defer, spawn_named},
    any_of, Error, Signal, TaskQueue, TrySubmitError,
};

/// Identifier assigned to a [`Task`] when it is accepted by a [`Pool`].
///
/// Identifiers increase in submission order, so they can be used to restore submission order
/// after the fact (see [`Aggregator::collect_ordered`][crate::Aggregator::collect_ordered]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl TaskId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

type Work<R> = Box<dyn FnOnce() -> anyhow::Result<R> + Send + 'static>;

/// A unit of work: a closure that owns its input and produces an `R` or an error.
///
/// The closure is executed exactly once, by exactly one worker. It is never retried.
pub struct Task<R> {
    name: Option<String>,
    work: Work<R>,
}

impl<R> Task<R> {
    /// Creates a task from a closure.
    ///
    /// Everything the closure needs should be moved into it. Workers share nothing else.
    pub fn new<F>(work: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<R> + Send + 'static,
    {
        Self {
            name: None,
            work: Box::new(work),
        }
    }

    /// Creates a task with a name that is carried over to its [`TaskResult`] and shows up in logs.
    pub fn named<N, F>(name: N, work: F) -> Self
    where
        N: Into<String>,
        F: FnOnce() -> anyhow::Result<R> + Send + 'static,
    {
        Self {
            name: Some(name.into()),
            ..Self::new(work)
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

impl<R> fmt::Debug for Task<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// The outcome of an executed [`Task`].
#[derive(Debug)]
pub struct TaskResult<R> {
    pub id: TaskId,
    pub name: Option<String>,
    /// Index of the worker that executed the task.
    pub worker: usize,
    /// The task's value, or [`Error::TaskFailed`] if it returned an error or panicked.
    pub outcome: Result<R, Error>,
    pub completed_at: Instant,
}

impl<R> TaskResult<R> {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn into_outcome(self) -> Result<R, Error> {
        self.outcome
    }
}

struct Job<R> {
    id: TaskId,
    task: Task<R>,
}

impl<R> Job<R> {
    fn execute(self, worker: usize) -> TaskResult<R> {
        let Job { id, task } = self;
        let Task { name, work } = task;
        let outcome = match panic::catch_unwind(AssertUnwindSafe(work)) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(cause)) => Err(Error::task_failed(cause)),
            Err(payload) => {
                let error = Error::from_panic(payload);
                log::warn!("task {id} on worker {worker}: {error}");
                Err(error)
            }
        };
        TaskResult {
            id,
            name,
            worker,
            outcome,
            completed_at: Instant::now(),
        }
    }
}

/// A builder object that can be used to configure and spawn a [`Pool`].
#[derive(Debug, Clone)]
pub struct PoolBuilder {
    name: Option<String>,
    workers: Option<usize>,
    queue_capacity: usize,
    results_capacity: Option<usize>,
    signal: Option<Signal>,
}

impl PoolBuilder {
    /// Sets the base name of the worker threads.
    ///
    /// Each thread will be named according to this base name and its index.
    pub fn name<N: Into<String>>(self, name: N) -> Self {
        Self {
            name: Some(name.into()),
            ..self
        }
    }

    /// Sets the number of worker threads.
    ///
    /// By default, one worker per available CPU is spawned.
    #[inline]
    pub fn workers(self, workers: usize) -> Self {
        Self {
            workers: Some(workers),
            ..self
        }
    }

    /// Sets the capacity of the task queue.
    ///
    /// By default, a capacity of 0 is used, which means that [`Pool::submit`] will block until a
    /// worker is free to take the task.
    #[inline]
    pub fn queue_capacity(self, capacity: usize) -> Self {
        Self {
            queue_capacity: capacity,
            ..self
        }
    }

    /// Bounds the results stream to `capacity` unread results.
    ///
    /// By default, the results stream is unbounded. With a bounded results stream, workers stall
    /// when nobody reads results, and a draining [`Pool::shutdown`] will wait for a reader.
    ///
    /// A non-draining shutdown does not wait for a reader: a task that finishes after it while the
    /// results stream is full has its result dropped (and logged at `warn` level).
    #[inline]
    pub fn results_capacity(self, capacity: usize) -> Self {
        Self {
            results_capacity: Some(capacity),
            ..self
        }
    }

    /// Makes the pool observe `signal`: when it fires, workers stop claiming tasks.
    ///
    /// The pool derives its own child signal, so shutting the pool down does not trigger `signal`.
    pub fn signal(self, signal: &Signal) -> Self {
        Self {
            signal: Some(signal.clone()),
            ..self
        }
    }

    /// Spawns the worker threads of a [`Pool`] producing results of type `R`.
    ///
    /// # Panics
    ///
    /// This method will panic if the worker count was set to 0.
    pub fn spawn<R: Send + 'static>(self) -> io::Result<Pool<R>> {
        let workers = self.workers.unwrap_or_else(|| {
            thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1)
        });
        assert_ne!(workers, 0, "worker count must be at least 1");

        let name = self.name.unwrap_or_else(|| "weft-pool".into());
        let signal = match &self.signal {
            Some(parent) => parent.child(),
            None => Signal::new(),
        };
        let queue = Arc::new(TaskQueue::bounded(self.queue_capacity));
        let (sink, results) = match self.results_capacity {
            Some(capacity) => stream::bounded(capacity),
            None => stream::unbounded(),
        };
        let active = Arc::new(WaitGroup::new());

        let mut pool = Pool {
            queue,
            results,
            signal,
            next_id: AtomicU64::new(0),
            active,
            handles: Mutex::new(Vec::with_capacity(workers)),
            name,
            workers,
        };

        for index in 0..workers {
            match pool.spawn_worker(index, sink.fork()) {
                Ok(handle) => pool.handles.get_mut().push(handle),
                Err(e) => {
                    log::error!("pool '{}': failed to spawn worker {index}: {e}", pool.name);
                    pool.shutdown(false);
                    return Err(e);
                }
            }
        }
        log::debug!("pool '{}' started {workers} workers", pool.name);

        // The workers now hold the only writers, so the results stream closes when they exit.
        drop(sink);
        Ok(pool)
    }
}

/// A fixed set of worker threads draining a shared [`TaskQueue`].
///
/// Each worker repeatedly claims a [`Task`], runs it, and publishes a [`TaskResult`] on the
/// [`Pool::results`] stream. A task that fails or panics yields a failed result; it never takes
/// its worker or the pool down with it.
///
/// This type enforces structured concurrency: when it's dropped, the queue is closed, the remaining
/// tasks are drained, and every worker thread is joined.
pub struct Pool<R: Send + 'static> {
    queue: Arc<TaskQueue<Job<R>>>,
    results: Stream<TaskResult<R>>,
    signal: Signal,
    next_id: AtomicU64,
    /// Number of worker threads that have not exited yet.
    active: Arc<WaitGroup>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    name: String,
    workers: usize,
}

impl<R: Send + 'static> Drop for Pool<R> {
    fn drop(&mut self) {
        self.shutdown(true);
    }
}

impl<R: Send + 'static> fmt::Debug for Pool<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.name)
            .field("workers", &self.workers)
            .field("queued", &self.queue.len())
            .field("running", &self.active.count())
            .finish_non_exhaustive()
    }
}

impl Pool<()> {
    /// Returns a builder that can be used to configure and spawn a [`Pool`].
    #[inline]
    pub fn builder() -> PoolBuilder {
        PoolBuilder {
            name: None,
            workers: None,
            queue_capacity: 0,
            results_capacity: None,
            signal: None,
        }
    }
}

impl<R: Send + 'static> Pool<R> {
    /// Spawns a pool of `workers` threads, with room for `queue_capacity` pending tasks.
    pub fn new(workers: usize, queue_capacity: usize) -> io::Result<Self> {
        Pool::builder()
            .workers(workers)
            .queue_capacity(queue_capacity)
            .spawn()
    }

    fn spawn_worker(&self, index: usize, results: Sink<TaskResult<R>>) -> io::Result<JoinHandle<()>> {
        let queue = self.queue.clone();
        let signal = self.signal.clone();
        let active = self.active.clone();
        active.add(1);
        let spawned = spawn_named(format!("{}-{index}", self.name), move || {
            let _done = defer(|| active.done());
            run_worker(index, &queue, &results, &signal);
        });
        if spawned.is_err() {
            self.active.done();
        }
        spawned
    }

    /// Submits a task, blocking while the task queue is full.
    ///
    /// Fails with [`Error::QueueClosed`] once [`Pool::shutdown`] has been called or the pool's
    /// [`Signal`] has fired.
    pub fn submit(&self, task: Task<R>) -> Result<TaskId, Error> {
        let id = self.next_id();
        self.queue
            .submit_with(Job { id, task }, &self.signal)
            .map_err(|e| self.submit_error(e))?;
        Ok(id)
    }

    /// Like [`Pool::submit`], but also gives up when `signal` fires.
    pub fn submit_with(&self, task: Task<R>, signal: &Signal) -> Result<TaskId, Error> {
        let id = self.next_id();
        let either = any_of(&[self.signal.clone(), signal.clone()]);
        self.queue
            .submit_with(Job { id, task }, &either)
            .map_err(|e| self.submit_error(e))?;
        Ok(id)
    }

    /// Submits a task if the queue has room for it, handing it back otherwise.
    pub fn try_submit(&self, task: Task<R>) -> Result<TaskId, TrySubmitError<Task<R>>> {
        if self.signal.check().is_err() {
            return Err(TrySubmitError::Closed(task));
        }
        let id = self.next_id();
        match self.queue.try_submit(Job { id, task }) {
            Ok(()) => Ok(id),
            Err(TrySubmitError::Full(job)) => Err(TrySubmitError::Full(job.task)),
            Err(TrySubmitError::Closed(job)) => Err(TrySubmitError::Closed(job.task)),
        }
    }

    /// A submission cut short by the pool's own signal means the pool no longer takes work.
    fn submit_error(&self, e: Error) -> Error {
        if e.is_cancellation() && self.signal.check().is_err() {
            Error::QueueClosed
        } else {
            e
        }
    }

    fn next_id(&self) -> TaskId {
        TaskId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the stream of task results.
    ///
    /// Results arrive in completion order, not submission order. The stream closes once every
    /// worker has exited, which happens after [`Pool::shutdown`]. Each result is delivered to
    /// exactly one reader, no matter how many times this is called.
    pub fn results(&self) -> Stream<TaskResult<R>> {
        self.results.clone()
    }

    /// Shuts the pool down and waits for every worker thread to exit.
    ///
    /// With `drain` set, the queue is closed and the workers finish every task that was already
    /// submitted. Without it, the pool's [`Signal`] is triggered and workers exit as soon as they
    /// are done with the task at hand; tasks still in the queue are dropped without a result.
    /// Running tasks are never interrupted either way.
    ///
    /// This may be called several times and from several threads; every call returns once the
    /// workers are gone. If a worker thread itself panicked, the panic is propagated to the caller.
    pub fn shutdown(&self, drain: bool) {
        self.begin_shutdown(drain);
        self.active.wait();
        self.join_workers();
    }

    /// Like [`Pool::shutdown`], but stops waiting after `timeout`.
    ///
    /// Returns [`Error::DeadlineExceeded`] if some worker was still busy. The shutdown itself
    /// stays in effect, and dropping the pool later will wait for the remaining workers.
    pub fn shutdown_timeout(&self, drain: bool, timeout: Duration) -> Result<(), Error> {
        self.begin_shutdown(drain);
        if !self.active.wait_timeout(timeout) {
            return Err(Error::DeadlineExceeded);
        }
        self.join_workers();
        Ok(())
    }

    fn begin_shutdown(&self, drain: bool) {
        if !drain {
            self.signal.trigger();
        }
        if self.queue.close().is_ok() {
            log::debug!("pool '{}' shutting down (drain: {drain})", self.name);
        }
        if !drain {
            let dropped = self.queue.discard();
            if dropped != 0 {
                log::debug!("pool '{}' dropped {dropped} queued tasks", self.name);
            }
        }
    }

    fn join_workers(&self) {
        let handles = std::mem::take(&mut *self.handles.lock());
        let mut payload = None;
        for handle in handles {
            if let Err(pl) = handle.join() {
                payload = Some(pl);
            }
        }
        if let Some(payload) = payload {
            if !thread::panicking() {
                resume_unwind(payload);
            }
        }
    }

    /// Returns `true` once [`Pool::shutdown`] has been initiated, or the workers have stopped
    /// because the pool's [`Signal`] fired.
    pub fn is_shut_down(&self) -> bool {
        self.queue.is_closed()
    }

    /// Number of submitted tasks that no worker has claimed yet.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn worker_count(&self) -> usize {
        self.workers
    }

    /// The signal observed by the workers.
    ///
    /// Triggering it is equivalent to `shutdown(false)` without the waiting: submissions fail with
    /// [`Error::QueueClosed`] from then on, and the workers close the queue and drop the tasks still
    /// in it on their way out.
    pub fn signal(&self) -> &Signal {
        &self.signal
    }
}

fn run_worker<R>(
    index: usize,
    queue: &TaskQueue<Job<R>>,
    results: &Sink<TaskResult<R>>,
    signal: &Signal,
) {
    loop {
        let job = match queue.claim(signal) {
            Ok(Some(job)) => job,
            Ok(None) => break,
            Err(e) => {
                log::trace!("worker {index} stopping: {e}");
                // Fails if another worker or `shutdown` got there first.
                queue.close().ok();
                queue.discard();
                break;
            }
        };

        let id = job.id;
        let result = job.execute(index);
        if let Err(e) = results.deliver(result, signal) {
            log::warn!("worker {index}: result of task {id} lost: {e}");
        }
    }
}
