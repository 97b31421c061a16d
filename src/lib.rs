//! Thread-based task orchestration: worker pools, fan-in/fan-out, pipelines and cancellation.
//!
//! (if you're looking for homogeneous parallel processing using an iterator-like interface, check
//! out [`rayon`] instead; if you're looking for running large numbers of I/O tasks concurrently,
//! you're probably better served by an `async` runtime)
//!
//! # Overview
//!
//! Everything in this library is built from OS threads and closable channels. The building blocks
//! are:
//!
//! - [`Stream`] and [`Sink`], the two ends of a typed conduit that is closed exactly once, by its
//!   writer.
//! - [`Signal`], a broadcast cancellation flag with an optional deadline. Every blocking operation
//!   takes one, and gives up with [`Error::Cancelled`] or [`Error::DeadlineExceeded`] when it
//!   fires.
//! - [`TaskQueue`], a closable queue that applies backpressure when bounded.
//! - [`Pool`], a fixed set of worker threads that claim [`Task`]s from a [`TaskQueue`] and publish
//!   a [`TaskResult`] for every one of them. An [`Aggregator`] consumes those results.
//! - [`fan_in`], [`fan_out`] and [`pipeline`], which compose streams.
//! - [`Gate`], a counting semaphore bounding concurrent access to a resource.
//!
//! ## Structured concurrency
//!
//! A [`Pool`] owns its threads: when it is dropped, it stops accepting work, lets its workers finish
//! everything that was queued, and joins them. Nothing outlives the pool.
//!
//! The combinators ([`fan_in`], [`fan_out`], the stages of a [`pipeline`]) spawn threads that are
//! not joined, but each of them is guaranteed to exit once its input closes, its output is dropped,
//! or its [`Signal`] fires, whichever comes first.
//!
//! ## Failures
//!
//! Task failures are values. A task that returns an error, or panics, produces a [`TaskResult`]
//! holding [`Error::TaskFailed`]; the worker that ran it carries on with the next task.
//!
//! # Usage
//!
//! Squaring numbers on a pool of 4 workers:
//!
//! ```
//! use weft::{Aggregator, Pool, Signal, Task};
//!
//! let pool = Pool::builder().workers(4).queue_capacity(8).spawn()?;
//! for i in 1..=10u64 {
//!     pool.submit(Task::new(move || Ok(i * i)))?;
//! }
//! pool.shutdown(true);
//!
//! let sum = Aggregator::new(pool.results()).fold(&Signal::new(), 0, |acc, v| acc + v)?;
//! assert_eq!(sum, 385);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Splitting a stream across 3 stages and merging their outputs again:
//!
//! ```
//! use weft::{fan_in, fan_out, pipeline::stage, stream, Signal};
//!
//! let signal = Signal::new();
//! let numbers = stream::from_iter(0..30, &signal)?;
//! let doubled = fan_out(numbers, 3, &signal)?
//!     .into_iter()
//!     .map(|part| stage(part, &signal, |n| n * 2))
//!     .collect::<Result<Vec<_>, _>>()?;
//!
//! let mut all: Vec<_> = fan_in(doubled, &signal)?.into_iter().collect();
//! all.sort();
//! assert_eq!(all, (0..30).map(|n| n * 2).collect::<Vec<_>>());
//! # Ok::<(), std::io::Error>(())
//! ```
//!
//! [`rayon`]: https://crates.io/crates/rayon

mod aggregate;
mod error;
pub mod fan;
mod gate;
pub mod pipeline;
mod pool;
mod queue;
pub mod shared;
pub mod signal;
pub mod stream;
pub mod sync;
mod thread;

pub use aggregate::{Aggregator, Summary};
pub use error::{Error, TrySubmitError};
pub use fan::{fan_in, fan_out};
pub use gate::{Gate, Permit};
pub use pool::{Pool, PoolBuilder, Task, TaskId, TaskResult};
pub use queue::TaskQueue;
pub use signal::{any_of, Signal};
pub use stream::{ReadOne, Sink, Stream, WriteOne};
