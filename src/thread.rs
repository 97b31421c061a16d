//! Named thread spawning with lifecycle logging.

use std::{
    io,
    thread::{self, JoinHandle},
};

/// Drop guard returned by [`defer`].
#[must_use = "`Defer` should be assigned to a variable, or it will be dropped immediately"]
pub(crate) struct Defer<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> Drop for Defer<F> {
    fn drop(&mut self) {
        if let Some(cb) = self.0.take() {
            cb();
        }
    }
}

/// Returns a value that runs `cb` when dropped, also while unwinding.
pub(crate) fn defer<F: FnOnce()>(cb: F) -> Defer<F> {
    Defer(Some(cb))
}

/// Spawns a thread named `name` running `f`.
///
/// Thread start and exit are logged at `trace` level, so that the lifetime of every forwarding
/// routine and worker can be followed in the logs.
pub(crate) fn spawn_named<F, R>(name: String, f: F) -> io::Result<JoinHandle<R>>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    thread::Builder::new().name(name.clone()).spawn(move || {
        log::trace!("thread '{name}' starting");
        let _guard = defer(move || log::trace!("thread '{name}' exiting"));
        f()
    })
}

/// Like [`spawn_named`], for routines that nobody joins.
///
/// Such routines must terminate on their own once their input closes, their output is dropped, or
/// their [`Signal`][crate::Signal] fires.
pub(crate) fn spawn_detached<F>(name: String, f: F) -> io::Result<()>
where
    F: FnOnce() + Send + 'static,
{
    spawn_named(name, f).map(drop)
}

#[cfg(test)]
mod tests {
    use std::{
        panic::{catch_unwind, resume_unwind, AssertUnwindSafe},
        sync::atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    #[test]
    fn defer_runs_on_unwind() {
        let runs = AtomicUsize::new(0);
        catch_unwind(AssertUnwindSafe(|| {
            let _guard = defer(|| {
                runs.fetch_add(1, Ordering::Relaxed);
            });
            resume_unwind(Box::new("unwinding"));
        }))
        .unwrap_err();
        assert_eq!(runs.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn spawned_thread_is_named() {
        let handle = spawn_named("weft-test".into(), || {
            thread::current().name().map(str::to_owned)
        })
        .unwrap();
        assert_eq!(handle.join().unwrap().as_deref(), Some("weft-test"));
    }
}
