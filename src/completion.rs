//! Completion handles for work finished on a worker thread.
//!
//! The asynchronous read and dispatch paths hand their blocking tail
//! (waiting on the device, mapping, copying) to a short-lived worker
//! thread.  The caller gets a [`Completion`] back immediately and can
//! block on it, poll it, or `.await` it from any executor.  A callback
//! can be attached instead through [`spawn_with`], in which case it runs
//! on the worker once the result is ready.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use std::thread;

use futures::channel::oneshot;

use crate::error::{Error, Result};

/// The eventual result of work running on a worker thread.
#[must_use = "a Completion does nothing unless waited on, polled or awaited"]
pub struct Completion<T> {
    receiver: oneshot::Receiver<Result<T>>,
}

impl<T> Completion<T> {
    /// Blocks the calling thread until the worker reports back.
    pub fn wait(self) -> Result<T> {
        pollster::block_on(self)
    }

    /// Returns the result if it is ready, without blocking.
    ///
    /// Once this returns `Some`, the handle is spent and later calls
    /// report [`Error::WorkerLost`].
    pub fn try_take(&mut self) -> Option<Result<T>> {
        match self.receiver.try_recv() {
            Ok(Some(result)) => Some(result),
            Ok(None) => None,
            Err(oneshot::Canceled) => Some(Err(Error::WorkerLost)),
        }
    }
}

impl<T> Future for Completion<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(Error::WorkerLost)))
    }
}

/// Runs `work` on a named worker thread and returns a handle to its
/// result.
pub(crate) fn spawn<T, F>(name: &str, work: F) -> Result<Completion<T>>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let (sender, receiver) = oneshot::channel();
    spawn_with(name, work, move |result| {
        // The receiver may already be gone; nothing to report to then.
        let _ = sender.send(result);
    })?;
    Ok(Completion { receiver })
}

/// Runs `work` on a named worker thread and passes its result to
/// `on_complete` on that same thread.
pub(crate) fn spawn_with<T, F, C>(name: &str, work: F, on_complete: C) -> Result<()>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
    C: FnOnce(Result<T>) + Send + 'static,
{
    thread::Builder::new()
        .name(format!("minigpu-{name}"))
        .spawn(move || {
            let result = work();
            if let Err(e) = &result {
                log::error!("{}: {e}", thread::current().name().unwrap_or("minigpu worker"));
            }
            on_complete(result);
        })
        .map_err(Error::WorkerSpawn)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn wait_returns_worker_result() {
        let handle = spawn("test", || Ok(41 + 1)).unwrap();
        assert_eq!(handle.wait().unwrap(), 42);
    }

    #[test]
    fn errors_cross_the_worker_boundary() {
        let handle = spawn::<(), _>("test", || Err(Error::NoKernel)).unwrap();
        assert!(matches!(handle.wait(), Err(Error::NoKernel)));
    }

    #[test]
    fn try_take_eventually_yields() {
        let mut handle = spawn("test", || Ok("done")).unwrap();
        let result = loop {
            if let Some(r) = handle.try_take() {
                break r;
            }
            thread::yield_now();
        };
        assert_eq!(result.unwrap(), "done");
    }

    #[test]
    fn callback_runs_once_on_worker() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = std::sync::mpsc::channel();
        let counter = Arc::clone(&calls);
        spawn_with(
            "test",
            || Ok(7),
            move |r| {
                counter.fetch_add(1, Ordering::SeqCst);
                let on_worker = thread::current().name() == Some("minigpu-test");
                tx.send((r.unwrap(), on_worker)).unwrap();
            },
        )
        .unwrap();
        assert_eq!(rx.recv().unwrap(), (7, true));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn awaitable_from_an_executor() {
        let handle = spawn("test", || Ok(vec![1u8, 2, 3])).unwrap();
        let bytes = pollster::block_on(async { handle.await }).unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);
    }
}
