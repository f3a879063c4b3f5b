//! The host's single-threaded execution context.
//!
//! Work that must not race host state (notify handlers, async handlers,
//! the run loop's `wait`) is submitted to one dedicated thread driving a
//! current-thread runtime. Submitters get a [`PendingFuture`] back: a
//! single-assignment slot that can be awaited or blocked on from a plain
//! thread.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::{self, ThreadId};

use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;

use crate::error::{BridgeError, Result};

/// Thread-safe single-assignment result slot.
///
/// Resolves with `Err(BridgeError::Shutdown)` if its [`Resolver`] is
/// dropped without being used.
#[must_use = "a PendingFuture does nothing unless awaited or waited on"]
pub struct PendingFuture<T> {
    rx: oneshot::Receiver<Result<T>>,
}

/// Producer side of a [`PendingFuture`].
pub struct Resolver<T> {
    tx: oneshot::Sender<Result<T>>,
}

/// Create a connected resolver / pending future pair.
pub fn pending<T>() -> (Resolver<T>, PendingFuture<T>) {
    let (tx, rx) = oneshot::channel();
    (Resolver { tx }, PendingFuture { rx })
}

impl<T> Resolver<T> {
    /// Assign the result. Returns `false` if nobody is observing anymore.
    pub fn resolve(self, result: Result<T>) -> bool {
        self.tx.send(result).is_ok()
    }
}

impl<T> PendingFuture<T> {
    /// Block the current thread until the result is assigned.
    ///
    /// Must not be called from async code; await the future instead.
    pub fn wait(self) -> Result<T> {
        self.rx.blocking_recv().unwrap_or_else(|_| Err(dropped()))
    }

    /// Take the result if it is already assigned.
    pub fn try_take(&mut self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(dropped())),
        }
    }
}

impl<T> Future for PendingFuture<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or_else(|_| Err(dropped())))
    }
}

fn dropped() -> BridgeError {
    BridgeError::Shutdown("host execution context dropped the task".to_string())
}

struct ExecutorInner {
    handle: Handle,
    thread_id: ThreadId,
    stop: parking_lot::Mutex<Option<oneshot::Sender<()>>>,
}

impl Drop for ExecutorInner {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.get_mut().take() {
            let _ = stop.send(());
        }
    }
}

/// Handle to the host execution thread.
///
/// Cloneable; the thread stops when the last clone is dropped.
#[derive(Clone)]
pub struct HostExecutor {
    inner: Arc<ExecutorInner>,
}

impl HostExecutor {
    /// Start the host execution thread.
    pub fn start(thread_name: &str) -> Result<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let handle = runtime.handle().clone();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let thread = thread::Builder::new()
            .name(thread_name.to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    let _ = stop_rx.await;
                });
                tracing::debug!("host execution context stopped");
            })?;

        Ok(Self {
            inner: Arc::new(ExecutorInner {
                handle,
                thread_id: thread.thread().id(),
                stop: parking_lot::Mutex::new(Some(stop_tx)),
            }),
        })
    }

    /// Submit a future to run on the host thread.
    pub fn submit<F, T>(&self, fut: F) -> PendingFuture<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (resolver, pending) = pending();
        self.inner.handle.spawn(async move {
            resolver.resolve(fut.await);
        });
        pending
    }

    /// Schedule a synchronous function to run on the host thread.
    pub fn call_soon<F, T>(&self, f: F) -> PendingFuture<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.submit(async move { f() })
    }

    /// Whether the caller is running on the host thread.
    pub fn is_host_thread(&self) -> bool {
        thread::current().id() == self.inner.thread_id
    }

    /// Runtime handle of the host thread.
    pub fn handle(&self) -> &Handle {
        &self.inner.handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_call_soon_runs_on_host_thread() {
        let executor = HostExecutor::start("test-host").unwrap();
        let probe = executor.clone();

        let name = executor
            .call_soon(move || {
                assert!(probe.is_host_thread());
                Ok(thread::current().name().map(str::to_string))
            })
            .wait()
            .unwrap();

        assert_eq!(name.as_deref(), Some("test-host"));
        assert!(!executor.is_host_thread());
    }

    #[test]
    fn test_submit_propagates_error() {
        let executor = HostExecutor::start("test-host").unwrap();

        let result: Result<()> = executor
            .submit(async { Err(BridgeError::handler("nope")) })
            .wait();

        assert!(matches!(result, Err(BridgeError::Handler(msg)) if msg == "nope"));
    }

    #[test]
    fn test_tasks_are_serialized_on_one_thread() {
        let executor = HostExecutor::start("test-host").unwrap();

        let a = executor.submit(async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(thread::current().id())
        });
        let b = executor.call_soon(|| Ok(thread::current().id()));

        assert_eq!(a.wait().unwrap(), b.wait().unwrap());
    }

    #[test]
    fn test_dropped_resolver_reports_shutdown() {
        let (resolver, pending) = pending::<i32>();
        drop(resolver);

        assert!(matches!(pending.wait(), Err(BridgeError::Shutdown(_))));
    }

    #[test]
    fn test_resolve_once() {
        let (resolver, mut pending) = pending::<i32>();
        assert!(pending.try_take().is_none());

        assert!(resolver.resolve(Ok(2)));
        assert_eq!(pending.try_take().unwrap().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_pending_future_is_awaitable() {
        let (resolver, pending) = pending::<&'static str>();
        std::thread::spawn(move || resolver.resolve(Ok("done")));

        assert_eq!(pending.await.unwrap(), "done");
    }
}
