//! Context passed to handlers.
//!
//! Gives handler code access to the host:
//! - `request` / `request_blocking` - call a host API method
//! - `notify` - fire-and-forget host call
//! - `spawn` / `call_soon` - run work on the host execution thread
//! - `var` - read a global variable, treating host errors as absent
//!
//! # Example
//!
//! ```ignore
//! fn current_line(ctx: &HostContext, _args: Vec<Value>) -> HandlerResult {
//!     ctx.request_blocking("nvim_get_current_line", vec![])
//! }
//!
//! async fn set_line(ctx: HostContext, args: Vec<Value>) -> HandlerResult {
//!     ctx.request("nvim_set_current_line", args).await
//! }
//! ```

use std::future::Future;

use rmpv::Value;

use super::executor::{HostExecutor, PendingFuture};
use super::session::Session;
use crate::error::{BridgeError, Result};

/// Handle to the host given to every handler invocation.
///
/// `HostContext` is `Clone` and can be moved across threads and into
/// async tasks.
#[derive(Clone)]
pub struct HostContext {
    /// Connection to the host (`None` when detached).
    session: Option<Session>,
    /// The host execution thread.
    executor: HostExecutor,
}

impl HostContext {
    /// Create a context bound to a live session.
    pub fn new(session: Session, executor: HostExecutor) -> Self {
        Self {
            session: Some(session),
            executor,
        }
    }

    /// Create a context without a host connection (for testing).
    ///
    /// Notifications are dropped and requests fail with
    /// [`BridgeError::ConnectionClosed`].
    pub fn detached(executor: HostExecutor) -> Self {
        Self {
            session: None,
            executor,
        }
    }

    /// The session, if attached.
    #[inline]
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// The host execution thread.
    #[inline]
    pub fn executor(&self) -> &HostExecutor {
        &self.executor
    }

    /// Channel id assigned by the host.
    pub fn channel(&self) -> Option<i64> {
        self.session.as_ref().and_then(Session::channel)
    }

    fn attached(&self) -> Result<&Session> {
        self.session.as_ref().ok_or(BridgeError::ConnectionClosed)
    }

    /// Call a host API method and await the result.
    pub async fn request(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        self.attached()?.request(method, params).await
    }

    /// Call a host API method, blocking the current thread.
    pub fn request_blocking(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        self.attached()?.request_blocking(method, params)
    }

    /// Send a notification to the host.
    pub fn notify(&self, method: &str, params: Vec<Value>) -> Result<()> {
        match &self.session {
            Some(session) => session.notify(method, params),
            // No session configured (testing mode)
            None => Ok(()),
        }
    }

    /// Run a future on the host execution thread.
    pub fn spawn<F, T>(&self, fut: F) -> PendingFuture<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.executor.submit(fut)
    }

    /// Run a synchronous function on the host execution thread.
    pub fn call_soon<F, T>(&self, f: F) -> PendingFuture<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.executor.call_soon(f)
    }

    /// Read the global variable `g:name`.
    ///
    /// A host error (typically "Key not found") means the variable is
    /// absent and yields `None`.
    pub fn var(&self, name: &str) -> Option<Value> {
        match self.request_blocking("nvim_get_var", vec![Value::from(name)]) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::debug!(var = name, error = %e, "variable unavailable");
                None
            }
        }
    }
}
