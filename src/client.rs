//! Message routing and the shutdown wait.
//!
//! A [`Client`] is what the run loop drives: every inbound host message
//! goes through [`Client::on_msg`], and the run loop's foreground thread
//! parks on [`Client::wait`]. [`MessageRouter`] is the stock client: a
//! table of drained handlers plus a [`Shutdown`] cell.
//!
//! # Example
//!
//! ```ignore
//! use nvimwire::client::MessageRouter;
//!
//! let (atomic, specs) = registry.drain(chan);
//! let router = MessageRouter::new(specs);
//! let shutdown = router.shutdown();
//!
//! // elsewhere: end the run loop with exit code 0
//! shutdown.trigger(0);
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rmpv::Value;
use tokio::sync::watch;

use crate::config::DEFAULT_WAIT_LIMIT;
use crate::error::{BridgeError, Result};
use crate::handler::{BoxFuture, CallableHandler, Invocation, RpcSpec};
use crate::host::HostContext;
use crate::protocol::Message;

/// Receiver of host messages, driven by the run loop.
pub trait Client: Send + Sync + 'static {
    /// Handle one inbound message.
    ///
    /// `Some(value)` is the reply for requests; `None` replies nil.
    fn on_msg(&self, ctx: &HostContext, msg: Message) -> Result<Option<Value>>;

    /// Resolve with the process exit code once the client is done.
    ///
    /// Runs on the host execution thread.
    fn wait(&self, ctx: HostContext) -> BoxFuture<'static, Result<i32>>;
}

/// Single-assignment exit code shared between `wait` and whoever ends it.
#[derive(Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<Option<i32>>>,
}

impl Shutdown {
    /// Create an untriggered cell.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Resolve with `code`. Only the first trigger counts.
    pub fn trigger(&self, code: i32) -> bool {
        self.tx.send_if_modified(|slot| match slot {
            Some(_) => false,
            None => {
                *slot = Some(code);
                true
            }
        })
    }

    /// The exit code, if triggered.
    pub fn code(&self) -> Option<i32> {
        *self.tx.borrow()
    }

    /// Wait until triggered.
    pub async fn wait(&self) -> i32 {
        let mut rx = self.tx.subscribe();
        let code = rx
            .wait_for(Option::is_some)
            .await
            .map(|code| (*code).unwrap_or_default());
        match code {
            Ok(code) => code,
            // The sender lives in `self`
            Err(_) => std::future::pending().await,
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Dispatch table built from drained handlers.
pub struct MessageRouter {
    handlers: HashMap<String, CallableHandler>,
    shutdown: Shutdown,
    wait_limit: Duration,
}

impl MessageRouter {
    /// Build a router over drained handlers.
    pub fn new(specs: Vec<RpcSpec>) -> Self {
        Self {
            handlers: specs.into_iter().collect(),
            shutdown: Shutdown::new(),
            wait_limit: DEFAULT_WAIT_LIMIT,
        }
    }

    /// Set how long `wait` sleeps before resolving with 1 on its own.
    pub fn wait_limit(mut self, limit: Duration) -> Self {
        self.wait_limit = limit;
        self
    }

    /// Share an existing shutdown cell.
    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Handle to end `wait`.
    pub fn shutdown(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Get a handler by name.
    pub fn handler(&self, name: &str) -> Option<&CallableHandler> {
        self.handlers.get(name)
    }

    /// Route `msg` to its handler.
    ///
    /// Unknown names are logged and answered with `None`. Deferred
    /// invocations (async and notify handlers) also yield `None`. A failing
    /// blocking handler is logged with its name and arguments, then
    /// reported as [`BridgeError::HandlerExecution`].
    pub fn dispatch(&self, ctx: &HostContext, msg: Message) -> Result<Option<Value>> {
        let Message { name, args } = msg;

        let Some(handler) = self.handlers.get(&name) else {
            warn_missing(&name, args);
            return Ok(None);
        };

        tracing::trace!(handler = %name, mode = ?handler.mode(), "dispatch");
        let rendered = Value::Array(args.clone());

        match handler.invoke(ctx, args) {
            Invocation::Pending(_) => Ok(None),
            Invocation::Ready(Ok(value)) => Ok(Some(value)),
            Invocation::Ready(Err(e)) => {
                tracing::error!(handler = %name, args = %rendered, error = %e, "ERROR IN RPC FOR");
                Err(BridgeError::HandlerExecution {
                    name,
                    args: rendered.to_string(),
                    source: Box::new(e),
                })
            }
        }
    }
}

impl Client for MessageRouter {
    fn on_msg(&self, ctx: &HostContext, msg: Message) -> Result<Option<Value>> {
        self.dispatch(ctx, msg)
    }

    fn wait(&self, _ctx: HostContext) -> BoxFuture<'static, Result<i32>> {
        let shutdown = self.shutdown.clone();
        let limit = self.wait_limit;
        Box::pin(async move {
            tokio::select! {
                code = shutdown.wait() => Ok(code),
                _ = tokio::time::sleep(limit) => Ok(1),
            }
        })
    }
}

/// Stand-in for names nobody registered: warn and return nil.
/// Stand-in for unregistered procedures: log and answer nil.
fn warn_missing(name: &str, args: Vec<Value>) {
    let missing = BridgeError::UnregisteredProcedure(name.to_string());
    tracing::warn!(
        error = %missing,
        "MISSING RPC HANDLER FOR: {} - {}",
        name,
        rmpv::Value::Array(args)
    );
}
