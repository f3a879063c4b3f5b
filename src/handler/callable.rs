//! A single host-invocable procedure and its invocation mode.
//!
//! Three execution contracts:
//! - [`Mode::Blocking`] - runs on the calling thread, result goes back to
//!   the host as the reply
//! - [`Mode::Async`] - a suspend-capable body submitted to the host
//!   execution thread; nobody waits for it
//! - [`Mode::Notify`] - a plain body scheduled onto the host execution
//!   thread, never run on the caller
//!
//! The mode/procedure pairing is checked once, in [`CallableHandler::new`].

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use rmpv::Value;

use crate::error::{BridgeError, Result};
use crate::host::{HostContext, PendingFuture};

/// Result type for handler bodies.
pub type HandlerResult = Result<Value>;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Synchronous handler body.
pub type PlainFn = Arc<dyn Fn(&HostContext, Vec<Value>) -> HandlerResult + Send + Sync>;

/// Suspend-capable handler body.
pub type SuspendFn =
    Arc<dyn Fn(HostContext, Vec<Value>) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// How the host reaches a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Request/response, run on the dispatching thread.
    Blocking,
    /// Fire-and-observe, run on the host execution thread.
    Async,
    /// Fire-and-forget, scheduled onto the host execution thread.
    Notify,
}

impl Mode {
    /// Whether the host waits for a reply.
    #[inline]
    pub fn is_blocking(self) -> bool {
        self == Mode::Blocking
    }
}

/// A handler body before it is paired with a mode.
#[derive(Clone)]
pub enum Procedure {
    /// Ordinary function.
    Plain(PlainFn),
    /// Function returning a future.
    Suspend(SuspendFn),
}

impl Procedure {
    /// Wrap a synchronous function.
    pub fn plain<F>(f: F) -> Self
    where
        F: Fn(&HostContext, Vec<Value>) -> HandlerResult + Send + Sync + 'static,
    {
        Procedure::Plain(Arc::new(f))
    }

    /// Wrap an async function.
    pub fn suspend<F, Fut>(f: F) -> Self
    where
        F: Fn(HostContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Procedure::Suspend(Arc::new(move |ctx, args| Box::pin(f(ctx, args))))
    }
}

impl fmt::Debug for Procedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Procedure::Plain(_) => f.write_str("Plain"),
            Procedure::Suspend(_) => f.write_str("Suspend"),
        }
    }
}

/// Validated mode + body pair.
#[derive(Clone)]
enum Body {
    Blocking(PlainFn),
    Async(SuspendFn),
    Notify(PlainFn),
}

/// Outcome of invoking a handler.
pub enum Invocation {
    /// The body already ran.
    Ready(HandlerResult),
    /// The body runs on the host execution thread.
    Pending(PendingFuture<Value>),
}

/// A named procedure with its invocation mode.
#[derive(Clone)]
pub struct CallableHandler {
    name: String,
    body: Body,
}

impl CallableHandler {
    /// Pair `procedure` with `mode` under `name`.
    ///
    /// Fails with [`BridgeError::InvalidHandlerSpec`] if the name is not an
    /// identifier (it is spliced into Lua and Vimscript source), if `Async` is given a plain body, or if `Blocking`/`Notify` is given
    /// a suspend-capable one.
    pub fn new(name: impl Into<String>, mode: Mode, procedure: Procedure) -> Result<Self> {
        let name = name.into();
        let invalid = |reason| BridgeError::InvalidHandlerSpec {
            name: name.clone(),
            reason,
        };

        if name.is_empty() {
            return Err(invalid("handler name must not be empty"));
        }
        if !is_identifier(&name) {
            return Err(invalid("handler name must be an identifier"));
        }

        let body = match (mode, procedure) {
            (Mode::Blocking, Procedure::Plain(f)) => Body::Blocking(f),
            (Mode::Notify, Procedure::Plain(f)) => Body::Notify(f),
            (Mode::Async, Procedure::Suspend(f)) => Body::Async(f),
            (Mode::Async, Procedure::Plain(_)) => {
                return Err(invalid("async handlers need a suspend-capable procedure"))
            }
            (Mode::Blocking, Procedure::Suspend(_)) => {
                return Err(invalid("blocking handlers cannot suspend"))
            }
            (Mode::Notify, Procedure::Suspend(_)) => {
                return Err(invalid("notify handlers take a plain procedure, use async instead"))
            }
        };

        Ok(Self { name, body })
    }

    /// Handler name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invocation mode.
    pub fn mode(&self) -> Mode {
        match self.body {
            Body::Blocking(_) => Mode::Blocking,
            Body::Async(_) => Mode::Async,
            Body::Notify(_) => Mode::Notify,
        }
    }

    /// Run the handler according to its mode.
    pub fn invoke(&self, ctx: &HostContext, args: Vec<Value>) -> Invocation {
        match &self.body {
            Body::Blocking(f) => Invocation::Ready(f(ctx, args)),
            Body::Async(f) => {
                let fut = f(ctx.clone(), args.clone());
                let name = self.name.clone();
                Invocation::Pending(ctx.spawn(async move {
                    let result = fut.await;
                    log_failure(&name, args, &result);
                    result
                }))
            }
            Body::Notify(f) => {
                let f = f.clone();
                let name = self.name.clone();
                let body_ctx = ctx.clone();
                Invocation::Pending(ctx.call_soon(move || {
                    let result = f(&body_ctx, args.clone());
                    log_failure(&name, args, &result);
                    result
                }))
            }
        }
    }
}

impl fmt::Debug for CallableHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallableHandler")
            .field("name", &self.name)
            .field("mode", &self.mode())
            .finish()
    }
}

fn log_failure(name: &str, args: Vec<Value>, result: &HandlerResult) {
    if let Err(e) = result {
        tracing::error!(handler = name, args = %rmpv::Value::Array(args), error = %e, "ERROR IN RPC FOR");
    }
}

/// ASCII letter or `_`, then letters, digits and `_`.
fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}
