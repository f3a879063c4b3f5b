//! Handler module - registration and invocation of host-callable procedures.
//!
//! Provides:
//! - [`CallableHandler`] - one procedure with its [`Mode`]
//! - [`HandlerRegistry`] - name → handler table, drained into host glue
//!
//! # Example
//!
//! ```ignore
//! use nvimwire::handler::{HandlerRegistry, Mode};
//!
//! let mut registry = HandlerRegistry::new();
//!
//! // Reply to the host
//! registry
//!     .register(Mode::Blocking, Some("Echo"))
//!     .plain(|_ctx, args| Ok(args.into_iter().next().unwrap_or(Value::Nil)))?;
//!
//! // Run later on the host execution thread
//! registry
//!     .register(Mode::Async, Some("Format"))
//!     .suspend(|ctx, _args| async move { ctx.request("nvim_command", vec!["w".into()]).await })?;
//! ```

mod callable;
mod registry;

pub use callable::{
    BoxFuture, CallableHandler, HandlerResult, Invocation, Mode, PlainFn, Procedure, SuspendFn,
};
pub use registry::{default_name_gen, HandlerRegistry, NameGen, Registration, RpcSpec};
