//! # nvimwire
//!
//! Remote plugin host for Neovim over msgpack-RPC.
//!
//! This crate lets a Rust process register procedures that Neovim can call
//! as if they were native functions, and call back into Neovim from them.
//!
//! ## Architecture
//!
//! - **Registry**: handlers are registered at startup, then drained into
//!   Lua/Vimscript glue installed with one atomic batch
//! - **Listener thread**: pumps host requests and notifications into the
//!   [`MessageRouter`]; blocking handlers run here
//! - **Host execution thread**: async and notify handlers plus the
//!   shutdown wait run here, one at a time
//! - **I/O runtime**: msgpack-RPC read loop and writer task
//!
//! ## Example
//!
//! ```ignore
//! use nvimwire::handler::{HandlerRegistry, Mode};
//! use nvimwire::transport::ServerAddr;
//! use nvimwire::RunLoopBuilder;
//!
//! fn main() {
//!     nvimwire::logging::init();
//!
//!     let mut registry = HandlerRegistry::new();
//!     registry
//!         .register(Mode::Blocking, Some("Echo"))
//!         .plain(|_ctx, args| Ok(args.into_iter().next().unwrap_or(Value::Nil)))
//!         .unwrap();
//!
//!     let addr = ServerAddr::from_env().unwrap_or(ServerAddr::Stdio);
//!     let run_loop = RunLoopBuilder::new(registry).connect(&addr).unwrap();
//!     std::process::exit(run_loop.main());
//! }
//! ```

pub mod atomic;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod handler;
pub mod host;
pub mod logging;
pub mod protocol;
pub mod run_loop;
pub mod transport;

mod writer;

pub use atomic::Atomic;
pub use client::{Client, MessageRouter, Shutdown};
pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
pub use handler::{CallableHandler, HandlerRegistry, Mode};
pub use host::{Host, HostContext};
pub use rmpv::Value;
pub use run_loop::{RunLoop, RunLoopBuilder, RunState};
