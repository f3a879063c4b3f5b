//! Transport module - connecting to the host.
//!
//! Provides abstraction over:
//! - Unix Domain Sockets (Linux/macOS)
//! - Named Pipes (Windows)
//! - TCP
//! - Stdio (embedded host)

mod connect;

pub use connect::{connect, BoxedReader, BoxedWriter, ServerAddr, ADDRESS_ENV_VARS};
