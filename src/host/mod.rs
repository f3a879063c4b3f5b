//! Connection to the Neovim host.
//!
//! A [`Host`] owns the threads a plugin process needs:
//! - an I/O runtime running the session read loop and writer task
//! - the host execution thread ([`HostExecutor`]) for async work
//!
//! # Example
//!
//! ```ignore
//! use nvimwire::host::Host;
//! use nvimwire::transport::ServerAddr;
//! use nvimwire::BridgeConfig;
//!
//! let config = BridgeConfig::default();
//! let mut host = Host::connect(&ServerAddr::Stdio, &config)?;
//! let chan = host.handshake(&config)?;
//! ```

mod context;
mod executor;
mod session;

pub use context::HostContext;
pub use executor::{pending, HostExecutor, PendingFuture, Resolver};
pub use session::{EventSource, HostEvent, Session};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::runtime::{Builder, Runtime};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::transport::{connect, ServerAddr};

/// Name of the I/O runtime worker threads.
const IO_THREAD_NAME: &str = "nvimwire-io";

/// A live host connection plus the threads serving it.
pub struct Host {
    /// Runs the session read loop and writer task. Taken on drop.
    io: Option<Runtime>,
    executor: HostExecutor,
    session: Session,
    events: Option<EventSource>,
}

impl Host {
    /// Connect to the host at `addr`.
    pub fn connect(addr: &ServerAddr, config: &BridgeConfig) -> Result<Self> {
        let io = io_runtime()?;
        let (reader, writer) = io.block_on(connect(addr))?;
        tracing::debug!(%addr, "connected to host");
        Self::with_runtime(io, reader, writer, config)
    }

    /// Wrap an already connected stream.
    ///
    /// No handshake is performed; see [`Host::handshake`].
    pub fn from_stream<R, W>(reader: R, writer: W, config: &BridgeConfig) -> Result<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::with_runtime(io_runtime()?, reader, writer, config)
    }

    fn with_runtime<R, W>(io: Runtime, reader: R, writer: W, config: &BridgeConfig) -> Result<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let executor = HostExecutor::start(&config.host_thread_name)?;
        let (session, events) = Session::spawn(reader, writer, io.handle());
        Ok(Self {
            io: Some(io),
            executor,
            session,
            events: Some(events),
        })
    }

    /// Announce the client and return the channel id the host assigned.
    ///
    /// Blocks the calling thread; call before the run loop starts.
    pub fn handshake(&self, config: &BridgeConfig) -> Result<i64> {
        let io = self
            .io
            .as_ref()
            .ok_or_else(|| BridgeError::Shutdown("I/O runtime stopped".to_string()))?;
        io.block_on(self.session.handshake(config))
    }

    /// Context handed to handlers.
    pub fn context(&self) -> HostContext {
        HostContext::new(self.session.clone(), self.executor.clone())
    }

    /// The session with the host.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// The host execution thread.
    pub fn executor(&self) -> &HostExecutor {
        &self.executor
    }

    /// Take the inbound event stream. Only the first call succeeds.
    pub fn take_events(&mut self) -> Result<EventSource> {
        self.events
            .take()
            .ok_or_else(|| BridgeError::Protocol("host events already taken".to_string()))
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        // A blocking stdin read cannot be cancelled; waiting for it would
        // keep the process alive until the host writes again.
        if let Some(io) = self.io.take() {
            io.shutdown_background();
        }
    }
}

fn io_runtime() -> Result<Runtime> {
    Ok(Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name(IO_THREAD_NAME)
        .enable_all()
        .build()?)
}
