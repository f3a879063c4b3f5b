//! Client run loop.
//!
//! The [`RunLoop`] manages the lifecycle of a plugin process:
//! 1. Attach the log bridge to the host
//! 2. Spawn the listener thread pumping host events into the client
//! 3. Submit the client's `wait` to the host execution thread
//! 4. Block the calling thread until `wait` resolves or the host goes away
//!
//! # Example
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
//!     let code = match RunLoopBuilder::new(registry).connect(&addr) {
//!         Ok(run_loop) => run_loop.main(),
//!         Err(_) => 1,
//!     };
//!     std::process::exit(code);
//! }
//! ```

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rmpv::Value;

use crate::client::{Client, MessageRouter, Shutdown};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::handler::HandlerRegistry;
use crate::host::{EventSource, Host, HostContext, HostEvent};
use crate::logging;
use crate::transport::ServerAddr;

/// Lifecycle of a [`RunLoop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Built, not started.
    Idle,
    /// Listener running, foreground blocked on `wait`.
    Listening,
    /// `wait` resolved, tearing down.
    Draining,
    /// Done.
    Stopped,
}

/// Builder wiring a [`HandlerRegistry`] to a host connection.
///
/// Use the fluent API to adjust the configuration, then `connect()` (or
/// `attach()` an existing [`Host`]) to handshake and install handlers.
pub struct RunLoopBuilder {
    registry: HandlerRegistry,
    config: BridgeConfig,
    shutdown: Option<Shutdown>,
}

impl RunLoopBuilder {
    /// Create a builder over a populated registry.
    pub fn new(registry: HandlerRegistry) -> Self {
        Self {
            registry,
            config: BridgeConfig::default(),
            shutdown: None,
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: BridgeConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the client name announced to the host.
    ///
    /// Default: the crate name
    pub fn client_name(mut self, name: &str) -> Self {
        self.config.client_name = name.to_string();
        self
    }

    /// Set the minimum level mirrored into the host.
    ///
    /// Default: WARN
    pub fn bridge_level(mut self, level: tracing::Level) -> Self {
        self.config.bridge_level = level;
        self
    }

    /// Set how long `wait` may block before resolving with 1.
    pub fn wait_limit(mut self, limit: Duration) -> Self {
        self.config.wait_limit = limit;
        self
    }

    /// Share a shutdown cell with the router.
    pub fn shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Connect to the host at `addr` and build the run loop.
    pub fn connect(self, addr: &ServerAddr) -> Result<RunLoop<MessageRouter>> {
        let host = Host::connect(addr, &self.config)?;
        self.attach(host)
    }

    /// Build the run loop over an existing connection.
    ///
    /// This will:
    /// 1. Handshake to learn the channel id
    /// 2. Drain the registry into host glue
    /// 3. Commit the glue as one atomic batch
    pub fn attach(mut self, host: Host) -> Result<RunLoop<MessageRouter>> {
        let chan = host.handshake(&self.config)?;

        let (mut atomic, specs) = self.registry.drain(chan);
        atomic.commit_blocking(&host.context())?;
        tracing::debug!(chan, handlers = specs.len(), "handlers installed");

        let mut router = MessageRouter::new(specs).wait_limit(self.config.wait_limit);
        if let Some(shutdown) = self.shutdown {
            router = router.with_shutdown(shutdown);
        }
        Ok(RunLoop::new(host, router, self.config))
    }
}

/// Listener thread plus foreground wait over one host connection.
pub struct RunLoop<C: Client> {
    host: Host,
    client: Arc<C>,
    config: BridgeConfig,
    state: RunState,
}

impl<C: Client> RunLoop<C> {
    /// Create an idle run loop.
    pub fn new(host: Host, client: C, config: BridgeConfig) -> Self {
        Self {
            host,
            client: Arc::new(client),
            config,
            state: RunState::Idle,
        }
    }

    /// Current lifecycle state.
    #[inline]
    pub fn state(&self) -> RunState {
        self.state
    }

    /// The client receiving host messages.
    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    /// Context bound to this loop's host.
    pub fn context(&self) -> HostContext {
        self.host.context()
    }

    /// Run until `wait` resolves or the host disconnects.
    ///
    /// Returns the exit code from `wait`, 0 if the host closed the
    /// connection first, and [`BridgeError::Shutdown`] if the connection
    /// failed. Blocks the calling thread; must not be called from async code.
    pub fn run(&mut self) -> Result<i32> {
        if self.state != RunState::Idle {
            return Err(BridgeError::Shutdown("run loop already started".to_string()));
        }

        let ctx = self.host.context();
        let events = self.host.take_events()?;
        spawn_listener(
            &self.config.listener_thread_name,
            events,
            ctx.clone(),
            self.client.clone(),
        )?;
        logging::attach(ctx.clone(), self.config.bridge_level);
        self.state = RunState::Listening;

        let client = self.client.clone();
        let session = self.host.session().clone();
        let wait_ctx = ctx.clone();
        let outcome = ctx
            .spawn(async move {
                tokio::select! {
                    biased;
                    result = client.wait(wait_ctx) => result,
                    link = session.closed() => {
                        tracing::debug!("host disconnected");
                        link.map(|()| 0)
                    }
                }
            })
            .wait();
        self.state = RunState::Draining;

        let result = outcome.map_err(|e| {
            tracing::error!(error = %e, "ERROR IN WAIT");
            match e {
                BridgeError::Shutdown(_) => e,
                other => BridgeError::Shutdown(other.to_string()),
            }
        });

        logging::detach();
        self.state = RunState::Stopped;
        result
    }

    /// Run and turn the outcome into a process exit code.
    pub fn main(mut self) -> i32 {
        match self.run() {
            Ok(code) => code,
            Err(_) => 1,
        }
    }
}

impl RunLoop<MessageRouter> {
    /// Handle to end `wait` with an exit code.
    pub fn shutdown(&self) -> Shutdown {
        self.client.shutdown()
    }
}

fn spawn_listener<C: Client>(
    name: &str,
    events: EventSource,
    ctx: HostContext,
    client: Arc<C>,
) -> Result<()> {
    // Never joined: ends when the event source closes.
    thread::Builder::new().name(name.to_string()).spawn(move || {
        events.pump(move |event| handle_event(&ctx, client.as_ref(), event));
        tracing::debug!("event source closed, listener exiting");
    })?;
    Ok(())
}

fn handle_event<C: Client>(ctx: &HostContext, client: &C, event: HostEvent) {
    match event {
        HostEvent::Notification(message) => {
            if let Err(e) = client.on_msg(ctx, message) {
                report(&e);
            }
        }
        HostEvent::Request { msgid, message } => {
            let reply = match client.on_msg(ctx, message) {
                Ok(value) => Ok(value.unwrap_or(Value::Nil)),
                Err(e) => {
                    report(&e);
                    Err(e.to_string())
                }
            };
            if let Some(session) = ctx.session() {
                if let Err(e) = session.respond(msgid, reply) {
                    tracing::debug!(msgid, error = %e, "failed to send reply");
                }
            }
        }
    }
}

fn report(e: &BridgeError) {
    // The router already logged these with name and args
    if !matches!(e, BridgeError::HandlerExecution { .. }) {
        tracing::error!(error = %e, "ERROR IN RPC");
    }
}
