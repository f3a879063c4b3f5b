//! Registration table and host-side glue generation.
//!
//! Handlers are registered once at startup, then drained: every entry is
//! removed and turned into two pieces of host code, applied as a single
//! [`Atomic`] batch:
//! - a Lua global that forwards its arguments back to us over the channel
//!   (`vim.rpcrequest` for blocking handlers, `vim.rpcnotify` otherwise)
//! - a Vimscript function of the same name calling that Lua global
//!
//! # Example
//!
//! ```ignore
//! use nvimwire::handler::{HandlerRegistry, Mode};
//!
//! let mut registry = HandlerRegistry::new();
//!
//! registry
//!     .register(Mode::Blocking, Some("Echo"))
//!     .plain(|_ctx, args| Ok(args.into_iter().next().unwrap_or(Value::Nil)))?;
//!
//! let (atomic, specs) = registry.drain(chan);
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use rmpv::Value;

use super::callable::{CallableHandler, HandlerResult, Mode, Procedure};
use crate::atomic::Atomic;
use crate::error::{BridgeError, Result};
use crate::host::HostContext;

/// Turns a procedure's type path into a handler name.
pub type NameGen = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Drained handler, ready for the router.
pub type RpcSpec = (String, CallableHandler);

/// Default name generator.
///
/// `my_plugin::commands::reload` becomes `My_plugin_commands_reload`:
/// path separators and anything that is not an identifier character turn
/// into `_`, then the first letter is upper-cased and the rest lower-cased
/// since host user functions must start with a capital.
pub fn default_name_gen(type_path: &str) -> String {
    let flat: String = type_path
        .replace("::", "_")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();

    let mut chars = flat.chars();
    match chars.next() {
        Some(first) => first
            .to_uppercase()
            .chain(chars.flat_map(char::to_lowercase))
            .collect(),
        None => String::new(),
    }
}

/// Registry mapping handler names to handlers.
pub struct HandlerRegistry {
    /// Handlers by name.
    handlers: HashMap<String, CallableHandler>,
    /// Derives names for anonymous registrations.
    name_gen: NameGen,
    /// Set by the first drain.
    frozen: bool,
}

impl HandlerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::with_name_gen(default_name_gen)
    }

    /// Create a registry with a custom name generator.
    pub fn with_name_gen<G>(name_gen: G) -> Self
    where
        G: Fn(&str) -> String + Send + Sync + 'static,
    {
        Self {
            handlers: HashMap::new(),
            name_gen: Arc::new(name_gen),
            frozen: false,
        }
    }

    /// Start a registration.
    ///
    /// Without `name`, the handler is named after its procedure's type path.
    /// Every closure defined in one function shares that path, so closures
    /// need explicit names; a derived name that replaces an existing handler
    /// is logged as a warning. Registering a name twice keeps the later
    /// handler.
    pub fn register(&mut self, mode: Mode, name: Option<&str>) -> Registration<'_> {
        Registration {
            registry: self,
            mode,
            name: name.map(str::to_string),
        }
    }

    /// Store an already built handler.
    pub fn insert(&mut self, handler: CallableHandler) -> Result<()> {
        if self.frozen {
            return Err(BridgeError::RegistryFrozen(handler.name().to_string()));
        }
        if let Some(previous) = self.handlers.insert(handler.name().to_string(), handler) {
            tracing::debug!(handler = previous.name(), "replaced handler");
        }
        Ok(())
    }

    /// Get a handler by name.
    pub fn get(&self, name: &str) -> Option<&CallableHandler> {
        self.handlers.get(name)
    }

    /// Number of registered handlers.
    #[inline]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Check if no handler is registered.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Whether the registry has been drained.
    #[inline]
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Remove every handler and build the host glue installing them.
    ///
    /// `chan` is the channel id the host assigned to this process. The
    /// registry is frozen afterwards; draining again yields nothing.
    pub fn drain(&mut self, chan: i64) -> (Atomic, Vec<RpcSpec>) {
        self.frozen = true;

        let mut specs: Vec<RpcSpec> = self.handlers.drain().collect();
        specs.sort_by(|a, b| a.0.cmp(&b.0));

        let mut atomic = Atomic::new();
        for (_, handler) in &specs {
            atomic.exec_lua(&lua_glue(chan, handler), Vec::new());
            atomic.exec(&viml_glue(handler), false);
        }

        tracing::debug!(chan, count = specs.len(), "drained handler registry");
        (atomic, specs)
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Pending registration returned by [`HandlerRegistry::register`].
#[must_use = "a registration does nothing until given a procedure"]
pub struct Registration<'a> {
    registry: &'a mut HandlerRegistry,
    mode: Mode,
    name: Option<String>,
}

impl Registration<'_> {
    /// Register a synchronous procedure. Returns the handler name.
    pub fn plain<F>(self, f: F) -> Result<String>
    where
        F: Fn(&HostContext, Vec<Value>) -> HandlerResult + Send + Sync + 'static,
    {
        let type_path = std::any::type_name::<F>();
        self.finish(type_path, Procedure::plain(f))
    }

    /// Register an async procedure. Returns the handler name.
    pub fn suspend<F, Fut>(self, f: F) -> Result<String>
    where
        F: Fn(HostContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let type_path = std::any::type_name::<F>();
        self.finish(type_path, Procedure::suspend(f))
    }

    fn finish(self, type_path: &str, procedure: Procedure) -> Result<String> {
        let derived = self.name.is_none();
        let name = match self.name {
            Some(name) => name,
            None => (self.registry.name_gen)(type_path),
        };
        if self.registry.frozen {
            return Err(BridgeError::RegistryFrozen(name));
        }
        if derived && self.registry.handlers.contains_key(&name) {
            tracing::warn!(
                handler = %name,
                type_path,
                "derived handler name replaces an existing handler"
            );
        }

        let handler = CallableHandler::new(name.clone(), self.mode, procedure)?;
        self.registry.insert(handler)?;
        Ok(name)
    }
}

fn lua_glue(chan: i64, handler: &CallableHandler) -> String {
    let op = if handler.mode().is_blocking() {
        "rpcrequest"
    } else {
        "rpcnotify"
    };
    format!(
        "{name} = function (...) return vim.{op}({chan}, '{name}', {{...}}) end",
        name = handler.name(),
        op = op,
        chan = chan,
    )
}

fn viml_glue(handler: &CallableHandler) -> String {
    format!(
        "function! {name}(...)\n  return luaeval('_G[\"{name}\"](unpack(_A))', a:000)\nendfunction",
        name = handler.name(),
    )
}
