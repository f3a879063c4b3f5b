//! Log bridge into the host's message area.
//!
//! [`HostLogLayer`] is a `tracing_subscriber` layer that mirrors events
//! into Neovim with `nvim_echo` once a host is attached. Attaching happens
//! when the run loop starts; until then the layer is inert.
//!
//! # Example
//!
//! ```ignore
//! nvimwire::logging::init();
//!
//! // later, once connected
//! nvimwire::logging::attach(host.context(), tracing::Level::WARN);
//! tracing::warn!("visible in :messages");
//! ```

use std::cell::Cell;
use std::fmt::Write as _;

use parking_lot::RwLock;
use rmpv::Value;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::host::HostContext;

/// Environment variable holding the log filter directives.
pub const LOG_ENV: &str = "NVIMWIRE_LOG";

/// Filter used when [`LOG_ENV`] is unset or invalid.
pub const DEFAULT_FILTER: &str = "warn";

struct Sink {
    ctx: HostContext,
    level: Level,
}

static SINK: RwLock<Option<Sink>> = parking_lot::const_rwlock(None);

thread_local! {
    static FORWARDING: Cell<bool> = const { Cell::new(false) };
}

/// Start forwarding events at `level` or above to the host behind `ctx`.
pub fn attach(ctx: HostContext, level: Level) {
    *SINK.write() = Some(Sink { ctx, level });
}

/// Stop forwarding events to the host.
pub fn detach() {
    SINK.write().take();
}

/// Whether a host is attached.
pub fn is_attached() -> bool {
    SINK.read().is_some()
}

/// Install the global subscriber: env filter, stderr output, host bridge.
///
/// Returns `false` if a global subscriber was already set.
pub fn init() -> bool {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(HostLogLayer::new())
        .try_init()
        .is_ok()
}

/// Layer forwarding events to the attached host.
///
/// [`HostLogLayer::new`] follows the process-wide [`attach`]/[`detach`]
/// state; [`HostLogLayer::bound`] always forwards to one context.
#[derive(Default)]
pub struct HostLogLayer {
    bound: Option<Sink>,
}

impl HostLogLayer {
    /// Create a layer following [`attach`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a layer tied to `ctx`.
    pub fn bound(ctx: HostContext, level: Level) -> Self {
        Self {
            bound: Some(Sink { ctx, level }),
        }
    }
}

impl<S: Subscriber> Layer<S> for HostLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        // Sending to the host may log; never feed that back in
        if FORWARDING.with(Cell::get) {
            return;
        }

        match &self.bound {
            Some(sink) => sink.forward(event),
            None => {
                if let Some(sink) = SINK.read().as_ref() {
                    sink.forward(event);
                }
            }
        }
    }
}

impl Sink {
    fn forward(&self, event: &Event<'_>) {
        let level = *event.metadata().level();
        if level > self.level {
            return;
        }

        let mut visitor = EchoVisitor::default();
        event.record(&mut visitor);

        FORWARDING.with(|f| f.set(true));
        let _ = self.ctx.notify("nvim_echo", echo_params(&visitor.finish(), level));
        FORWARDING.with(|f| f.set(false));
    }
}

/// Highlight group used for a level.
pub fn highlight_for(level: Level) -> &'static str {
    match level {
        Level::ERROR => "ErrorMsg",
        Level::WARN => "WarningMsg",
        _ => "Normal",
    }
}

fn echo_params(text: &str, level: Level) -> Vec<Value> {
    let chunk = Value::Array(vec![Value::from(text), Value::from(highlight_for(level))]);
    vec![Value::Array(vec![chunk]), Value::from(true), Value::Map(Vec::new())]
}

/// Renders `message key=value ...`.
#[derive(Default)]
struct EchoVisitor {
    message: String,
    fields: String,
}

impl EchoVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else {
            format!("{}{}", self.message, self.fields)
        }
    }
}

impl Visit for EchoVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }
}
