//! Error types for nvimwire.

use thiserror::Error;

/// Main error type for all nvimwire operations.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// I/O error on the host connection.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error (typed).
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// MsgPack deserialization error (dynamic value).
    #[error("MsgPack value error: {0}")]
    MsgPackValue(#[from] rmpv::decode::Error),

    /// Malformed msgpack-RPC message.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Handler mode and procedure do not fit together.
    #[error("Invalid handler spec for {name:?}: {reason}")]
    InvalidHandlerSpec {
        /// Handler name as requested at registration.
        name: String,
        /// What was wrong.
        reason: &'static str,
    },

    /// Registration attempted after the registry was drained.
    #[error("Registry is frozen, cannot register {0:?}")]
    RegistryFrozen(String),

    /// No handler registered under this name.
    #[error("No handler registered for {0:?}")]
    UnregisteredProcedure(String),

    /// Failure raised by a handler body.
    #[error("{0}")]
    Handler(String),

    /// A handler failed while being dispatched.
    #[error("Handler {name:?} failed for args {args}: {source}")]
    HandlerExecution {
        /// Handler name.
        name: String,
        /// Arguments the handler was called with, rendered.
        args: String,
        /// Underlying failure.
        #[source]
        source: Box<BridgeError>,
    },

    /// The host answered a request with an error.
    #[error("Host error: {0}")]
    Host(String),

    /// The wait path or the host execution context failed.
    #[error("Shutdown failure: {0}")]
    Shutdown(String),

    /// Connection to the host closed.
    #[error("Connection closed")]
    ConnectionClosed,
}

impl BridgeError {
    /// Build a handler failure from any displayable message.
    pub fn handler(message: impl std::fmt::Display) -> Self {
        BridgeError::Handler(message.to_string())
    }
}

/// Result type alias using BridgeError.
pub type Result<T> = std::result::Result<T, BridgeError>;
