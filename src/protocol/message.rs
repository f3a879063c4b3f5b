//! msgpack-RPC message model.
//!
//! Wire shapes:
//! - request: `[0, msgid, method, params]`
//! - response: `[1, msgid, error, result]`
//! - notification: `[2, method, params]`

use rmpv::Value;

use crate::error::{BridgeError, Result};

/// Message type tag for requests.
pub const REQUEST: u64 = 0;
/// Message type tag for responses.
pub const RESPONSE: u64 = 1;
/// Message type tag for notifications.
pub const NOTIFICATION: u64 = 2;

/// A single msgpack-RPC message in either direction.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcMessage {
    /// Call expecting a response.
    Request {
        /// Correlation id.
        msgid: u64,
        /// Method name.
        method: String,
        /// Positional parameters.
        params: Vec<Value>,
    },
    /// Answer to a request.
    Response {
        /// Correlation id of the request.
        msgid: u64,
        /// Nil on success.
        error: Value,
        /// Nil on failure.
        result: Value,
    },
    /// Fire-and-forget call.
    Notification {
        /// Method name.
        method: String,
        /// Positional parameters.
        params: Vec<Value>,
    },
}

impl RpcMessage {
    /// Convert into the array form sent on the wire.
    pub fn into_value(self) -> Value {
        match self {
            RpcMessage::Request {
                msgid,
                method,
                params,
            } => Value::Array(vec![
                Value::from(REQUEST),
                Value::from(msgid),
                Value::from(method),
                Value::Array(params),
            ]),
            RpcMessage::Response {
                msgid,
                error,
                result,
            } => Value::Array(vec![Value::from(RESPONSE), Value::from(msgid), error, result]),
            RpcMessage::Notification { method, params } => Value::Array(vec![
                Value::from(NOTIFICATION),
                Value::from(method),
                Value::Array(params),
            ]),
        }
    }

    /// Parse the array form received from the wire.
    pub fn from_value(value: Value) -> Result<Self> {
        let items = match value {
            Value::Array(items) => items,
            other => {
                return Err(BridgeError::Protocol(format!(
                    "expected message array, got {}",
                    other
                )))
            }
        };

        let mut items = items.into_iter();
        let kind = items
            .next()
            .and_then(|v| v.as_u64())
            .ok_or_else(|| BridgeError::Protocol("missing message type".to_string()))?;

        match (kind, items.len()) {
            (REQUEST, 3) => {
                let msgid = next_u64(&mut items, "msgid")?;
                let method = next_string(&mut items)?;
                let params = next_params(&mut items)?;
                Ok(RpcMessage::Request {
                    msgid,
                    method,
                    params,
                })
            }
            (RESPONSE, 3) => {
                let msgid = next_u64(&mut items, "msgid")?;
                let error = items.next().unwrap_or(Value::Nil);
                let result = items.next().unwrap_or(Value::Nil);
                Ok(RpcMessage::Response {
                    msgid,
                    error,
                    result,
                })
            }
            (NOTIFICATION, 2) => {
                let method = next_string(&mut items)?;
                let params = next_params(&mut items)?;
                Ok(RpcMessage::Notification { method, params })
            }
            (kind, len) => Err(BridgeError::Protocol(format!(
                "unexpected message type {} with {} fields",
                kind,
                len + 1
            ))),
        }
    }
}

fn next_u64(items: &mut impl Iterator<Item = Value>, what: &str) -> Result<u64> {
    items
        .next()
        .and_then(|v| v.as_u64())
        .ok_or_else(|| BridgeError::Protocol(format!("invalid {}", what)))
}

fn next_string(items: &mut impl Iterator<Item = Value>) -> Result<String> {
    match items.next() {
        Some(Value::String(s)) => s
            .into_str()
            .ok_or_else(|| BridgeError::Protocol("method name is not UTF-8".to_string())),
        Some(Value::Binary(b)) => String::from_utf8(b)
            .map_err(|_| BridgeError::Protocol("method name is not UTF-8".to_string())),
        _ => Err(BridgeError::Protocol("invalid method name".to_string())),
    }
}

fn next_params(items: &mut impl Iterator<Item = Value>) -> Result<Vec<Value>> {
    match items.next() {
        Some(Value::Array(params)) => Ok(params),
        Some(Value::Nil) | None => Ok(Vec::new()),
        Some(other) => Ok(vec![other]),
    }
}

/// An inbound call addressed to a handler: `(name, args)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Procedure name.
    pub name: String,
    /// Ordered arguments.
    pub args: Vec<Value>,
}

impl Message {
    /// Create a message from a name and arguments.
    pub fn new(name: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    /// Build a message from raw RPC params.
    ///
    /// Only the first argument group is consumed. The generated host glue
    /// always sends its arguments packed as one array.
    pub fn from_params(name: impl Into<String>, params: Vec<Value>) -> Self {
        let args = match params.into_iter().next() {
            Some(Value::Array(args)) => args,
            Some(single) => vec![single],
            None => Vec::new(),
        };
        Self::new(name, args)
    }
}
