//! Protocol module - msgpack-RPC messages and stream decoding.
//!
//! - [`RpcMessage`] - request / response / notification in wire form
//! - [`Message`] - inbound `(name, args)` handed to handlers
//! - [`MessageBuffer`] - accumulates partial reads into whole messages

mod message;
mod message_buffer;

pub use message::{Message, RpcMessage, NOTIFICATION, REQUEST, RESPONSE};
pub use message_buffer::{MessageBuffer, DEFAULT_BUFFER_CAPACITY, DEFAULT_MAX_MESSAGE_SIZE};
