//! Buffer for accumulating partial reads into whole RPC messages.
//!
//! msgpack carries no length prefix, so the buffer walks value headers to
//! find where the message at its front ends. The walk resumes where the
//! previous read stopped; a message is decoded once, when all of its bytes
//! are present.
//!
//! # Example
//!
//! ```ignore
//! use nvimwire::protocol::MessageBuffer;
//!
//! let mut buffer = MessageBuffer::new();
//! for message in buffer.push(&chunk)? {
//!     println!("{:?}", message);
//! }
//! ```

use bytes::BytesMut;

use super::RpcMessage;
use crate::error::{BridgeError, Result};

/// Default read capacity (64KB).
pub const DEFAULT_BUFFER_CAPACITY: usize = 64 * 1024;

/// Default upper bound for a single buffered message (256MB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 256 * 1024 * 1024;

/// Buffer for incoming bytes that yields complete [`RpcMessage`]s.
pub struct MessageBuffer {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Maximum bytes held while waiting for one message to complete.
    max_message_size: usize,
    /// Progress through the message at the front of `buffer`.
    scan: Scan,
}

/// Resumable walk over the headers of one msgpack value.
#[derive(Debug, Clone, Copy)]
struct Scan {
    /// Bytes of the current message already walked.
    pos: usize,
    /// Values still to walk before the message is complete.
    todo: u64,
}

impl Scan {
    const fn start() -> Self {
        Self { pos: 0, todo: 1 }
    }

    /// Advance over `data`. Returns the message length once complete.
    fn advance(&mut self, data: &[u8]) -> Result<Option<usize>> {
        while self.todo > 0 {
            let Some(&marker) = data.get(self.pos) else {
                return Ok(None);
            };
            let Some((len, items)) = item_size(marker, &data[self.pos..])? else {
                return Ok(None);
            };
            if data.len() - self.pos < len {
                return Ok(None);
            }
            self.pos += len;
            self.todo = self.todo - 1 + items;
        }
        Ok(Some(self.pos))
    }
}

/// Encoded size of the value starting at `data[0]`, minus nested items,
/// plus the number of nested items it opens. `None` if the header itself
/// is incomplete.
fn item_size(marker: u8, data: &[u8]) -> Result<Option<(usize, u64)>> {
    // Big-endian length field of `width` bytes after the marker.
    let field = |width: usize| -> Option<u64> {
        data.get(1..1 + width)
            .map(|bytes| bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
    };
    let sized = |width: usize, extra: usize| {
        field(width).map(|n| (1 + width + extra + n as usize, 0))
    };
    let container = |width: usize, per_entry: u64| {
        field(width).map(|n| (1 + width, n * per_entry))
    };

    let size = match marker {
        0x00..=0x7f | 0xe0..=0xff | 0xc0 | 0xc2 | 0xc3 => Some((1, 0)),
        0x80..=0x8f => Some((1, u64::from(marker & 0x0f) * 2)),
        0x90..=0x9f => Some((1, u64::from(marker & 0x0f))),
        0xa0..=0xbf => Some((1 + usize::from(marker & 0x1f), 0)),
        0xc4 | 0xd9 => sized(1, 0),
        0xc5 | 0xda => sized(2, 0),
        0xc6 | 0xdb => sized(4, 0),
        0xc7 => sized(1, 1),
        0xc8 => sized(2, 1),
        0xc9 => sized(4, 1),
        0xcc | 0xd0 => Some((2, 0)),
        0xcd | 0xd1 => Some((3, 0)),
        0xca | 0xce | 0xd2 => Some((5, 0)),
        0xcb | 0xcf | 0xd3 => Some((9, 0)),
        0xd4 => Some((3, 0)),
        0xd5 => Some((4, 0)),
        0xd6 => Some((6, 0)),
        0xd7 => Some((10, 0)),
        0xd8 => Some((18, 0)),
        0xdc => container(2, 1),
        0xdd => container(4, 1),
        0xde => container(2, 2),
        0xdf => container(4, 2),
        0xc1 => {
            return Err(BridgeError::Protocol(
                "reserved msgpack marker 0xc1".to_string(),
            ))
        }
    };
    Ok(size)
}

impl MessageBuffer {
    /// Create a new buffer with default settings.
    pub fn new() -> Self {
        Self::with_max_message(DEFAULT_MAX_MESSAGE_SIZE)
    }

    /// Create a new buffer with a custom maximum message size.
    pub fn with_max_message(max_message_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(DEFAULT_BUFFER_CAPACITY),
            max_message_size,
            scan: Scan::start(),
        }
    }

    /// Push data into the buffer and extract all complete messages.
    ///
    /// # Errors
    ///
    /// Returns error on malformed msgpack, on a message that is not a valid
    /// RPC message, or when an incomplete message outgrows the size limit.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<RpcMessage>> {
        self.buffer.extend_from_slice(data);

        let mut messages = Vec::new();
        while let Some(message) = self.try_extract_one()? {
            messages.push(message);
        }

        if self.buffer.len() > self.max_message_size {
            return Err(BridgeError::Protocol(format!(
                "Message size {} exceeds maximum {}",
                self.buffer.len(),
                self.max_message_size
            )));
        }

        Ok(messages)
    }

    /// Try to extract a single message from the front of the buffer.
    fn try_extract_one(&mut self) -> Result<Option<RpcMessage>> {
        let Some(end) = self.scan.advance(&self.buffer)? else {
            return Ok(None);
        };
        self.scan = Scan::start();

        let message = self.buffer.split_to(end);
        let value = rmpv::decode::read_value(&mut &message[..])?;
        RpcMessage::from_value(value).map(Some)
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Drop any buffered bytes.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.scan = Scan::start();
    }
}

impl Default for MessageBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MsgPackCodec;
    use rmpv::Value;

    fn notification_bytes(method: &str, arg: &str) -> Vec<u8> {
        let msg = RpcMessage::Notification {
            method: method.to_string(),
            params: vec![Value::Array(vec![Value::from(arg)])],
        };
        MsgPackCodec::encode(&msg.into_value()).unwrap()
    }

    #[test]
    fn test_single_complete_message() {
        let mut buffer = MessageBuffer::new();
        let messages = buffer.push(&notification_bytes("save", "a")).unwrap();

        assert_eq!(messages.len(), 1);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_multiple_messages_in_one_push() {
        let mut buffer = MessageBuffer::new();

        let mut combined = notification_bytes("one", "1");
        combined.extend(notification_bytes("two", "2"));
        combined.extend(notification_bytes("three", "3"));

        let messages = buffer.push(&combined).unwrap();
        let names: Vec<_> = messages
            .iter()
            .map(|m| match m {
                RpcMessage::Notification { method, .. } => method.as_str(),
                _ => "",
            })
            .collect();

        assert_eq!(names, vec!["one", "two", "three"]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_fragmented_message() {
        let mut buffer = MessageBuffer::new();
        let bytes = notification_bytes("fragmented", "payload that spans reads");
        let mid = bytes.len() / 2;

        assert!(buffer.push(&bytes[..mid]).unwrap().is_empty());
        assert_eq!(buffer.len(), mid);

        let messages = buffer.push(&bytes[mid..]).unwrap();
        assert_eq!(messages.len(), 1);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_mixed_complete_and_partial() {
        let mut buffer = MessageBuffer::new();
        let first = notification_bytes("first", "x");
        let second = notification_bytes("second", "y");

        let mut data = first.clone();
        data.extend_from_slice(&second[..3]);

        assert_eq!(buffer.push(&data).unwrap().len(), 1);
        assert_eq!(buffer.len(), 3);

        assert_eq!(buffer.push(&second[3..]).unwrap().len(), 1);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut buffer = MessageBuffer::new();
        let bytes = notification_bytes("echo", "hi");

        let mut all = Vec::new();
        for byte in &bytes {
            all.extend(buffer.push(&[*byte]).unwrap());
        }

        assert_eq!(all.len(), 1);
    }

    #[test]
    fn test_max_message_validation() {
        let mut buffer = MessageBuffer::with_max_message(8);
        let bytes = notification_bytes("too_long_to_buffer", "zzzzzzzzzzzzzzzz");

        let result = buffer.push(&bytes[..bytes.len() - 1]);
        assert!(result.unwrap_err().to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_non_rpc_value_is_protocol_error() {
        let mut buffer = MessageBuffer::new();
        let bytes = MsgPackCodec::encode(&"just a string").unwrap();

        assert!(matches!(
            buffer.push(&bytes),
            Err(BridgeError::Protocol(_))
        ));
    }

    #[test]
    fn test_partial_message_is_walked_once() {
        let mut buffer = MessageBuffer::new();
        let payload = "x".repeat(300 * 1024);
        let bytes = notification_bytes("large", &payload);
        let (head, tail) = bytes.split_at(bytes.len() - 10);

        // Header bytes of the notification, its method and the
        // argument array are walked; the long string is waiting for data
        assert!(buffer.push(&head[..64 * 1024]).unwrap().is_empty());
        let walked = buffer.scan.pos;
        assert!(walked > 0 && walked < 64);

        assert!(buffer.push(&head[64 * 1024..]).unwrap().is_empty());
        assert_eq!(buffer.scan.pos, walked);

        let messages = buffer.push(tail).unwrap();
        assert_eq!(messages.len(), 1);
        assert!(buffer.is_empty());
        assert_eq!(buffer.scan.pos, 0);
    }

    #[test]
    fn test_nested_containers_across_reads() {
        let mut buffer = MessageBuffer::new();
        let msg = RpcMessage::Request {
            msgid: 9,
            method: "nvim_call_atomic".to_string(),
            params: vec![Value::Array(vec![Value::Array(vec![
                Value::from("nvim_buf_set_lines"),
                Value::Array(vec![
                    Value::from(0),
                    Value::from(-1),
                    Value::Boolean(false),
                    Value::Map(vec![(Value::from("k"), Value::F64(1.5))]),
                    Value::Binary(vec![1, 2, 3]),
                    Value::Ext(1, vec![7]),
                ]),
            ])])],
        };
        let bytes = MsgPackCodec::encode(&msg.clone().into_value()).unwrap();

        let mut all = Vec::new();
        for chunk in bytes.chunks(3) {
            all.extend(buffer.push(chunk).unwrap());
        }

        assert_eq!(all, vec![msg]);
    }

    #[test]
    fn test_reserved_marker_rejected() {
        let mut buffer = MessageBuffer::new();

        assert!(matches!(
            buffer.push(&[0x94, 0x00, 0xc1]),
            Err(BridgeError::Protocol(_))
        ));
    }
}
