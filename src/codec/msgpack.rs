//! MsgPack codec using `rmp-serde` and `rmpv`.
//!
//! Typed values go through `rmp-serde` with `to_vec_named`, so structs
//! become maps the way Neovim sends dictionaries. Dynamic values
//! ([`rmpv::Value`]) are what travels inside RPC messages.
//!
//! # Example
//!
//! ```
//! use nvimwire::codec::MsgPackCodec;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Pos {
//!     row: u32,
//!     col: u32,
//! }
//!
//! let value = MsgPackCodec::to_value(&Pos { row: 1, col: 2 }).unwrap();
//! let back: Pos = MsgPackCodec::from_value(&value).unwrap();
//! assert_eq!(back, Pos { row: 1, col: 2 });
//! ```

use std::io::Cursor;

use rmpv::Value;

use crate::error::Result;

/// MessagePack codec for structured data.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes.
    ///
    /// Uses `to_vec_named` for struct-as-map format.
    #[inline]
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decode MsgPack bytes to a value.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    /// Decode a single dynamic value from the front of `bytes`.
    pub fn decode_value(bytes: &[u8]) -> Result<Value> {
        let mut cursor = Cursor::new(bytes);
        Ok(rmpv::decode::read_value(&mut cursor)?)
    }

    /// Convert any serializable value into a dynamic msgpack value.
    pub fn to_value<T: serde::Serialize>(value: &T) -> Result<Value> {
        let bytes = Self::encode(value)?;
        Self::decode_value(&bytes)
    }

    /// Convert a dynamic msgpack value into a typed value.
    pub fn from_value<T: serde::de::DeserializeOwned>(value: &Value) -> Result<T> {
        let bytes = Self::encode(value)?;
        Self::decode(&bytes)
    }

    /// Decode a handler's argument list into a typed tuple or struct.
    ///
    /// The arguments are treated as one msgpack array, so `(String, i64)`
    /// matches `["name", 3]`.
    pub fn decode_args<T: serde::de::DeserializeOwned>(args: &[Value]) -> Result<T> {
        Self::from_value(&Value::Array(args.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Cursor2 {
        row: u32,
        col: u32,
    }

    #[test]
    fn test_struct_encodes_as_map() {
        let encoded = MsgPackCodec::encode(&Cursor2 { row: 3, col: 4 }).unwrap();

        // 0x82 = fixmap with 2 entries
        assert_eq!(encoded[0], 0x82, "Expected fixmap with 2 elements");
    }

    #[test]
    fn test_to_value_produces_map() {
        let value = MsgPackCodec::to_value(&Cursor2 { row: 1, col: 0 }).unwrap();
        let map = value.as_map().expect("map");

        assert_eq!(map.len(), 2);
        assert_eq!(map[0].0.as_str(), Some("row"));
        assert_eq!(map[0].1.as_u64(), Some(1));
    }

    #[test]
    fn test_decode_args_tuple() {
        let args = vec![Value::from("save"), Value::from(7)];
        let (name, chan): (String, i64) = MsgPackCodec::decode_args(&args).unwrap();

        assert_eq!(name, "save");
        assert_eq!(chan, 7);
    }

    #[test]
    fn test_decode_args_type_mismatch() {
        let args = vec![Value::from(true)];
        let result: Result<(String,)> = MsgPackCodec::decode_args(&args);
        assert!(result.is_err());
    }

    #[test]
    fn test_nil_decodes_to_none() {
        let decoded: Option<i32> = MsgPackCodec::from_value(&Value::Nil).unwrap();
        assert_eq!(decoded, None);
    }

    #[test]
    fn test_decode_value_incomplete_is_error() {
        // fixarray of 2 with only one element present
        let result = MsgPackCodec::decode_value(&[0x92, 0x01]);
        assert!(result.is_err());
    }
}
