//! Codec module - msgpack serialization for RPC payloads.
//!
//! - [`MsgPackCodec`] - typed values via `rmp-serde`, dynamic values via `rmpv`
//!
//! Codecs are marker structs with static methods rather than trait objects.

mod msgpack;

pub use msgpack::MsgPackCodec;
