// htcp-protocol: wire format of the HTCP binary RPC protocol.
//
// Everything in this crate is part of the frozen wire contract: the
// 12-byte packet header, the packet taxonomy, the tagged value grammar,
// and the message envelopes built on them.  Independent implementations
// interoperate at the byte level through these definitions.

pub mod aio;
pub mod codec;
pub mod coerce;
pub mod error;
pub mod message;
pub mod schema;
pub mod transport;
pub mod value;
pub mod wire;

pub use error::{CoerceError, WireError};
pub use schema::{EnumSchema, Param, RecordSchema, Schema};
pub use value::{Arguments, EnumMember, Map, Record, Value};
pub use wire::{ErrorCode, Packet, PacketType};
