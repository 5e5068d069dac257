use thiserror::Error;

/// Errors arising from framing, value serialization, and packet transport.
///
/// The variants group into the protocol's wire-level failure classes:
/// header validation (`InvalidMagic`, `UnsupportedVersion`,
/// `UnknownPacketType`, `PayloadTooLarge`), value grammar
/// (`EmptyInput`, `UnknownTag`, `Truncated`, `TrailingBytes`,
/// `InvalidUtf8`, `InvalidValue`), and connection state (`Closed`,
/// `UnexpectedEof`, `Timeout`, `Io`).
#[derive(Debug, Error)]
pub enum WireError {
    #[error("invalid magic bytes: {0:02x?}")]
    InvalidMagic([u8; 4]),
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),
    #[error("unknown packet type: 0x{0:02x}")]
    UnknownPacketType(u8),
    #[error("payload length {length} exceeds maximum {max}")]
    PayloadTooLarge { length: usize, max: usize },

    #[error("empty input")]
    EmptyInput,
    #[error("unknown value tag: 0x{0:02x}")]
    UnknownTag(u8),
    #[error("truncated value: needed {needed} more bytes at offset {offset}")]
    Truncated { offset: usize, needed: usize },
    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),
    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),
    #[error("invalid {what}: {detail}")]
    InvalidValue { what: &'static str, detail: String },

    /// Orderly close: the peer shut the stream down at a packet boundary.
    #[error("connection closed")]
    Closed,
    #[error("connection closed while reading ({got}/{expected} bytes)")]
    UnexpectedEof { got: usize, expected: usize },
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
}

impl WireError {
    /// True when the error means the stream is unusable and must be torn
    /// down, as opposed to a per-packet protocol violation.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            WireError::Closed
                | WireError::UnexpectedEof { .. }
                | WireError::Timeout(_)
                | WireError::Io(_)
        )
    }
}

/// Coercion failures when lifting decoded values to a declared schema.
#[derive(Debug, Error)]
pub enum CoerceError {
    #[error("expected {expected}, got {actual}")]
    Shape {
        expected: &'static str,
        actual: &'static str,
    },
    #[error("unknown member '{member}' of enum {enum_name}")]
    UnknownEnumMember { enum_name: String, member: String },
    #[error("missing field '{field}' for record {record}")]
    MissingField { record: String, field: String },
    #[error("tuple arity mismatch: expected {expected}, got {actual}")]
    TupleArity { expected: usize, actual: usize },
    #[error("mapping key for record {record} is not a string")]
    NonStringField { record: String },
}
