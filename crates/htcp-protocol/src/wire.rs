//! Packet framing: the 12-byte header and the packet taxonomy.
//!
//! Header layout, big-endian:
//!
//! ```text
//! +--------+---------+------+--------+----------+---------+
//! | MAGIC  | VERSION | TYPE | LENGTH | RESERVED | PAYLOAD |
//! | 4 bytes| 1 byte  |1 byte| 4 bytes| 2 bytes  | N bytes |
//! +--------+---------+------+--------+----------+---------+
//! ```
//!
//! Reserved bytes are zero on send and ignored on receive.

use std::time::Duration;

use crate::error::WireError;

pub const MAGIC: [u8; 4] = *b"HTCP";
pub const PROTOCOL_VERSION: u8 = 1;
pub const HEADER_SIZE: usize = 12;

/// Default payload cap: 16 MiB.
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_LISTEN_BACKLOG: u32 = 128;
pub const DEFAULT_MAX_CONNECTIONS: usize = 100;

/// Closed set of packet kinds.  The low range is client→server, the
/// 0x11+ range server→client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    HandshakeRequest = 0x01,
    TransactionCall = 0x02,
    Disconnect = 0x03,
    SubscribeRequest = 0x04,
    UnsubscribeRequest = 0x05,

    HandshakeResponse = 0x11,
    TransactionResult = 0x12,
    Error = 0x13,
    SubscribeData = 0x14,
    SubscribeEnd = 0x15,
    SubscribeError = 0x16,
}

impl PacketType {
    pub fn from_byte(byte: u8) -> Option<PacketType> {
        match byte {
            0x01 => Some(PacketType::HandshakeRequest),
            0x02 => Some(PacketType::TransactionCall),
            0x03 => Some(PacketType::Disconnect),
            0x04 => Some(PacketType::SubscribeRequest),
            0x05 => Some(PacketType::UnsubscribeRequest),
            0x11 => Some(PacketType::HandshakeResponse),
            0x12 => Some(PacketType::TransactionResult),
            0x13 => Some(PacketType::Error),
            0x14 => Some(PacketType::SubscribeData),
            0x15 => Some(PacketType::SubscribeEnd),
            0x16 => Some(PacketType::SubscribeError),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Wire error codes carried by result and error packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCode {
    Success = 0,
    UnknownTransaction = 1,
    InvalidArguments = 2,
    ExecutionError = 3,
    ProtocolError = 4,
    InternalError = 5,
}

impl ErrorCode {
    /// Decode from a wire integer; anything out of range maps to
    /// `InternalError` rather than failing the whole packet.
    pub fn from_i64(code: i64) -> ErrorCode {
        match code {
            0 => ErrorCode::Success,
            1 => ErrorCode::UnknownTransaction,
            2 => ErrorCode::InvalidArguments,
            3 => ErrorCode::ExecutionError,
            4 => ErrorCode::ProtocolError,
            _ => ErrorCode::InternalError,
        }
    }

    pub fn as_i64(self) -> i64 {
        i64::from(self as u8)
    }
}

/// One framed unit on the wire: a type byte plus opaque payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: PacketType,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(packet_type: PacketType, payload: Vec<u8>) -> Packet {
        Packet {
            packet_type,
            payload,
        }
    }

    /// An empty-payload packet (handshake request, disconnect).
    pub fn empty(packet_type: PacketType) -> Packet {
        Packet::new(packet_type, Vec::new())
    }

    /// Serialize header + payload into one buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        out.extend_from_slice(&MAGIC);
        out.push(PROTOCOL_VERSION);
        out.push(self.packet_type.as_byte());
        out.extend_from_slice(
            &u32::try_from(self.payload.len())
                .expect("payload length checked against the 16 MiB cap")
                .to_be_bytes(),
        );
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Validate a 12-byte header and return the packet type and payload
    /// length.  The length check happens here, before any payload bytes
    /// are read.
    pub fn parse_header(
        header: &[u8; HEADER_SIZE],
        max_payload: usize,
    ) -> Result<(PacketType, usize), WireError> {
        let magic: [u8; 4] = [header[0], header[1], header[2], header[3]];
        if magic != MAGIC {
            return Err(WireError::InvalidMagic(magic));
        }
        if header[4] != PROTOCOL_VERSION {
            return Err(WireError::UnsupportedVersion(header[4]));
        }
        let packet_type =
            PacketType::from_byte(header[5]).ok_or(WireError::UnknownPacketType(header[5]))?;
        let length = u32::from_be_bytes([header[6], header[7], header[8], header[9]]) as usize;
        if length > max_payload {
            return Err(WireError::PayloadTooLarge {
                length,
                max: max_payload,
            });
        }
        Ok((packet_type, length))
    }

    /// Parse a complete packet from one contiguous buffer.
    pub fn from_bytes(data: &[u8]) -> Result<Packet, WireError> {
        if data.len() < HEADER_SIZE {
            return Err(WireError::Truncated {
                offset: data.len(),
                needed: HEADER_SIZE - data.len(),
            });
        }
        let mut header = [0u8; HEADER_SIZE];
        header.copy_from_slice(&data[..HEADER_SIZE]);
        let (packet_type, length) = Packet::parse_header(&header, MAX_PAYLOAD_SIZE)?;
        let body = &data[HEADER_SIZE..];
        if body.len() < length {
            return Err(WireError::Truncated {
                offset: data.len(),
                needed: length - body.len(),
            });
        }
        Ok(Packet::new(packet_type, body[..length].to_vec()))
    }
}
