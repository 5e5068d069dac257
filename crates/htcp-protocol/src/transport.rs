//! Blocking packet transport over any `Read`/`Write` stream.
//!
//! Timeouts are the socket's own (`set_read_timeout`/`set_write_timeout`
//! on `TcpStream`); a timed-out socket read surfaces here as
//! `WireError::Timeout`.

use std::io::{ErrorKind, Read, Write};

use crate::error::WireError;
use crate::wire::{Packet, HEADER_SIZE};

/// Send one packet: header and payload in a single buffered write,
/// then flush.
pub fn send_packet<W: Write>(writer: &mut W, packet: &Packet) -> Result<(), WireError> {
    writer.write_all(&packet.to_bytes()).map_err(map_io)?;
    writer.flush().map_err(map_io)?;
    Ok(())
}

/// Receive one packet.  Zero bytes at the header boundary is an orderly
/// close (`WireError::Closed`); EOF anywhere else reports got/expected
/// counts.  The payload length is validated before any payload byte is
/// read.
pub fn recv_packet<R: Read>(reader: &mut R, max_payload: usize) -> Result<Packet, WireError> {
    let mut header = [0u8; HEADER_SIZE];
    read_exact_counted(reader, &mut header, true)?;
    let (packet_type, length) = Packet::parse_header(&header, max_payload)?;

    let mut payload = vec![0u8; length];
    if length > 0 {
        read_exact_counted(reader, &mut payload, false)?;
    }
    Ok(Packet::new(packet_type, payload))
}

/// Fill `buf` completely.  `orderly_close_ok` marks a packet boundary,
/// where EOF before the first byte means the peer simply hung up.
fn read_exact_counted<R: Read>(
    reader: &mut R,
    buf: &mut [u8],
    orderly_close_ok: bool,
) -> Result<(), WireError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                if filled == 0 && orderly_close_ok {
                    return Err(WireError::Closed);
                }
                return Err(WireError::UnexpectedEof {
                    got: filled,
                    expected: buf.len(),
                });
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(map_io(e)),
        }
    }
    Ok(())
}

fn map_io(e: std::io::Error) -> WireError {
    match e.kind() {
        ErrorKind::WouldBlock | ErrorKind::TimedOut => WireError::Timeout("socket operation"),
        _ => WireError::Io(e),
    }
}
