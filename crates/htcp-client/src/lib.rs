// htcp-client: client runtimes for the HTCP protocol.
//
// `Client` is the async runtime (tokio); `blocking::BlockingClient`
// wraps a std TcpStream for synchronous callers.  Both perform the
// connect-and-handshake dance, expose request/reply calls, and hand out
// subscription handles that unsubscribe on drop.

pub mod blocking;
mod client;

use htcp_protocol::{CoerceError, ErrorCode, WireError};
use thiserror::Error;

pub use client::{Client, ClientConfig, ServerInfo, SubscriptionStream};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("transaction '{code}' failed ({error_code:?}): {message}")]
    Call {
        code: String,
        error_code: ErrorCode,
        message: String,
    },
    #[error("server error ({error_code:?}): {message}")]
    Server {
        error_code: ErrorCode,
        message: String,
    },
    #[error("subscription failed ({error_code:?}): {message}")]
    Subscription {
        error_code: ErrorCode,
        message: String,
    },
    #[error("unexpected packet type 0x{0:02x}")]
    UnexpectedPacket(u8),
    #[error("result coercion failed: {0}")]
    Coerce(#[from] CoerceError),
    #[error(transparent)]
    Wire(#[from] WireError),
}
