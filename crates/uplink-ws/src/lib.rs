//! Byte-stream adapter over a message-oriented WebSocket.
//!
//! A [`FramedSocket`] turns a `tokio_tungstenite::WebSocketStream` into a
//! reliable, ordered `AsyncRead + AsyncWrite` conduit suitable for carrying a
//! stream multiplexer. It enforces a single message kind on the wire, keeps
//! the connection alive with periodic pings, applies read/write deadlines,
//! and performs the close handshake expected by its peers.
//!
//! The timing constants below are a protocol contract: both ends of an uplink
//! must use the same values.

use std::time::Duration;

mod framed;

pub use framed::{FramedConfig, FramedControl, FramedSocket, MessageKind, PongHook};

/// Deadline for every outbound message.
pub const WRITE_WAIT: Duration = Duration::from_secs(10);

/// Deadline for the next inbound frame; extended whenever traffic (including
/// a pong) arrives.
pub const PONG_WAIT: Duration = Duration::from_secs(60);

/// Ping cadence. Must be shorter than [`PONG_WAIT`].
pub const PING_PERIOD: Duration = Duration::from_millis(PONG_WAIT.as_millis() as u64 * 9 / 10);

/// Maximum size of a single inbound WebSocket message. Outbound writes are
/// chunked so they never exceed the peer's limit.
pub const MAX_MESSAGE_SIZE: usize = 512;

/// Default close reason. Peers in this family treat a close frame whose
/// reason contains the substring `closed` as a graceful shutdown.
pub const CLOSE_REASON: &str = "closed";

/// WebSocket options both ends apply at socket construction.
pub fn socket_config() -> tokio_tungstenite::tungstenite::protocol::WebSocketConfig {
    let mut config = tokio_tungstenite::tungstenite::protocol::WebSocketConfig::default();
    config.max_message_size = Some(MAX_MESSAGE_SIZE);
    config.max_frame_size = Some(MAX_MESSAGE_SIZE);
    config
}
