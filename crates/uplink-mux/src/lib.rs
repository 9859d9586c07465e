//! Substream session layer.
//!
//! Carries many independent bidirectional substreams over one byte-stream
//! conduit using the yamux protocol. One endpoint dials (opens substreams on
//! demand), the other accepts; in this system the hub dials and the agent
//! accepts, inverting the direction of the underlying connection.
//!
//! The yamux state machine is poll-driven, so a [`MuxSession`] spawns a
//! driver task that owns the connection, services open requests from a
//! command channel and hands inbound substreams to the [`MuxListener`]. A
//! latched close signal fires exactly once when the conduit is lost.

mod session;
mod stream;

pub use session::{MuxListener, MuxMode, MuxSession};
pub use stream::{MuxConnectInfo, MuxStream};

/// Session-layer errors.
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    /// The session driver has exited; the conduit is gone.
    #[error("session is closed")]
    SessionClosed,

    /// Protocol or transport failure inside the session layer.
    #[error("session failure: {0}")]
    Connection(#[from] yamux::ConnectionError),
}
