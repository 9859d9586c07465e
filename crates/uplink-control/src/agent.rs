//! A connected remote agent.

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use uplink_mux::{MuxError, MuxMode, MuxSession, MuxStream};

/// Agent construction errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AgentError {
    /// The uplink presented no name. The acceptor turns this into a
    /// diagnostic about the metadata header.
    #[error("agent name is empty")]
    EmptyName,
}

/// A remote RPC server reachable through its uplink session.
///
/// The session is exclusively owned here; the agent itself is shared between
/// the registry and any in-flight proxied calls.
pub struct Agent {
    pub name: String,
    pub connected_at: DateTime<Utc>,
    session: MuxSession,
}

impl Agent {
    /// Validate the name, then take the uplink conduit as the dial side of a
    /// new session. No session is created for a nameless uplink.
    pub fn new<I>(name: impl Into<String>, io: I) -> Result<Self, AgentError>
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let name = name.into();
        if name.is_empty() {
            return Err(AgentError::EmptyName);
        }
        // The hub only dials; substreams the agent might open are not served.
        let (session, _inbound) = MuxSession::new(io, MuxMode::Dial);
        Ok(Self {
            name,
            connected_at: Utc::now(),
            session,
        })
    }

    /// Open a substream toward the agent, suitable as the transport for one
    /// proxied RPC call.
    pub async fn open_stream(&self) -> Result<MuxStream, MuxError> {
        self.session.open_stream().await
    }

    pub fn session(&self) -> &MuxSession {
        &self.session
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.name)
            .field("connected_at", &self.connected_at)
            .finish()
    }
}
