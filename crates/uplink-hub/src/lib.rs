//! Reverse-tunnel RPC hub.
//!
//! Remote agents behind NAT dial the hub's WebSocket uplink endpoint and
//! become dial targets for a session multiplexer. Inbound RPC calls arriving
//! on the hub's separate RPC listener are routed by method-name prefix:
//! `local.*` services are served in-process, `external.*` calls are spliced
//! byte-for-byte through a fresh substream to the agent named in the call
//! metadata.

pub mod director;
pub mod hub;
pub mod middleware;
pub mod services;
pub mod uplink;

pub use hub::{Hub, HubConfig, HubError, TlsSettings};
