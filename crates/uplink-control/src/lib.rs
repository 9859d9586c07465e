//! Control plane for the uplink hub: connected-agent tracking and the
//! hub-wide activity feed.

pub mod agent;
pub mod feed;
pub mod registry;

pub use agent::{Agent, AgentError};
pub use feed::{Feed, FeedError, FeedRouter, FeedSubscription};
pub use registry::{AgentRegistry, RegistryError};
