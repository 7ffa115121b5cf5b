//! Peer bandwidth-sharing agent.
//!
//! Maintains one persistent WebSocket connection to a relay and multiplexes
//! HTTP fetches and raw TCP tunnel sessions over it, so the relay can use
//! this device's network path as an egress point. A companion local ingress
//! server lets the embedding process issue HTTP requests through the relay.

pub mod agent;
pub mod config;
pub mod device;
pub mod events;
pub mod fetch;
pub mod ingress;
pub mod mux;
pub mod outbound;
pub mod traffic;
pub mod transport;
pub mod tunnel;

pub use agent::Agent;
pub use config::Config;
pub use events::AgentEvent;

#[cfg(test)]
mod tests;
