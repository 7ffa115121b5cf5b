use std::net::SocketAddr;
use std::time::Duration;

use peershare_common::constants::{HEARTBEAT_INTERVAL_SECS, REQUEST_TIMEOUT_SECS};

use crate::device::DeviceInfo;

/// Configuration for the agent
#[derive(Debug, Clone)]
pub struct Config {
    /// Relay WebSocket endpoint URL
    pub relay_url: String,

    /// Opaque auth token appended as a query parameter, if supplied
    pub token: Option<String>,

    /// Local ingress bind address
    pub ingress_addr: SocketAddr,

    /// Timeout waiting for an `http_response` from the relay
    pub request_timeout: Duration,

    /// Heartbeat interval while connected
    pub heartbeat_interval: Duration,

    /// Static device description sent in the handshake
    pub device: DeviceInfo,
}

impl Config {
    /// A config suitable for tests and library embedding: localhost
    /// ingress on an ephemeral port, default timing knobs.
    pub fn new(relay_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            token,
            ingress_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            request_timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
            heartbeat_interval: Duration::from_secs(HEARTBEAT_INTERVAL_SECS),
            device: DeviceInfo::default(),
        }
    }
}
