//! Common wire protocol and utilities for the peershare agent
//!
//! This crate provides the relay envelope format, typed payloads, and the
//! shared helpers (body encoding, id generation, raw response synthesis)
//! used by the agent.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod utils;

// Re-export commonly used types for convenience
pub use error::{RelayError, Result};
pub use protocol::{
    ConnectedPayload, DeviceInfoPayload, Envelope, ErrorPayload, ProxyErrorPayload,
    ProxyHttpRequestPayload, ProxyRequest, ProxyResponse, TunnelClosePayload, TunnelClosedPayload,
    TunnelConnectPayload, TunnelDataPayload, kind,
};
pub use utils::{decode_body, encode_body, generate_request_id, status_reason, synthesize_response};
