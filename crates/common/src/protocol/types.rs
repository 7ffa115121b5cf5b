use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// `connected` payload; the relay assigns the device id on registration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedPayload {
    #[serde(default)]
    pub device_id: Option<String>,
}

/// `device_info` payload sent right after the connection opens
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfoPayload {
    pub country: String,
    pub carrier: String,
    pub model: String,
    pub os_version: String,
    pub current_ip: String,
}

/// An HTTP request forwarded over the relay, in either direction.
///
/// Carried as the `proxy_request` payload (relay asks the agent to fetch)
/// and as the `http_request` payload (agent asks the relay to fetch).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyRequest {
    /// Unique identifier to correlate request and response
    pub request_id: String,

    /// HTTP method (GET, POST, PUT, DELETE, etc.)
    pub method: String,

    /// Absolute request URL including the query string
    pub url: String,

    /// Single-valued header map
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Request body encoded in Base64, absent for bodyless requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

/// The matching response, carried as `proxy_response` and `http_response`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyResponse {
    pub request_id: String,
    pub status_code: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Response body encoded in Base64
    #[serde(default)]
    pub body: String,
}

/// `proxy_error` payload sent when the request handler fails
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyErrorPayload {
    pub request_id: String,
    pub error: String,
}

/// `proxy_http_request` payload: a direct fetch whose raw HTTP/1.1 response
/// is returned through tunnel framing under `sessionId`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyHttpRequestPayload {
    pub session_id: String,
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

/// `tunnel_connect` payload: open a raw TCP stream to `host:port`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelConnectPayload {
    pub session_id: String,
    pub host: String,
    pub port: u16,
}

/// `tunnel_data` payload: one ordered chunk of a tunnel byte stream
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelDataPayload {
    pub session_id: String,
    /// Chunk bytes encoded in Base64
    #[serde(default)]
    pub data: String,
}

/// `tunnel_close` payload: the relay is done with a session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelClosePayload {
    pub session_id: String,
}

/// `tunnel_closed` payload: the agent reports a session is gone
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelClosedPayload {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `error` payload: non-fatal relay-side diagnostics
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    #[serde(default)]
    pub message: String,
}
