use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Value, json};

use crate::error::{RelayError, Result};
use crate::utils::encode_body;

use super::types::{DeviceInfoPayload, ProxyResponse};

/// Message type tags carried in the envelope's `type` field.
///
/// Inbound (relay to agent): `connected`, `proxy_request`,
/// `proxy_http_request`, `tunnel_connect`, `tunnel_open`, `tunnel_data`,
/// `tunnel_close`, `heartbeat_ack`, `http_response`, `error`.
/// Outbound (agent to relay): `device_info`, `proxy_response`,
/// `proxy_error`, `tunnel_data`, `tunnel_closed`, `heartbeat`,
/// `http_request`.
pub mod kind {
    pub const CONNECTED: &str = "connected";
    pub const PROXY_REQUEST: &str = "proxy_request";
    pub const PROXY_HTTP_REQUEST: &str = "proxy_http_request";
    pub const TUNNEL_CONNECT: &str = "tunnel_connect";
    pub const TUNNEL_OPEN: &str = "tunnel_open";
    pub const TUNNEL_DATA: &str = "tunnel_data";
    pub const TUNNEL_CLOSE: &str = "tunnel_close";
    pub const HEARTBEAT_ACK: &str = "heartbeat_ack";
    pub const HTTP_RESPONSE: &str = "http_response";
    pub const ERROR: &str = "error";

    pub const DEVICE_INFO: &str = "device_info";
    pub const PROXY_RESPONSE: &str = "proxy_response";
    pub const PROXY_ERROR: &str = "proxy_error";
    pub const TUNNEL_CLOSED: &str = "tunnel_closed";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const HTTP_REQUEST: &str = "http_request";
}

/// Unit of wire communication in both directions: a type tag plus an
/// opaque structured payload. Payloads stay untyped here and are decoded
/// into the structs from [`super::types`] at the dispatch site, so an
/// unrecognized tag or a malformed payload never poisons the whole frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    /// Decode this envelope's payload into a typed structure
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            RelayError::InvalidMessage(format!("bad {} payload: {}", self.kind, e))
        })
    }

    /// Serialize for the wire
    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse an inbound wire frame
    pub fn from_text(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| RelayError::InvalidMessage(format!("bad envelope: {}", e)))
    }

    pub fn device_info(info: &DeviceInfoPayload) -> Self {
        Self {
            kind: kind::DEVICE_INFO.to_string(),
            payload: json!({
                "country": info.country,
                "carrier": info.carrier,
                "model": info.model,
                "osVersion": info.os_version,
                "currentIp": info.current_ip,
            }),
        }
    }

    pub fn heartbeat() -> Self {
        Self {
            kind: kind::HEARTBEAT.to_string(),
            payload: json!({}),
        }
    }

    pub fn proxy_response(response: &ProxyResponse) -> Self {
        Self {
            kind: kind::PROXY_RESPONSE.to_string(),
            payload: json!({
                "requestId": response.request_id,
                "statusCode": response.status_code,
                "headers": response.headers,
                "body": response.body,
            }),
        }
    }

    pub fn proxy_error(request_id: &str, error: &str) -> Self {
        Self {
            kind: kind::PROXY_ERROR.to_string(),
            payload: json!({ "requestId": request_id, "error": error }),
        }
    }

    pub fn tunnel_data(session_id: &str, data: &[u8]) -> Self {
        Self {
            kind: kind::TUNNEL_DATA.to_string(),
            payload: json!({ "sessionId": session_id, "data": encode_body(data) }),
        }
    }

    pub fn tunnel_closed(session_id: &str, error: Option<&str>) -> Self {
        let mut payload = json!({ "sessionId": session_id });
        if let Some(err) = error {
            payload["error"] = json!(err);
        }
        Self {
            kind: kind::TUNNEL_CLOSED.to_string(),
            payload,
        }
    }

    pub fn http_request(
        request_id: &str,
        method: &str,
        url: &str,
        headers: &std::collections::HashMap<String, String>,
        body: Option<&str>,
    ) -> Self {
        let mut payload = json!({
            "requestId": request_id,
            "method": method,
            "url": url,
            "headers": headers,
        });
        if let Some(body) = body {
            payload["body"] = json!(body);
        }
        Self {
            kind: kind::HTTP_REQUEST.to_string(),
            payload,
        }
    }
}
