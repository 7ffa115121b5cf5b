use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use peershare_common::{
    ConnectedPayload, Envelope, ErrorPayload, ProxyHttpRequestPayload, ProxyRequest,
    ProxyResponse, RelayError, Result, TunnelClosePayload, TunnelConnectPayload,
    TunnelDataPayload, decode_body, encode_body, generate_request_id, kind,
    synthesize_response,
};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::events::{AgentEvent, EventBus};
use crate::fetch::{DirectFetch, ProxyHandler};
use crate::outbound::Outbound;
use crate::traffic::TrafficAccountant;
use crate::tunnel::TunnelTable;

type PendingSlot = oneshot::Sender<Result<ProxyResponse>>;

/// The core state machine: correlates `http_request`/`http_response`
/// pairs, owns the tunnel-session table, and dispatches every inbound
/// envelope to the right handler.
pub struct SessionMux {
    pending: Arc<DashMap<String, PendingSlot>>,
    tunnels: Arc<TunnelTable>,
    outbound: Outbound,
    traffic: Arc<TrafficAccountant>,
    events: EventBus,
    handler: Arc<dyn ProxyHandler>,
    fetcher: DirectFetch,
    request_timeout: Duration,
}

impl SessionMux {
    pub fn new(
        outbound: Outbound,
        traffic: Arc<TrafficAccountant>,
        events: EventBus,
        handler: Arc<dyn ProxyHandler>,
        fetcher: DirectFetch,
        request_timeout: Duration,
    ) -> Self {
        let tunnels = Arc::new(TunnelTable::new(outbound.clone(), traffic.clone()));
        Self {
            pending: Arc::new(DashMap::new()),
            tunnels,
            outbound,
            traffic,
            events,
            handler,
            fetcher,
            request_timeout,
        }
    }

    pub fn tunnels(&self) -> &Arc<TunnelTable> {
        &self.tunnels
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Route one inbound envelope. Arms that can block (both proxy
    /// fetches, the tunnel connect) spawn their own task; the
    /// order-sensitive cheap arms run inline on the read loop so
    /// per-session arrival order is preserved.
    pub fn dispatch(self: &Arc<Self>, envelope: Envelope) {
        match envelope.kind.as_str() {
            kind::CONNECTED => self.on_connected(&envelope),
            kind::PROXY_REQUEST => self.on_proxy_request(&envelope),
            kind::PROXY_HTTP_REQUEST => self.on_proxy_http_request(&envelope),
            kind::TUNNEL_CONNECT => self.on_tunnel_connect(&envelope),
            kind::TUNNEL_DATA => self.on_tunnel_data(&envelope),
            kind::TUNNEL_CLOSE => self.on_tunnel_close(&envelope),
            kind::HTTP_RESPONSE => self.on_http_response(&envelope),
            kind::HEARTBEAT_ACK => debug!("heartbeat acknowledged"),
            kind::TUNNEL_OPEN => debug!("tunnel_open received"),
            kind::ERROR => match envelope.decode::<ErrorPayload>() {
                Ok(payload) => error!("relay error: {}", payload.message),
                Err(e) => warn!("{}", e),
            },
            other => warn!("ignoring message with unrecognized type {:?}", other),
        }
    }

    fn on_connected(&self, envelope: &Envelope) {
        match envelope.decode::<ConnectedPayload>() {
            Ok(ConnectedPayload {
                device_id: Some(device_id),
            }) => {
                info!("Relay registered device {}", device_id);
                self.events.emit(AgentEvent::Connected { device_id });
            }
            Ok(ConnectedPayload { device_id: None }) => {
                error!("connected message without a device id");
            }
            Err(e) => warn!("{}", e),
        }
    }

    /// Legacy whole-body path: hand the request to the supplied handler
    /// and relay its response (or failure) back
    fn on_proxy_request(self: &Arc<Self>, envelope: &Envelope) {
        let request: ProxyRequest = match envelope.decode() {
            Ok(request) => request,
            Err(e) => {
                warn!("{}", e);
                return;
            }
        };
        let mux = self.clone();
        tokio::spawn(async move {
            let request_id = request.request_id.clone();
            let request_bytes = request
                .body
                .as_deref()
                .and_then(|b| decode_body(b).ok())
                .map(|b| b.len() as u64)
                .unwrap_or(0);
            match mux.handler.handle(request).await {
                Ok(response) => {
                    let response_bytes = decode_body(&response.body)
                        .map(|b| b.len() as u64)
                        .unwrap_or(0);
                    mux.traffic.record(response_bytes, request_bytes);
                    if let Err(e) = mux.outbound.send(&Envelope::proxy_response(&response)) {
                        warn!("failed to send proxy_response for {}: {}", request_id, e);
                    }
                }
                Err(e) => {
                    debug!("proxy request {} failed: {}", request_id, e);
                    let _ = mux
                        .outbound
                        .send(&Envelope::proxy_error(&request_id, &e.to_string()));
                }
            }
        });
    }

    /// Direct-fetch path: perform the request here and return the raw
    /// HTTP/1.1 response through tunnel framing, so the relay handles
    /// simple fetches and tunnels uniformly
    fn on_proxy_http_request(self: &Arc<Self>, envelope: &Envelope) {
        let request: ProxyHttpRequestPayload = match envelope.decode() {
            Ok(request) => request,
            Err(e) => {
                warn!("{}", e);
                return;
            }
        };
        let mux = self.clone();
        tokio::spawn(async move {
            let body = match request.body.as_deref().map(decode_body).transpose() {
                Ok(body) => body,
                Err(e) => {
                    warn!("bad proxy_http_request body for {}: {}", request.session_id, e);
                    return;
                }
            };
            let request_bytes = body.as_ref().map(|b| b.len() as u64).unwrap_or(0);
            let blob = match mux
                .fetcher
                .fetch(&request.method, &request.url, &request.headers, body.as_deref())
                .await
            {
                Ok(fetched) => {
                    mux.traffic.record(fetched.body.len() as u64, request_bytes);
                    synthesize_response(fetched.status, &fetched.headers, &fetched.body)
                }
                Err(e) => {
                    debug!("direct fetch for {} failed: {}", request.session_id, e);
                    synthesize_response(502, &HashMap::new(), e.to_string().as_bytes())
                }
            };
            let frame = Envelope::tunnel_data(&request.session_id, &blob);
            if let Err(e) = mux.outbound.send(&frame) {
                warn!("failed to send fetch response for {}: {}", request.session_id, e);
            }
        });
    }

    fn on_tunnel_connect(self: &Arc<Self>, envelope: &Envelope) {
        let payload: TunnelConnectPayload = match envelope.decode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("{}", e);
                return;
            }
        };
        debug!(
            "tunnel_connect {} -> {}:{}",
            payload.session_id, payload.host, payload.port
        );
        // register before the connect task starts so data arriving while
        // the connect is in flight buffers under this session
        self.tunnels.register_connecting(&payload.session_id);
        tokio::spawn(
            self.tunnels
                .clone()
                .open(payload.session_id, payload.host, payload.port),
        );
    }

    fn on_tunnel_data(&self, envelope: &Envelope) {
        let payload: TunnelDataPayload = match envelope.decode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("{}", e);
                return;
            }
        };
        match decode_body(&payload.data) {
            Ok(data) => self.tunnels.write_or_buffer(&payload.session_id, data),
            Err(e) => warn!("bad tunnel_data for {}: {}", payload.session_id, e),
        }
    }

    fn on_tunnel_close(&self, envelope: &Envelope) {
        match envelope.decode::<TunnelClosePayload>() {
            Ok(payload) => self.tunnels.close(&payload.session_id, None),
            Err(e) => warn!("{}", e),
        }
    }

    fn on_http_response(&self, envelope: &Envelope) {
        let response: ProxyResponse = match envelope.decode() {
            Ok(response) => response,
            Err(e) => {
                warn!("{}", e);
                return;
            }
        };
        match self.pending.remove(&response.request_id) {
            Some((_, slot)) => {
                let _ = slot.send(Ok(response));
            }
            // already timed out or never ours: nothing to resurrect
            None => debug!(
                "http_response for unknown or expired request {}",
                response.request_id
            ),
        }
    }

    /// Forward one HTTP request over the relay and wait for the
    /// correlated `http_response`. Exactly one of result or timeout
    /// reaches the caller.
    pub async fn send_http_request(
        &self,
        method: &str,
        url: &str,
        headers: &HashMap<String, String>,
        body: Option<&[u8]>,
    ) -> Result<ProxyResponse> {
        let request_id = generate_request_id();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id.clone(), tx);

        let encoded = body.filter(|b| !b.is_empty()).map(encode_body);
        let envelope =
            Envelope::http_request(&request_id, method, url, headers, encoded.as_deref());
        if let Err(e) = self.outbound.send(&envelope) {
            self.pending.remove(&request_id);
            return Err(e);
        }

        // the deadline timer performs the same remove-and-signal as a
        // normal completion, so a late response cannot resurrect the entry
        let pending = self.pending.clone();
        let timer_id = request_id.clone();
        let deadline = self.request_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            if let Some((_, slot)) = pending.remove(&timer_id) {
                let _ = slot.send(Err(RelayError::Timeout));
            }
        });

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(RelayError::ConnectionError("connection closed".to_string())),
        }
    }

    /// Drop every tracked session and pending request; called on
    /// connection loss and on shutdown
    pub fn teardown(&self) {
        self.tunnels.close_all();
        self.pending.retain(|_, _| false);
    }
}
