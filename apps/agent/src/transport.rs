use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use peershare_common::constants::{RECONNECT_MAX_STEP, RECONNECT_STEP_SECS};
use peershare_common::{DeviceInfoPayload, Envelope, RelayError, Result};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message as WsMessage,
};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::Config;
use crate::device::{DeviceInfoProvider, lookup_public_ip};
use crate::events::{AgentEvent, EventBus};
use crate::mux::SessionMux;
use crate::outbound::Outbound;

type WebSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Connection lifecycle. After an explicit shutdown the state is
/// `Disconnected` and stays there; reconnection is permanently off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
}

/// Delay before reconnect attempt `attempt` (1-based): 5s, 10s, 15s, ...
/// capped at 30s from the sixth failure on
pub fn reconnect_delay(attempt: u32) -> Duration {
    Duration::from_secs(RECONNECT_STEP_SECS * u64::from(attempt.min(RECONNECT_MAX_STEP)))
}

/// Owns the single persistent relay connection: connect/handshake,
/// heartbeat, dispatch pump, and reconnect-with-backoff.
pub struct ConnectionManager {
    config: Config,
    mux: Arc<SessionMux>,
    outbound: Outbound,
    events: EventBus,
    device: Arc<dyn DeviceInfoProvider>,
    http_client: reqwest::Client,
    state: Arc<Mutex<ConnectionState>>,
    shutdown: watch::Receiver<bool>,
}

impl ConnectionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        mux: Arc<SessionMux>,
        outbound: Outbound,
        events: EventBus,
        device: Arc<dyn DeviceInfoProvider>,
        http_client: reqwest::Client,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            mux,
            outbound,
            events,
            device,
            http_client,
            state: Arc::new(Mutex::new(ConnectionState::Disconnected)),
            shutdown,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
            .lock()
            .map(|state| state.clone())
            .unwrap_or(ConnectionState::Disconnected)
    }

    fn set_state(&self, next: ConnectionState) {
        if let Ok(mut state) = self.state.lock() {
            *state = next;
        }
    }

    /// Main run loop with automatic reconnection
    pub async fn run(&self) {
        let mut shutdown = self.shutdown.clone();
        let mut attempt: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.set_state(ConnectionState::Connecting);

            match self.establish().await {
                Ok(ws_stream) => {
                    info!("Relay connection established");
                    attempt = 0;
                    self.set_state(ConnectionState::Connected);
                    self.drive(ws_stream, &mut shutdown).await;
                    self.set_state(ConnectionState::Disconnected);
                    self.teardown(true);
                }
                Err(e) => {
                    error!("Failed to connect to relay: {}", e);
                    self.set_state(ConnectionState::Disconnected);
                }
            }

            if *shutdown.borrow() {
                break;
            }
            attempt += 1;
            let delay = reconnect_delay(attempt);
            self.set_state(ConnectionState::Reconnecting { attempt });
            info!("Reconnecting in {:?} (attempt {})", delay, attempt);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {}
            }
        }

        self.teardown(false);
        self.set_state(ConnectionState::Disconnected);
    }

    /// Open the relay connection and perform the handshake: token rides
    /// as a query parameter, then a `device_info` envelope goes out.
    /// The public-IP lookup is best-effort and bounded; its failure
    /// never fails the handshake.
    async fn establish(&self) -> Result<WebSocket> {
        let mut url = Url::parse(&self.config.relay_url)
            .map_err(|e| RelayError::ConnectionError(format!("invalid relay URL: {}", e)))?;
        if let Some(token) = &self.config.token {
            url.query_pairs_mut().append_pair("token", token);
        }

        debug!("Connecting to {}", self.config.relay_url);
        let (mut ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| RelayError::ConnectionError(e.to_string()))?;

        let current_ip = lookup_public_ip(&self.http_client).await.unwrap_or_default();
        let info = self.device.device_info();
        let handshake = Envelope::device_info(&DeviceInfoPayload {
            country: info.country,
            carrier: info.carrier,
            model: info.model,
            os_version: info.os_version,
            current_ip,
        });
        ws_stream
            .send(WsMessage::Text(handshake.to_text()?.into()))
            .await
            .map_err(|e| RelayError::WebSocketError(format!("Failed to send device_info: {}", e)))?;

        Ok(ws_stream)
    }

    /// Pump an established connection until it drops or shutdown is
    /// requested: write task, read task, heartbeat task
    async fn drive(&self, ws_stream: WebSocket, shutdown: &mut watch::Receiver<bool>) {
        let (write, read) = ws_stream.split();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        self.outbound.bind(outgoing_tx.clone());

        let mut write_handle = tokio::spawn(write_task(write, outgoing_rx));
        let mut read_handle = tokio::spawn(read_task(read, outgoing_tx, self.mux.clone()));
        let mut heartbeat_handle = tokio::spawn(heartbeat_task(
            self.outbound.clone(),
            self.config.heartbeat_interval,
        ));

        tokio::select! {
            result = &mut write_handle => debug!("Write task ended: {:?}", result),
            result = &mut read_handle => debug!("Read task ended: {:?}", result),
            result = &mut heartbeat_handle => debug!("Heartbeat task ended: {:?}", result),
            _ = shutdown.changed() => info!("Shutdown requested, closing relay connection"),
        }

        self.outbound.clear();
        write_handle.abort();
        read_handle.abort();
        heartbeat_handle.abort();
    }

    /// Release everything tied to the dropped connection. Session closes
    /// and pending failures are best-effort notified; the host hears
    /// `Disconnected` only when a live connection was lost.
    fn teardown(&self, notify_host: bool) {
        self.outbound.clear();
        self.mux.teardown();
        if notify_host {
            self.events.emit(AgentEvent::Disconnected);
        }
    }
}

/// Write task: drains the outbound channel into the socket
async fn write_task(
    mut write: SplitSink<WebSocket, WsMessage>,
    mut outgoing_rx: mpsc::UnboundedReceiver<WsMessage>,
) {
    while let Some(message) = outgoing_rx.recv().await {
        if let Err(e) = write.send(message).await {
            error!("Failed to send message: {}", e);
            break;
        }
    }
    debug!("Write task exiting");
}

/// Read task: parses each frame and hands it to the multiplexer
async fn read_task(
    mut read: SplitStream<WebSocket>,
    outgoing_tx: mpsc::UnboundedSender<WsMessage>,
    mux: Arc<SessionMux>,
) {
    while let Some(message) = read.next().await {
        match message {
            Ok(WsMessage::Text(text)) => match Envelope::from_text(&text) {
                Ok(envelope) => mux.dispatch(envelope),
                Err(e) => warn!("Dropping malformed frame: {}", e),
            },
            Ok(WsMessage::Binary(_)) => {
                warn!("Received unexpected binary message");
            }
            Ok(WsMessage::Ping(data)) => {
                if outgoing_tx.send(WsMessage::Pong(data)).is_err() {
                    break;
                }
            }
            Ok(WsMessage::Pong(_)) => {
                debug!("Received WebSocket pong");
            }
            Ok(WsMessage::Close(_)) => {
                info!("Relay closed connection");
                break;
            }
            Err(e) => {
                error!("WebSocket error: {}", e);
                break;
            }
            _ => {}
        }
    }
    debug!("Read task exiting");
}

/// Heartbeat task: periodic liveness frames while connected. Dies as
/// soon as the outbound sink clears.
async fn heartbeat_task(outbound: Outbound, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    // the first tick completes immediately; the handshake already went out
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if outbound.send(&Envelope::heartbeat()).is_err() {
            break;
        }
        debug!("Sent heartbeat");
    }
    debug!("Heartbeat task exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_delay_sequence() {
        let delays: Vec<u64> = (1..=8).map(|n| reconnect_delay(n).as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 15, 20, 25, 30, 30, 30]);
    }

    #[test]
    fn test_reconnect_delay_restarts_after_reset() {
        // a successful open resets the attempt counter, so the next
        // failure starts the ladder over
        assert_eq!(reconnect_delay(1), Duration::from_secs(5));
    }

    #[test]
    fn test_connection_state_variants() {
        let state = ConnectionState::Disconnected;
        assert!(matches!(state, ConnectionState::Disconnected));

        let state = ConnectionState::Reconnecting { attempt: 2 };
        assert_eq!(state, ConnectionState::Reconnecting { attempt: 2 });
    }
}
