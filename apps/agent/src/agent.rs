use std::sync::Arc;

use peershare_common::Result;
use tokio::sync::{mpsc, watch};
use tracing::info;

use crate::config::Config;
use crate::device::{DeviceInfoProvider, StaticDeviceInfo};
use crate::events::{AgentEvent, EventBus};
use crate::fetch::{DirectFetch, ProxyHandler};
use crate::ingress::IngressServer;
use crate::mux::SessionMux;
use crate::outbound::Outbound;
use crate::traffic::TrafficAccountant;
use crate::transport::{ConnectionManager, ConnectionState};

/// The agent's context object. Wires the transport, multiplexer, tunnel
/// table, ingress server and traffic accountant together; constructed
/// once by the caller and passed by reference, no ambient global state.
pub struct Agent {
    config: Config,
    mux: Arc<SessionMux>,
    transport: Arc<ConnectionManager>,
    traffic: Arc<TrafficAccountant>,
    shutdown_tx: watch::Sender<bool>,
}

impl Agent {
    /// Default wiring: direct fetch for `proxy_request`, static device
    /// info from the config
    pub fn new(config: Config) -> Result<(Self, mpsc::UnboundedReceiver<AgentEvent>)> {
        let fetcher = DirectFetch::new()?;
        let handler: Arc<dyn ProxyHandler> = Arc::new(fetcher.clone());
        let device = Arc::new(StaticDeviceInfo(config.device.clone()));
        Self::with_parts(config, handler, device, fetcher)
    }

    /// Full wiring seam for hosts that supply their own request handler
    /// or device description
    pub fn with_parts(
        config: Config,
        handler: Arc<dyn ProxyHandler>,
        device: Arc<dyn DeviceInfoProvider>,
        fetcher: DirectFetch,
    ) -> Result<(Self, mpsc::UnboundedReceiver<AgentEvent>)> {
        let (events, events_rx) = EventBus::new();
        let traffic = Arc::new(TrafficAccountant::new(events.clone()));
        let outbound = Outbound::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let http_client = fetcher.client().clone();
        let mux = Arc::new(SessionMux::new(
            outbound.clone(),
            traffic.clone(),
            events.clone(),
            handler,
            fetcher,
            config.request_timeout,
        ));
        let transport = Arc::new(ConnectionManager::new(
            config.clone(),
            mux.clone(),
            outbound,
            events,
            device,
            http_client,
            shutdown_rx,
        ));

        Ok((
            Self {
                config,
                mux,
                transport,
                traffic,
                shutdown_tx,
            },
            events_rx,
        ))
    }

    /// Run the relay connection and the local ingress server until
    /// shutdown is requested
    pub async fn run(&self) -> Result<()> {
        let ingress = IngressServer::bind(self.config.ingress_addr, self.mux.clone()).await?;
        info!("Ingress listening on {}", ingress.local_addr()?);

        let shutdown_rx = self.shutdown_tx.subscribe();
        let transport = self.transport.clone();
        let transport_handle = tokio::spawn(async move { transport.run().await });
        ingress.run(shutdown_rx).await;
        let _ = transport_handle.await;
        Ok(())
    }

    /// Permanent stop: reconnection is disabled for good and every
    /// tracked session and pending request is torn down right here.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.mux.teardown();
    }

    pub fn traffic_totals(&self) -> (u64, u64) {
        self.traffic.totals()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.transport.state()
    }
}
