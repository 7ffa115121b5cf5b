use std::sync::{Arc, Mutex};

use peershare_common::{Envelope, RelayError, Result};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;

/// Handle onto the currently-live relay connection's write channel.
///
/// The transport binds a fresh sender on every successful connect and
/// clears it on disconnect; everything else (multiplexer, tunnel loops,
/// ingress) sends through this handle and gets `NotConnected` while the
/// link is down.
#[derive(Clone, Default)]
pub struct Outbound {
    tx: Arc<Mutex<Option<mpsc::UnboundedSender<WsMessage>>>>,
}

impl Outbound {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, tx: mpsc::UnboundedSender<WsMessage>) {
        if let Ok(mut slot) = self.tx.lock() {
            *slot = Some(tx);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut slot) = self.tx.lock() {
            *slot = None;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.tx.lock().map(|slot| slot.is_some()).unwrap_or(false)
    }

    /// Serialize and queue an envelope for the write task
    pub fn send(&self, envelope: &Envelope) -> Result<()> {
        let text = envelope.to_text()?;
        let slot = self
            .tx
            .lock()
            .map_err(|_| RelayError::InternalError("outbound lock poisoned".to_string()))?;
        match slot.as_ref() {
            Some(tx) => tx
                .send(WsMessage::Text(text.into()))
                .map_err(|_| RelayError::NotConnected),
            None => Err(RelayError::NotConnected),
        }
    }
}
