use tokio::sync::mpsc;

/// Events the core emits toward the embedding host.
///
/// Delivered over a channel rather than callbacks so the core assumes
/// nothing about the host's scheduling model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    /// The relay acknowledged registration and assigned a device id
    Connected { device_id: String },
    /// The relay connection dropped or was shut down
    Disconnected,
    /// Running transfer totals changed
    Traffic { bytes_in: u64, bytes_out: u64 },
}

/// Cloneable sending side of the host event channel
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: mpsc::UnboundedSender<AgentEvent>,
}

impl EventBus {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AgentEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Fire-and-forget: a host that dropped its receiver loses events
    pub fn emit(&self, event: AgentEvent) {
        let _ = self.tx.send(event);
    }
}
