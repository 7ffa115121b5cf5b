use std::sync::atomic::{AtomicU64, Ordering};

use crate::events::{AgentEvent, EventBus};

/// Running byte-transfer totals, fed by every path that moves payload
/// bytes: the legacy proxy path, the direct-fetch path, and raw tunnel
/// reads and writes. Deltas are decoded payload lengths, never wire or
/// Base64 lengths. Totals only grow; they reset with the process.
#[derive(Debug)]
pub struct TrafficAccountant {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    events: EventBus,
}

impl TrafficAccountant {
    pub fn new(events: EventBus) -> Self {
        Self {
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            events,
        }
    }

    /// Add a delta and forward the new running totals to the host
    pub fn record(&self, bytes_in: u64, bytes_out: u64) {
        if bytes_in == 0 && bytes_out == 0 {
            return;
        }
        let total_in = self.bytes_in.fetch_add(bytes_in, Ordering::Relaxed) + bytes_in;
        let total_out = self.bytes_out.fetch_add(bytes_out, Ordering::Relaxed) + bytes_out;
        self.events.emit(AgentEvent::Traffic {
            bytes_in: total_in,
            bytes_out: total_out,
        });
    }

    pub fn totals(&self) -> (u64, u64) {
        (
            self.bytes_in.load(Ordering::Relaxed),
            self.bytes_out.load(Ordering::Relaxed),
        )
    }
}
