use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use peershare_common::Envelope;
use peershare_common::constants::{
    MAX_TUNNEL_BUFFER_BYTES, TUNNEL_CONNECT_TIMEOUT_SECS, TUNNEL_READ_CHUNK_BYTES,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::outbound::Outbound;
use crate::traffic::TrafficAccountant;

/// Per-session state. A session is either buffering or forwarding,
/// never both; holding an `Open` entry is the sole authority for
/// "this session owns a socket".
enum TunnelEntry {
    /// Socket not yet open; chunks queue here in arrival order
    Connecting {
        buffered: Vec<Vec<u8>>,
        buffered_bytes: usize,
    },
    /// Socket open; writes are serialized through the per-session
    /// writer task, reads flow from the reader task to the wire
    Open {
        tx: mpsc::UnboundedSender<Vec<u8>>,
        reader: JoinHandle<()>,
    },
}

/// Concurrent table of live tunnel sessions keyed by session id.
///
/// The entry lock makes the Connecting→Open transition (drain the buffer,
/// then swap the state) atomic with respect to concurrent `tunnel_data`
/// dispatch, which is what gives in-order exactly-once replay. No lock is
/// held across I/O; only channel sends happen under the entry lock.
pub struct TunnelTable {
    sessions: DashMap<String, TunnelEntry>,
    outbound: Outbound,
    traffic: Arc<TrafficAccountant>,
}

impl TunnelTable {
    pub fn new(outbound: Outbound, traffic: Arc<TrafficAccountant>) -> Self {
        Self {
            sessions: DashMap::new(),
            outbound,
            traffic,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Ensure a buffering entry exists for a session whose connect is in
    /// flight. Leaves an already-open session untouched.
    pub fn register_connecting(&self, session_id: &str) {
        self.sessions
            .entry(session_id.to_string())
            .or_insert_with(|| TunnelEntry::Connecting {
                buffered: Vec::new(),
                buffered_bytes: 0,
            });
    }

    /// Apply one inbound chunk: write it if the session is open, queue it
    /// in arrival order otherwise.
    pub fn write_or_buffer(&self, session_id: &str, data: Vec<u8>) {
        let mut failure = None;
        {
            let mut entry = self
                .sessions
                .entry(session_id.to_string())
                .or_insert_with(|| TunnelEntry::Connecting {
                    buffered: Vec::new(),
                    buffered_bytes: 0,
                });
            match entry.value_mut() {
                TunnelEntry::Connecting {
                    buffered,
                    buffered_bytes,
                } => {
                    if *buffered_bytes + data.len() > MAX_TUNNEL_BUFFER_BYTES {
                        failure = Some("pre-connect buffer overflow");
                    } else {
                        *buffered_bytes += data.len();
                        buffered.push(data);
                    }
                }
                TunnelEntry::Open { tx, .. } => {
                    self.traffic.record(0, data.len() as u64);
                    if tx.send(data).is_err() {
                        failure = Some("session writer gone");
                    }
                }
            }
        }
        if let Some(error) = failure {
            self.close(session_id, Some(error));
        }
    }

    /// Connect the target socket for a session and promote it to Open,
    /// replaying anything buffered meanwhile. On failure the session is
    /// reported closed and never becomes active.
    pub async fn open(self: Arc<Self>, session_id: String, host: String, port: u16) {
        let target = format!("{}:{}", host, port);
        let connect = TcpStream::connect(target.clone());
        let timeout = Duration::from_secs(TUNNEL_CONNECT_TIMEOUT_SECS);
        let stream = match tokio::time::timeout(timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.reject(&session_id, &format!("connect {}: {}", target, e));
                return;
            }
            Err(_) => {
                self.reject(&session_id, &format!("connect {}: timed out", target));
                return;
            }
        };

        debug!("tunnel {} connected to {}", session_id, target);
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(rx, write_half, self.clone(), session_id.clone()));
        let reader = tokio::spawn(read_loop(read_half, self.clone(), session_id.clone()));

        let mut stale_reader = None;
        match self.sessions.get_mut(&session_id) {
            Some(mut entry) => {
                let mut duplicate = false;
                match entry.value_mut() {
                    TunnelEntry::Connecting { buffered, .. } => {
                        for chunk in std::mem::take(buffered) {
                            self.traffic.record(0, chunk.len() as u64);
                            let _ = tx.send(chunk);
                        }
                    }
                    TunnelEntry::Open { .. } => duplicate = true,
                }
                if duplicate {
                    warn!("duplicate tunnel_connect for open session {}", session_id);
                    stale_reader = Some(reader);
                } else {
                    *entry.value_mut() = TunnelEntry::Open { tx, reader };
                }
            }
            // closed while the connect was in flight
            None => stale_reader = Some(reader),
        }
        if let Some(handle) = stale_reader {
            handle.abort();
        }
    }

    /// Connect failure: report and discard, the session never activates
    fn reject(&self, session_id: &str, error: &str) {
        warn!("tunnel {} failed: {}", session_id, error);
        self.sessions.remove(session_id);
        let _ = self
            .outbound
            .send(&Envelope::tunnel_closed(session_id, Some(error)));
    }

    /// Idempotent close: remove-and-return decides the single caller that
    /// reports `tunnel_closed` and discards the buffer or socket.
    pub fn close(&self, session_id: &str, error: Option<&str>) {
        if let Some((_, entry)) = self.sessions.remove(session_id) {
            debug!("tunnel {} closed", session_id);
            let _ = self
                .outbound
                .send(&Envelope::tunnel_closed(session_id, error));
            if let TunnelEntry::Open { tx, reader } = entry {
                drop(tx);
                reader.abort();
            }
        }
    }

    /// Close every tracked session; used on connection loss and shutdown
    pub fn close_all(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.close(&id, None);
        }
    }
}

/// Socket → wire: read until EOF or error, emitting each chunk in order
async fn read_loop(mut read_half: OwnedReadHalf, table: Arc<TunnelTable>, session_id: String) {
    let mut buf = vec![0u8; TUNNEL_READ_CHUNK_BYTES];
    loop {
        match read_half.read(&mut buf).await {
            Ok(0) => {
                table.close(&session_id, None);
                break;
            }
            Ok(n) => {
                table.traffic.record(n as u64, 0);
                let frame = Envelope::tunnel_data(&session_id, &buf[..n]);
                if table.outbound.send(&frame).is_err() {
                    table.close(&session_id, None);
                    break;
                }
            }
            Err(e) => {
                table.close(&session_id, Some(&e.to_string()));
                break;
            }
        }
    }
}

/// Wire → socket: one writer per session keeps writes serialized
async fn write_loop(
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    mut write_half: OwnedWriteHalf,
    table: Arc<TunnelTable>,
    session_id: String,
) {
    while let Some(chunk) = rx.recv().await {
        if let Err(e) = write_half.write_all(&chunk).await {
            table.close(&session_id, Some(&e.to_string()));
            break;
        }
    }
}
