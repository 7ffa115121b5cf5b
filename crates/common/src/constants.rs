/// Heartbeat interval while connected to the relay (30 seconds)
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Timeout waiting for an `http_response` to a forwarded request (30 seconds)
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

/// TCP connect timeout for tunnel targets (30 seconds)
pub const TUNNEL_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Reconnect backoff step (5 seconds per failed attempt)
pub const RECONNECT_STEP_SECS: u64 = 5;

/// Backoff cap: delays stop growing after this many failed attempts
pub const RECONNECT_MAX_STEP: u32 = 6;

/// Bound on the best-effort public IP lookup during the handshake (5 seconds)
pub const IP_LOOKUP_TIMEOUT_SECS: u64 = 5;

/// Maximum bytes queued for a tunnel session before its socket is open (8 MiB)
pub const MAX_TUNNEL_BUFFER_BYTES: usize = 8 * 1024 * 1024;

/// Maximum size of an ingress request head (64 KiB)
pub const INGRESS_MAX_HEAD_BYTES: usize = 64 * 1024;

/// Read chunk size for tunnel socket forwarding (16 KiB)
pub const TUNNEL_READ_CHUNK_BYTES: usize = 16 * 1024;
