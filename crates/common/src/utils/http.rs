use http::StatusCode;
use std::collections::HashMap;

/// Reason phrase for a status code, empty for codes without one
pub fn status_reason(status: u16) -> &'static str {
    StatusCode::from_u16(status)
        .ok()
        .and_then(|code| code.canonical_reason())
        .unwrap_or("")
}

/// Headers the synthesizer owns: the body is already decoded, so any
/// upstream framing or encoding declaration would be wrong.
fn is_recomputed_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("content-length")
        || name.eq_ignore_ascii_case("transfer-encoding")
        || name.eq_ignore_ascii_case("content-encoding")
        || name.eq_ignore_ascii_case("connection")
}

/// Build a raw HTTP/1.1 response blob: status line, header lines, blank
/// line, body. Length and encoding headers are recomputed from the body.
pub fn synthesize_response(
    status: u16,
    headers: &HashMap<String, String>,
    body: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 256);
    out.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", status, status_reason(status)).as_bytes());
    for (name, value) in headers {
        if is_recomputed_header(name) {
            continue;
        }
        out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
    }
    out.extend_from_slice(format!("content-length: {}\r\n", body.len()).as_bytes());
    out.extend_from_slice(b"connection: close\r\n\r\n");
    out.extend_from_slice(body);
    out
}
