use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use peershare_common::constants::INGRESS_MAX_HEAD_BYTES;
use peershare_common::{RelayError, decode_body, synthesize_response};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::mux::SessionMux;

/// Minimal HTTP/1.1 listener for the embedding process: every request is
/// forwarded through the relay via `send_http_request` and the correlated
/// response is translated back. One response per request.
pub struct IngressServer {
    listener: TcpListener,
    mux: Arc<SessionMux>,
}

/// A fully-read ingress request, ready to forward
struct ParsedRequest {
    method: String,
    url: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl IngressServer {
    /// Bind exclusively to the configured local address
    pub async fn bind(addr: SocketAddr, mux: Arc<SessionMux>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, mux })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("ingress connection from {}", peer);
                        let mux = self.mux.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_client(stream, mux).await {
                                debug!("ingress connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        warn!("ingress accept failed: {}", e);
                        break;
                    }
                },
                _ = shutdown.changed() => break,
            }
        }
        debug!("Ingress server exiting");
    }
}

async fn handle_client(mut stream: TcpStream, mux: Arc<SessionMux>) -> std::io::Result<()> {
    let request = match read_request(&mut stream).await? {
        Some(request) => request,
        None => {
            write_plain_response(&mut stream, 400, "malformed request").await?;
            return stream.shutdown().await;
        }
    };

    debug!("ingress request: {} {}", request.method, request.url);
    let result = mux
        .send_http_request(
            &request.method,
            &request.url,
            &request.headers,
            Some(&request.body),
        )
        .await;

    match result {
        Ok(response) => match decode_body(&response.body) {
            Ok(body) => {
                let blob = synthesize_response(response.status_code, &response.headers, &body);
                stream.write_all(&blob).await?;
            }
            Err(e) => {
                write_plain_response(&mut stream, 500, &format!("bad response body: {}", e))
                    .await?;
            }
        },
        Err(RelayError::NotConnected) => {
            write_plain_response(&mut stream, 503, "relay not connected").await?;
        }
        Err(RelayError::Timeout) => {
            write_plain_response(&mut stream, 504, "relay request timed out").await?;
        }
        Err(e) => {
            write_plain_response(&mut stream, 500, &e.to_string()).await?;
        }
    }
    stream.shutdown().await
}

/// Read one request: head via httparse, then the body per the declared
/// Content-Length. Returns None for anything unparsable.
async fn read_request(stream: &mut TcpStream) -> std::io::Result<Option<ParsedRequest>> {
    let mut buf: Vec<u8> = Vec::with_capacity(1024);

    let (method, target, headers, head_len) = loop {
        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > INGRESS_MAX_HEAD_BYTES {
            return Ok(None);
        }

        let mut header_slots = [httparse::EMPTY_HEADER; 64];
        let mut parsed = httparse::Request::new(&mut header_slots);
        match parsed.parse(&buf) {
            Ok(httparse::Status::Complete(head_len)) => {
                let method = parsed.method.unwrap_or("").to_string();
                let target = parsed.path.unwrap_or("").to_string();
                let mut headers = HashMap::new();
                for header in parsed.headers.iter() {
                    headers.insert(
                        header.name.to_ascii_lowercase(),
                        String::from_utf8_lossy(header.value).trim().to_string(),
                    );
                }
                break (method, target, headers, head_len);
            }
            Ok(httparse::Status::Partial) => continue,
            Err(_) => return Ok(None),
        }
    };

    if method.is_empty() || target.is_empty() {
        return Ok(None);
    }

    let content_length = headers
        .get("content-length")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = buf[head_len..].to_vec();
    while body.len() < content_length {
        let mut chunk = vec![0u8; (content_length - body.len()).min(64 * 1024)];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);

    // absolute-form targets pass through; origin-form needs a Host header
    let url = if target.starts_with("http://") || target.starts_with("https://") {
        target
    } else {
        match headers.get("host") {
            Some(host) => format!("http://{}{}", host, target),
            None => return Ok(None),
        }
    };

    Ok(Some(ParsedRequest {
        method,
        url,
        headers,
        body,
    }))
}

async fn write_plain_response(
    stream: &mut TcpStream,
    status: u16,
    body: &str,
) -> std::io::Result<()> {
    let mut headers = HashMap::new();
    headers.insert(
        "content-type".to_string(),
        "text/plain; charset=utf-8".to_string(),
    );
    let blob = synthesize_response(status, &headers, body.as_bytes());
    stream.write_all(&blob).await
}
