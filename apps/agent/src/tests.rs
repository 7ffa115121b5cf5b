//! Cross-module tests: multiplexer dispatch, tunnel buffering, pending
//! request correlation, ingress forwarding, agent teardown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use peershare_common::{
    Envelope, ProxyErrorPayload, ProxyRequest, ProxyResponse, RelayError, Result,
    TunnelClosedPayload, TunnelDataPayload, decode_body, encode_body, kind,
};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::agent::Agent;
use crate::config::Config;
use crate::events::{AgentEvent, EventBus};
use crate::fetch::{DirectFetch, ProxyHandler};
use crate::ingress::IngressServer;
use crate::mux::SessionMux;
use crate::outbound::Outbound;
use crate::traffic::TrafficAccountant;
use crate::transport::ConnectionState;

type Wire = mpsc::UnboundedReceiver<WsMessage>;

fn test_mux_with_handler(
    handler: Arc<dyn ProxyHandler>,
    request_timeout: Duration,
) -> (Arc<SessionMux>, Wire, mpsc::UnboundedReceiver<AgentEvent>) {
    let (events, events_rx) = EventBus::new();
    let traffic = Arc::new(TrafficAccountant::new(events.clone()));
    let outbound = Outbound::new();
    let (tx, rx) = mpsc::unbounded_channel();
    outbound.bind(tx);
    let fetcher = DirectFetch::new().unwrap();
    let mux = Arc::new(SessionMux::new(
        outbound,
        traffic,
        events,
        handler,
        fetcher,
        request_timeout,
    ));
    (mux, rx, events_rx)
}

fn test_mux(
    request_timeout: Duration,
) -> (Arc<SessionMux>, Wire, mpsc::UnboundedReceiver<AgentEvent>) {
    let fetcher = DirectFetch::new().unwrap();
    test_mux_with_handler(Arc::new(fetcher), request_timeout)
}

/// A mux whose outbound sink was never bound, as after a disconnect
fn test_mux_offline() -> Arc<SessionMux> {
    let (events, _events_rx) = EventBus::new();
    let traffic = Arc::new(TrafficAccountant::new(events.clone()));
    let fetcher = DirectFetch::new().unwrap();
    Arc::new(SessionMux::new(
        Outbound::new(),
        traffic,
        events,
        Arc::new(fetcher.clone()),
        fetcher,
        Duration::from_secs(5),
    ))
}

async fn next_envelope(wire: &mut Wire) -> Envelope {
    match tokio::time::timeout(Duration::from_secs(5), wire.recv()).await {
        Ok(Some(WsMessage::Text(text))) => Envelope::from_text(&text).unwrap(),
        other => panic!("expected a frame, got {:?}", other),
    }
}

fn tunnel_connect_env(session_id: &str, host: &str, port: u16) -> Envelope {
    Envelope {
        kind: kind::TUNNEL_CONNECT.to_string(),
        payload: json!({ "sessionId": session_id, "host": host, "port": port }),
    }
}

fn tunnel_data_env(session_id: &str, data: &[u8]) -> Envelope {
    Envelope {
        kind: kind::TUNNEL_DATA.to_string(),
        payload: json!({ "sessionId": session_id, "data": encode_body(data) }),
    }
}

// --- pending request correlation ---

#[tokio::test]
async fn test_send_http_request_resolves_once() {
    let (mux, mut wire, _events) = test_mux(Duration::from_secs(5));

    let call = {
        let mux = mux.clone();
        tokio::spawn(async move {
            mux.send_http_request("GET", "http://example.com/", &HashMap::new(), None)
                .await
        })
    };

    let envelope = next_envelope(&mut wire).await;
    assert_eq!(envelope.kind, kind::HTTP_REQUEST);
    let request: ProxyRequest = envelope.decode().unwrap();
    assert_eq!(request.method, "GET");

    let response = json!({
        "requestId": request.request_id,
        "statusCode": 200,
        "headers": {},
        "body": encode_body(b"hello"),
    });
    mux.dispatch(Envelope {
        kind: kind::HTTP_RESPONSE.to_string(),
        payload: response.clone(),
    });

    let result = call.await.unwrap().unwrap();
    assert_eq!(result.status_code, 200);
    assert_eq!(decode_body(&result.body).unwrap(), b"hello");
    assert_eq!(mux.pending_len(), 0);

    // a late duplicate for the same id is a no-op
    mux.dispatch(Envelope {
        kind: kind::HTTP_RESPONSE.to_string(),
        payload: response,
    });
    assert_eq!(mux.pending_len(), 0);
}

#[tokio::test]
async fn test_send_http_request_timeout_removes_entry() {
    let (mux, mut wire, _events) = test_mux(Duration::from_millis(50));

    let result = mux
        .send_http_request("GET", "http://example.com/", &HashMap::new(), None)
        .await;
    assert!(matches!(result, Err(RelayError::Timeout)));
    assert_eq!(mux.pending_len(), 0);

    // the request frame itself still went out before the deadline hit
    let envelope = next_envelope(&mut wire).await;
    assert_eq!(envelope.kind, kind::HTTP_REQUEST);
}

#[tokio::test]
async fn test_concurrent_requests_resolve_independently() {
    let (mux, mut wire, _events) = test_mux(Duration::from_secs(5));

    let first = {
        let mux = mux.clone();
        tokio::spawn(async move {
            mux.send_http_request("GET", "http://example.com/a", &HashMap::new(), None)
                .await
        })
    };
    let second = {
        let mux = mux.clone();
        tokio::spawn(async move {
            mux.send_http_request("GET", "http://example.com/b", &HashMap::new(), None)
                .await
        })
    };

    let req_a: ProxyRequest = next_envelope(&mut wire).await.decode().unwrap();
    let req_b: ProxyRequest = next_envelope(&mut wire).await.decode().unwrap();
    assert_ne!(req_a.request_id, req_b.request_id);

    // answer in reverse order; each call still gets its own response
    for (request, body) in [(&req_b, "second"), (&req_a, "first")] {
        mux.dispatch(Envelope {
            kind: kind::HTTP_RESPONSE.to_string(),
            payload: json!({
                "requestId": request.request_id,
                "statusCode": 200,
                "headers": {},
                "body": encode_body(body.as_bytes()),
            }),
        });
    }

    let (res_a, res_b) = (first.await.unwrap().unwrap(), second.await.unwrap().unwrap());
    let body_of = |r: &ProxyResponse| String::from_utf8(decode_body(&r.body).unwrap()).unwrap();
    let (body_a, body_b) = (body_of(&res_a), body_of(&res_b));
    assert!(
        (req_a.url.ends_with("/a") && body_a == "first")
            || (req_a.url.ends_with("/b") && body_a == "second")
    );
    assert_ne!(body_a, body_b);
}

#[tokio::test]
async fn test_send_http_request_while_offline() {
    let mux = test_mux_offline();
    let result = mux
        .send_http_request("GET", "http://example.com/", &HashMap::new(), None)
        .await;
    assert!(matches!(result, Err(RelayError::NotConnected)));
    assert_eq!(mux.pending_len(), 0);
}

// --- connected / events ---

#[tokio::test]
async fn test_connected_event_emitted() {
    let (mux, _wire, mut events) = test_mux(Duration::from_secs(5));

    mux.dispatch(Envelope {
        kind: kind::CONNECTED.to_string(),
        payload: json!({ "deviceId": "dev_42" }),
    });
    assert_eq!(
        events.try_recv().unwrap(),
        AgentEvent::Connected {
            device_id: "dev_42".to_string()
        }
    );

    // a connected message without a device id emits nothing
    mux.dispatch(Envelope {
        kind: kind::CONNECTED.to_string(),
        payload: json!({}),
    });
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_unknown_and_malformed_messages_ignored() {
    let (mux, _wire, _events) = test_mux(Duration::from_secs(5));

    mux.dispatch(Envelope {
        kind: "something_new".to_string(),
        payload: json!({}),
    });
    mux.dispatch(Envelope {
        kind: kind::TUNNEL_CONNECT.to_string(),
        payload: json!({ "host": 1 }),
    });

    assert_eq!(mux.tunnels().len(), 0);
    assert_eq!(mux.pending_len(), 0);
}

// --- tunnel sessions ---

#[tokio::test]
async fn test_tunnel_data_buffered_and_replayed_in_order() {
    let (mux, _wire, _events) = test_mux(Duration::from_secs(5));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 3];
        sock.read_exact(&mut buf).await.unwrap();
        buf.to_vec()
    });

    // "A" arrives before the session is even announced, "B" and "C"
    // while the connect is still in flight; replay must preserve order
    mux.dispatch(tunnel_data_env("s1", b"A"));
    mux.dispatch(tunnel_connect_env("s1", "127.0.0.1", addr.port()));
    mux.dispatch(tunnel_data_env("s1", b"B"));
    mux.dispatch(tunnel_data_env("s1", b"C"));

    assert_eq!(server.await.unwrap(), b"ABC".to_vec());
    assert_eq!(mux.tunnels().len(), 1);
}

#[tokio::test]
async fn test_tunnel_data_written_after_open() {
    let (mux, _wire, _events) = test_mux(Duration::from_secs(5));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 5];
        sock.read_exact(&mut buf).await.unwrap();
        buf.to_vec()
    });

    mux.dispatch(tunnel_connect_env("s1", "127.0.0.1", addr.port()));
    // let the connect task finish so the session is Open
    tokio::time::sleep(Duration::from_millis(100)).await;
    mux.dispatch(tunnel_data_env("s1", b"hello"));

    assert_eq!(server.await.unwrap(), b"hello".to_vec());
}

#[tokio::test]
async fn test_tunnel_connect_failure_reports_closed() {
    let (mux, mut wire, _events) = test_mux(Duration::from_secs(5));

    // nothing listens on port 1
    mux.dispatch(tunnel_connect_env("s1", "127.0.0.1", 1));

    let envelope = next_envelope(&mut wire).await;
    assert_eq!(envelope.kind, kind::TUNNEL_CLOSED);
    let payload: TunnelClosedPayload = envelope.decode().unwrap();
    assert_eq!(payload.session_id, "s1");
    assert!(payload.error.is_some());
    assert_eq!(mux.tunnels().len(), 0);
}

#[tokio::test]
async fn test_tunnel_reader_forwards_and_reports_eof() {
    let (mux, mut wire, _events) = test_mux(Duration::from_secs(5));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        sock.write_all(b"hi").await.unwrap();
        // drop closes the socket; the reader sees EOF
    });

    mux.dispatch(tunnel_connect_env("s1", "127.0.0.1", addr.port()));

    let data = next_envelope(&mut wire).await;
    assert_eq!(data.kind, kind::TUNNEL_DATA);
    let payload: TunnelDataPayload = data.decode().unwrap();
    assert_eq!(payload.session_id, "s1");
    assert_eq!(decode_body(&payload.data).unwrap(), b"hi");

    let closed = next_envelope(&mut wire).await;
    assert_eq!(closed.kind, kind::TUNNEL_CLOSED);
    assert_eq!(mux.tunnels().len(), 0);
}

#[tokio::test]
async fn test_tunnel_close_discards_session() {
    let (mux, mut wire, _events) = test_mux(Duration::from_secs(5));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (sock, _) = listener.accept().await.unwrap();
        // hold the socket open until the agent closes it
        let mut sock = sock;
        let mut buf = [0u8; 1];
        let _ = sock.read(&mut buf).await;
    });

    mux.dispatch(tunnel_connect_env("s1", "127.0.0.1", addr.port()));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(mux.tunnels().len(), 1);

    mux.dispatch(Envelope {
        kind: kind::TUNNEL_CLOSE.to_string(),
        payload: json!({ "sessionId": "s1" }),
    });

    let closed = next_envelope(&mut wire).await;
    assert_eq!(closed.kind, kind::TUNNEL_CLOSED);
    assert_eq!(mux.tunnels().len(), 0);
    let _ = server.await;
}

// --- proxy paths ---

struct StubHandler;

impl ProxyHandler for StubHandler {
    fn handle(&self, request: ProxyRequest) -> BoxFuture<'static, Result<ProxyResponse>> {
        Box::pin(async move {
            Ok(ProxyResponse {
                request_id: request.request_id,
                status_code: 200,
                headers: HashMap::new(),
                body: encode_body(b"ok"),
            })
        })
    }
}

struct FailingHandler;

impl ProxyHandler for FailingHandler {
    fn handle(&self, _request: ProxyRequest) -> BoxFuture<'static, Result<ProxyResponse>> {
        Box::pin(async move { Err(RelayError::HttpError("boom".to_string())) })
    }
}

#[tokio::test]
async fn test_proxy_request_uses_handler() {
    let (mux, mut wire, mut events) =
        test_mux_with_handler(Arc::new(StubHandler), Duration::from_secs(5));

    mux.dispatch(Envelope {
        kind: kind::PROXY_REQUEST.to_string(),
        payload: json!({ "requestId": "r1", "method": "GET", "url": "http://x/" }),
    });

    let envelope = next_envelope(&mut wire).await;
    assert_eq!(envelope.kind, kind::PROXY_RESPONSE);
    let response: ProxyResponse = envelope.decode().unwrap();
    assert_eq!(response.request_id, "r1");
    assert_eq!(response.status_code, 200);

    // decoded body length, not the base64 length, hits the accountant
    assert_eq!(
        events.try_recv().unwrap(),
        AgentEvent::Traffic {
            bytes_in: 2,
            bytes_out: 0
        }
    );
}

#[tokio::test]
async fn test_proxy_request_failure_sends_proxy_error() {
    let (mux, mut wire, _events) =
        test_mux_with_handler(Arc::new(FailingHandler), Duration::from_secs(5));

    mux.dispatch(Envelope {
        kind: kind::PROXY_REQUEST.to_string(),
        payload: json!({ "requestId": "r2", "method": "GET", "url": "http://x/" }),
    });

    let envelope = next_envelope(&mut wire).await;
    assert_eq!(envelope.kind, kind::PROXY_ERROR);
    let payload: ProxyErrorPayload = envelope.decode().unwrap();
    assert_eq!(payload.request_id, "r2");
    assert!(payload.error.contains("boom"));
}

#[tokio::test]
async fn test_direct_fetch_synthesizes_raw_response() {
    let (mux, mut wire, _events) = test_mux(Duration::from_secs(5));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 4096];
        let _ = sock.read(&mut buf).await;
        sock.write_all(
            b"HTTP/1.1 404 Not Found\r\ncontent-length: 9\r\nconnection: close\r\n\r\nnot found",
        )
        .await
        .unwrap();
    });

    mux.dispatch(Envelope {
        kind: kind::PROXY_HTTP_REQUEST.to_string(),
        payload: json!({
            "sessionId": "s2",
            "method": "GET",
            "url": format!("http://127.0.0.1:{}/404", addr.port()),
        }),
    });

    let envelope = next_envelope(&mut wire).await;
    assert_eq!(envelope.kind, kind::TUNNEL_DATA);
    let payload: TunnelDataPayload = envelope.decode().unwrap();
    assert_eq!(payload.session_id, "s2");
    let text = String::from_utf8(decode_body(&payload.data).unwrap()).unwrap();
    assert!(text.starts_with("HTTP/1.1 404"));
    assert!(text.ends_with("not found"));
}

#[tokio::test]
async fn test_direct_fetch_failure_becomes_502() {
    let (mux, mut wire, _events) = test_mux(Duration::from_secs(5));

    mux.dispatch(Envelope {
        kind: kind::PROXY_HTTP_REQUEST.to_string(),
        payload: json!({
            "sessionId": "s3",
            "method": "GET",
            "url": "http://127.0.0.1:1/",
        }),
    });

    let envelope = next_envelope(&mut wire).await;
    assert_eq!(envelope.kind, kind::TUNNEL_DATA);
    let payload: TunnelDataPayload = envelope.decode().unwrap();
    assert_eq!(payload.session_id, "s3");
    let text = String::from_utf8(decode_body(&payload.data).unwrap()).unwrap();
    assert!(text.starts_with("HTTP/1.1 502 Bad Gateway"));
    assert!(!text.ends_with("\r\n\r\n")); // the error text rides as the body
}

// --- teardown ---

#[tokio::test]
async fn test_teardown_empties_both_tables() {
    let (mux, mut wire, _events) = test_mux(Duration::from_secs(30));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (sock, _) = listener.accept().await.unwrap();
        let mut sock = sock;
        let mut buf = [0u8; 1];
        let _ = sock.read(&mut buf).await;
    });

    mux.dispatch(tunnel_connect_env("s1", "127.0.0.1", addr.port()));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let call = {
        let mux = mux.clone();
        tokio::spawn(async move {
            mux.send_http_request("GET", "http://example.com/", &HashMap::new(), None)
                .await
        })
    };
    let envelope = next_envelope(&mut wire).await;
    assert_eq!(envelope.kind, kind::HTTP_REQUEST);
    assert_eq!(mux.tunnels().len(), 1);
    assert_eq!(mux.pending_len(), 1);

    mux.teardown();
    assert_eq!(mux.tunnels().len(), 0);
    assert_eq!(mux.pending_len(), 0);

    // the dropped slot fails the in-flight call instead of leaving it hanging
    let result = call.await.unwrap();
    assert!(matches!(result, Err(RelayError::ConnectionError(_))));

    let closed = next_envelope(&mut wire).await;
    assert_eq!(closed.kind, kind::TUNNEL_CLOSED);
    let _ = server.await;
}

// --- ingress ---

#[tokio::test]
async fn test_ingress_503_when_relay_down() {
    let mux = test_mux_offline();
    let ingress = IngressServer::bind("127.0.0.1:0".parse().unwrap(), mux)
        .await
        .unwrap();
    let addr = ingress.local_addr().unwrap();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(ingress.run(shutdown_rx));

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(b"GET / HTTP/1.1\r\nhost: upstream.test\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    let text = String::from_utf8(response).unwrap();
    assert!(text.starts_with("HTTP/1.1 503"));
}

#[tokio::test]
async fn test_ingress_forwards_and_translates() {
    let (mux, mut wire, _events) = test_mux(Duration::from_secs(5));
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<ProxyRequest>();

    // stand-in relay: answer every forwarded request
    {
        let mux = mux.clone();
        tokio::spawn(async move {
            loop {
                let envelope = next_envelope(&mut wire).await;
                if envelope.kind != kind::HTTP_REQUEST {
                    continue;
                }
                let request: ProxyRequest = envelope.decode().unwrap();
                let _ = seen_tx.send(request.clone());
                mux.dispatch(Envelope {
                    kind: kind::HTTP_RESPONSE.to_string(),
                    payload: json!({
                        "requestId": request.request_id,
                        "statusCode": 200,
                        "headers": {
                            "content-type": "text/plain",
                            "content-length": "999",
                        },
                        "body": encode_body(b"pong"),
                    }),
                });
            }
        });
    }

    let ingress = IngressServer::bind("127.0.0.1:0".parse().unwrap(), mux)
        .await
        .unwrap();
    let addr = ingress.local_addr().unwrap();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(ingress.run(shutdown_rx));

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(
            b"POST /ping?x=1 HTTP/1.1\r\nHost: upstream.test\r\nX-Test: 1\r\ncontent-length: 5\r\n\r\nhello",
        )
        .await
        .unwrap();
    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    let text = String::from_utf8(response).unwrap();

    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    // the stale upstream length is replaced with the decoded body's
    assert!(text.contains("content-length: 4\r\n"));
    assert!(text.contains("content-type: text/plain\r\n"));
    assert!(text.ends_with("pong"));

    let forwarded = seen_rx.recv().await.unwrap();
    assert_eq!(forwarded.method, "POST");
    assert_eq!(forwarded.url, "http://upstream.test/ping?x=1");
    assert_eq!(forwarded.headers.get("x-test").map(String::as_str), Some("1"));
    assert_eq!(
        forwarded.body.as_deref().map(decode_body).unwrap().unwrap(),
        b"hello"
    );
}

#[tokio::test]
async fn test_ingress_rejects_malformed_request() {
    let mux = test_mux_offline();
    let ingress = IngressServer::bind("127.0.0.1:0".parse().unwrap(), mux)
        .await
        .unwrap();
    let addr = ingress.local_addr().unwrap();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(ingress.run(shutdown_rx));

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"garbage\r\n\r\n").await.unwrap();
    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    let text = String::from_utf8(response).unwrap();
    assert!(text.starts_with("HTTP/1.1 400"));
}

// --- agent lifecycle ---

#[tokio::test]
async fn test_agent_shutdown_is_absorbing() {
    // nothing listens on port 1, so the transport loops through
    // connect failures until shutdown stops it for good
    let config = Config::new("ws://127.0.0.1:1/agent", None);
    let (agent, _events) = Agent::new(config).unwrap();
    let agent = Arc::new(agent);

    let runner = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.run().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    agent.shutdown();

    tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .expect("run did not stop after shutdown")
        .unwrap()
        .unwrap();
    assert_eq!(agent.connection_state(), ConnectionState::Disconnected);
    assert_eq!(agent.traffic_totals(), (0, 0));
}
