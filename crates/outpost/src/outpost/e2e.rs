//! Relay endpoint, gateway, tunnel client and a local target wired together over loopback.

use std::{sync::Arc, time::Duration};

use axum::{
    Router,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
};
use futures_util::{SinkExt, StreamExt};
use tokio::{net::TcpListener, sync::watch};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::outpost::{
    auth::StaticAuthenticator,
    config::DEFAULT_MAX_BODY_BYTES,
    gateway::{self, Gateway, GatewayOptions, OfflinePage},
    quota::MemoryUsageCounter,
    telemetry::RecentEvents,
    tunnel::{
        client::{Client, ClientOptions, ClientState},
        registry::Registry,
        protocol::{self, Message, OpenTunnel},
        server::{self, RelayOptions, RelayState},
    },
};

const BIG_BODY: usize = 13 * 1024 * 1024;
const HUGE_BODY: usize = 20 * 1024 * 1024;

struct Relay {
    tunnel_url: String,
    ingress: String,
    registry: Arc<Registry>,
    recent: Arc<RecentEvents>,
    _shutdown: watch::Sender<bool>,
}

fn relay_options(max_body_bytes: usize) -> RelayOptions {
    RelayOptions {
        base_domain: "example.dev".into(),
        public_scheme: "https".into(),
        handshake_timeout: Duration::from_secs(2),
        max_body_bytes,
        ping_interval: Duration::from_secs(30),
        idle_timeout: Duration::from_secs(90),
    }
}

async fn start_relay() -> Relay {
    start_relay_with(relay_options(DEFAULT_MAX_BODY_BYTES)).await
}

async fn start_relay_with(opts: RelayOptions) -> Relay {
    let max_body_bytes = opts.max_body_bytes;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let registry = Arc::new(Registry::new(Duration::from_secs(5)));
    let recent = Arc::new(RecentEvents::new(32));

    let state = RelayState {
        registry: registry.clone(),
        auth: Arc::new(StaticAuthenticator::new(&[], false)),
        opts: Arc::new(opts),
        shutdown: shutdown_rx.clone(),
    };
    let tunnel_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let tunnel_addr = tunnel_listener.local_addr().unwrap();
    tokio::spawn(server::serve_listener(tunnel_listener, state));

    let gw = Arc::new(Gateway::new(
        registry.clone(),
        Arc::new(MemoryUsageCounter::new()),
        recent.clone(),
        OfflinePage::from_template("<p>{{TUNNEL_ID}} is down</p>"),
        GatewayOptions {
            base_domain: "example.dev".into(),
            block_over_quota_responses: true,
            max_body_bytes,
        },
    ));
    let ingress_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ingress_addr = ingress_listener.local_addr().unwrap();
    tokio::spawn(gateway::serve_listener(ingress_listener, gw, shutdown_rx));

    Relay {
        tunnel_url: format!("ws://{tunnel_addr}/"),
        ingress: format!("http://{ingress_addr}"),
        registry,
        recent,
        _shutdown: shutdown_tx,
    }
}

async fn start_target() -> u16 {
    let app = Router::new()
        .route("/hello", get(|| async { "hi" }))
        .route("/big", get(|| async { vec![b'a'; BIG_BODY] }))
        .route("/huge", get(|| async { vec![b'a'; HUGE_BODY] }))
        .route(
            "/echo",
            post(|headers: HeaderMap, body: String| async move {
                let tag = headers
                    .get("x-tag")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                (StatusCode::CREATED, [("x-echo-tag", tag)], body)
            }),
        );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move { axum::serve(listener, app).await });
    port
}

async fn unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn client_options(relay: &Relay, local_port: u16, subdomain: &str) -> ClientOptions {
    let mut opts = ClientOptions::new(relay.tunnel_url.clone(), local_port);
    opts.local_host = "127.0.0.1".into();
    opts.subdomain = Some(subdomain.into());
    opts.reconnect_delay = Duration::from_millis(50);
    opts.local_timeout = Duration::from_secs(2);
    opts
}

async fn open_client(relay: &Relay, local_port: u16, subdomain: &str) -> (Arc<Client>, String) {
    open_client_with(client_options(relay, local_port, subdomain)).await
}

async fn open_client_with(opts: ClientOptions) -> (Arc<Client>, String) {
    let client = Arc::new(Client::new(opts).unwrap());
    let mut state = client.subscribe();
    let runner = client.clone();
    tokio::spawn(async move { runner.run().await });

    let url = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let open = match &*state.borrow_and_update() {
                ClientState::Open { url } => Some(url.clone()),
                _ => None,
            };
            if let Some(url) = open {
                break url;
            }
            state.changed().await.unwrap();
        }
    })
    .await
    .expect("tunnel opened");
    (client, url)
}

#[tokio::test]
async fn public_request_reaches_local_service() {
    let relay = start_relay().await;
    let port = start_target().await;
    let (client, url) = open_client(&relay, port, "abcd").await;
    assert_eq!(url, "https://abcd.example.dev");

    let http = reqwest::Client::new();
    let resp = http
        .get(format!("{}/hello", relay.ingress))
        .header("host", "abcd.example.dev")
        .header("user-agent", "e2e")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    assert_eq!(resp.text().await.unwrap(), "hi");

    let resp = http
        .post(format!("{}/echo", relay.ingress))
        .header("host", "abcd.example.dev:443")
        .header("x-tag", "blue")
        .body("payload")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::CREATED);
    assert_eq!(resp.headers()["x-echo-tag"], "blue");
    assert_eq!(resp.text().await.unwrap(), "payload");

    let events = relay.recent.snapshot(Some("abcd.example.dev"), 10);
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].method, "POST");
    assert_eq!(events[0].bytes_in, 7);
    assert_eq!(events[1].path, "/hello");
    assert_eq!(events[1].user_agent, "e2e");
    assert_eq!(events[1].client_ip, "127.0.0.1");

    client.stop();
}

#[tokio::test]
async fn unreachable_local_service_is_bad_gateway() {
    let relay = start_relay().await;
    let port = unused_port().await;
    let (client, _) = open_client(&relay, port, "down").await;

    let resp = reqwest::Client::new()
        .get(format!("{}/anything", relay.ingress))
        .header("host", "down.example.dev")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_GATEWAY);
    assert!(resp.text().await.unwrap().starts_with("Bad Gateway"));

    client.stop();
}

#[tokio::test]
async fn missing_or_killed_tunnel_serves_offline_page() {
    let relay = start_relay().await;
    let port = start_target().await;
    let http = reqwest::Client::new();

    let resp = http
        .get(format!("{}/", relay.ingress))
        .header("host", "nope.example.dev")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_GATEWAY);
    assert_eq!(resp.text().await.unwrap(), "<p>nope.example.dev is down</p>");

    let resp = http
        .get(format!("{}/", relay.ingress))
        .header("host", "example.dev")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);

    let (client, _) = open_client(&relay, port, "gone").await;
    client.stop();
    tokio::time::timeout(Duration::from_secs(5), async {
        while relay.registry.lookup("gone.example.dev").is_some() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("tunnel unregistered after client stop");

    let resp = http
        .get(format!("{}/hello", relay.ingress))
        .header("host", "gone.example.dev")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn large_bodies_cross_the_tunnel_and_oversize_responses_are_refused() {
    let relay = start_relay_with(relay_options(16 * 1024 * 1024)).await;
    let port = start_target().await;
    let mut opts = client_options(&relay, port, "bulk");
    opts.max_body_bytes = 16 * 1024 * 1024;
    opts.local_timeout = Duration::from_secs(10);
    let (client, _) = open_client_with(opts).await;
    let serial = relay.registry.lookup("bulk.example.dev").unwrap().serial();

    let http = reqwest::Client::new();
    let resp = http
        .get(format!("{}/big", relay.ingress))
        .header("host", "bulk.example.dev")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    assert_eq!(resp.bytes().await.unwrap().len(), BIG_BODY);

    let resp = http
        .get(format!("{}/huge", relay.ingress))
        .header("host", "bulk.example.dev")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_GATEWAY);
    assert_eq!(
        resp.text().await.unwrap(),
        "Bad Gateway: response too large"
    );

    // The same tunnel connection carried every request.
    assert_eq!(
        relay.registry.lookup("bulk.example.dev").unwrap().serial(),
        serial
    );
    client.stop();
}

#[tokio::test]
async fn silent_peer_is_unregistered_after_idle_window() {
    let mut opts = relay_options(DEFAULT_MAX_BODY_BYTES);
    opts.ping_interval = Duration::from_millis(50);
    opts.idle_timeout = Duration::from_millis(250);
    let relay = start_relay_with(opts).await;
    let port = start_target().await;

    let (mut ws, _) = tokio_tungstenite::connect_async(relay.tunnel_url.as_str())
        .await
        .unwrap();
    let open = Message::OpenTunnel(OpenTunnel {
        api_key: None,
        subdomain: Some("quiet".into()),
        custom_domain: None,
    });
    ws.send(WsMessage::Text(protocol::encode(&open).unwrap()))
        .await
        .unwrap();
    let Some(Ok(WsMessage::Text(reply))) = ws.next().await else {
        panic!("expected tunnel_opened");
    };
    assert!(matches!(
        protocol::decode(&reply).unwrap(),
        Message::TunnelOpened { .. }
    ));
    assert!(relay.registry.lookup("quiet.example.dev").is_some());

    // Stop reading: pings go unanswered from here on.
    tokio::time::timeout(Duration::from_secs(5), async {
        while relay.registry.lookup("quiet.example.dev").is_some() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("silent tunnel unregistered");

    // An anonymous client can take the name again.
    let (client, url) = open_client(&relay, port, "quiet").await;
    assert_eq!(url, "https://quiet.example.dev");
    client.stop();
    drop(ws);
}

#[tokio::test]
async fn binary_handshake_is_rejected() {
    let relay = start_relay().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(relay.tunnel_url.as_str())
        .await
        .unwrap();
    ws.send(WsMessage::Binary(br#"{"type":"open_tunnel"}"#.to_vec()))
        .await
        .unwrap();

    let Some(Ok(WsMessage::Text(reply))) = ws.next().await else {
        panic!("expected error frame");
    };
    match protocol::decode(&reply).unwrap() {
        Message::Error { code, message } => {
            assert_eq!(code, protocol::ERR_BAD_HANDSHAKE);
            assert_eq!(message, "binary frames are not supported");
        }
        other => panic!("unexpected {}", other.kind()),
    }
    assert!(relay.registry.snapshot().is_empty());
}
