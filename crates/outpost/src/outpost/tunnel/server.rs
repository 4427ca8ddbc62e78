use std::{
    net::SocketAddr,
    sync::{Arc, LazyLock},
    time::Duration,
};

use anyhow::Context;
use axum::{
    Router,
    extract::{
        ConnectInfo, State,
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use bytes::Bytes;
use rand::{RngExt, rng};
use regex::Regex;
use tokio::{
    sync::{mpsc, watch},
    time::Instant,
};

use crate::outpost::{
    auth::Authenticator,
    net,
    tunnel::{
        connection::TunnelConnection,
        protocol::{self, Message, OpenTunnel, ProtocolError},
        registry::{RegisterError, Registry},
    },
};

static SUBDOMAIN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?$").expect("valid subdomain pattern")
});

const RANDOM_SUBDOMAIN_LEN: usize = 8;
const SUBDOMAIN_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const OUTBOUND_QUEUE: usize = 256;

#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub base_domain: String,
    pub public_scheme: String,
    pub handshake_timeout: Duration,
    pub max_body_bytes: usize,
    /// Period of relay-initiated pings.
    pub ping_interval: Duration,
    /// A tunnel that sends nothing (not even a pong) for this long is dropped.
    pub idle_timeout: Duration,
}

#[derive(Clone)]
pub struct RelayState {
    pub registry: Arc<Registry>,
    pub auth: Arc<dyn Authenticator>,
    pub opts: Arc<RelayOptions>,
    pub shutdown: watch::Receiver<bool>,
}

pub fn router(state: RelayState) -> Router {
    Router::new().fallback(upgrade).with_state(state)
}

pub async fn serve_with_shutdown(listen_addr: &str, state: RelayState) -> anyhow::Result<()> {
    let addr = net::normalize_bind_addr(listen_addr);
    let listener = tokio::net::TcpListener::bind(addr.as_ref())
        .await
        .with_context(|| format!("tunnel: bind {addr}"))?;
    tracing::info!(addr = %addr, "tunnel: listening");
    serve_listener(listener, state).await
}

pub async fn serve_listener(
    listener: tokio::net::TcpListener,
    state: RelayState,
) -> anyhow::Result<()> {
    let mut shutdown = state.shutdown.clone();
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        net::shutdown_requested(&mut shutdown).await;
    })
    .await
    .context("tunnel: serve")
}

async fn upgrade(
    State(st): State<RelayState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    let limit = protocol::max_frame_len(st.opts.max_body_bytes);
    ws.max_frame_size(limit)
        .max_message_size(limit)
        .on_upgrade(move |socket| handle_socket(st, socket, peer))
}

/// Picks the public identifier for a tunnel: the custom domain when one was requested
/// (already checked by the authenticator), else the requested or a random subdomain.
pub fn assign_tunnel_id(req: &OpenTunnel, base_domain: &str) -> Result<String, Message> {
    if let Some(domain) = req.custom_domain.as_deref().map(str::trim) {
        if !domain.is_empty() {
            return Ok(domain.trim_end_matches('.').to_ascii_lowercase());
        }
    }

    let sub = match req.subdomain.as_deref().map(str::trim) {
        Some(s) if !s.is_empty() => {
            let s = s.to_ascii_lowercase();
            if !SUBDOMAIN_RE.is_match(&s) {
                return Err(Message::error(
                    protocol::ERR_INVALID_SUBDOMAIN,
                    format!("invalid subdomain {s:?}"),
                ));
            }
            s
        }
        _ => random_subdomain(),
    };
    Ok(format!("{sub}.{base_domain}"))
}

fn random_subdomain() -> String {
    let mut r = rng();
    (0..RANDOM_SUBDOMAIN_LEN)
        .map(|_| SUBDOMAIN_ALPHABET[r.random_range(0..SUBDOMAIN_ALPHABET.len())] as char)
        .collect()
}

type WsSink = SplitSink<WebSocket, WsMessage>;
type WsStream = SplitStream<WebSocket>;

async fn send(sink: &mut WsSink, msg: &Message) -> anyhow::Result<()> {
    let text = protocol::encode(msg)?;
    sink.send(WsMessage::Text(text.into()))
        .await
        .context("tunnel: write frame")
}

async fn reject(mut sink: WsSink, msg: Message) {
    if let Message::Error { code, message } = &msg {
        tracing::info!(code = %code, reason = %message, "tunnel: handshake rejected");
        metrics::counter!("outpost_tunnel_handshakes_total", "result" => code.clone()).increment(1);
    }
    let _ = send(&mut sink, &msg).await;
    let _ = sink.send(WsMessage::Close(None)).await;
    let _ = sink.close().await;
}

/// Next data frame, skipping control frames. `None` once the peer is gone.
async fn next_text(stream: &mut WsStream) -> Option<Result<String, ProtocolError>> {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(WsMessage::Text(t)) => return Some(Ok(t.as_str().to_owned())),
            Ok(WsMessage::Binary(_)) => return Some(Err(ProtocolError::Binary)),
            Ok(WsMessage::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
    None
}

async fn handle_socket(st: RelayState, socket: WebSocket, peer: SocketAddr) {
    let (mut sink, mut stream) = socket.split();

    let open = match tokio::time::timeout(st.opts.handshake_timeout, next_text(&mut stream)).await
    {
        Ok(Some(frame)) => match frame.and_then(|text| protocol::decode(&text)) {
            Ok(Message::OpenTunnel(open)) => open,
            Ok(other) => {
                let msg = format!("expected open_tunnel, got {}", other.kind());
                return reject(sink, Message::error(protocol::ERR_BAD_HANDSHAKE, msg)).await;
            }
            Err(err) => {
                return reject(
                    sink,
                    Message::error(protocol::ERR_BAD_HANDSHAKE, err.to_string()),
                )
                .await;
            }
        },
        Ok(None) => return,
        Err(_) => {
            return reject(
                sink,
                Message::error(protocol::ERR_BAD_HANDSHAKE, "handshake timed out"),
            )
            .await;
        }
    };

    let grant = match st.auth.authorize(&open).await {
        Ok(g) => g,
        Err(err) => return reject(sink, Message::error(err.code(), err.to_string())).await,
    };

    let tunnel_id = match assign_tunnel_id(&open, &st.opts.base_domain) {
        Ok(id) => id,
        Err(msg) => return reject(sink, msg).await,
    };

    let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE);
    let serial = st.registry.next_serial();
    let conn = Arc::new(TunnelConnection::new(
        serial,
        tunnel_id.clone(),
        grant.metadata(),
        out_tx,
        Some(peer),
    ));

    if let Err(RegisterError::Taken(id)) = st.registry.register(conn.clone()) {
        let msg = format!("{id} is already in use");
        return reject(sink, Message::error(protocol::ERR_SUBDOMAIN_TAKEN, msg)).await;
    }

    let url = format!("{}://{}", st.opts.public_scheme, tunnel_id);
    if let Err(err) = send(&mut sink, &Message::TunnelOpened { url: url.clone() }).await {
        tracing::debug!(tunnel = %tunnel_id, err = %err, "tunnel: client left during handshake");
        conn.mark_closed();
        st.registry.unregister(&tunnel_id, serial);
        return;
    }

    metrics::counter!("outpost_tunnel_handshakes_total", "result" => "ok").increment(1);
    tracing::info!(
        tunnel = %tunnel_id,
        url = %url,
        org = grant.organization_id.as_deref().unwrap_or(""),
        remote = %peer,
        serial,
        "tunnel: opened"
    );

    let writer = tokio::spawn(write_loop(
        sink,
        out_rx,
        conn.closed(),
        st.opts.ping_interval,
    ));
    read_loop(&conn, &mut stream, st.shutdown.clone(), st.opts.idle_timeout).await;

    conn.mark_closed();
    st.registry.unregister(&tunnel_id, serial);
    let _ = writer.await;

    tracing::info!(tunnel = %tunnel_id, remote = %peer, serial, "tunnel: closed");
}

async fn write_loop(
    mut sink: WsSink,
    mut out_rx: mpsc::Receiver<Message>,
    mut closed: watch::Receiver<bool>,
    ping_interval: Duration,
) {
    let period = ping_interval.max(Duration::from_millis(10));
    let mut ping = tokio::time::interval_at(Instant::now() + period, period);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            msg = out_rx.recv() => {
                let Some(msg) = msg else { break };
                if let Err(err) = send(&mut sink, &msg).await {
                    tracing::debug!(err = %err, "tunnel: write failed");
                    break;
                }
            }
            _ = ping.tick() => {
                if let Err(err) = sink.send(WsMessage::Ping(Bytes::new())).await {
                    tracing::debug!(err = %err, "tunnel: ping failed");
                    break;
                }
            }
            true = net::shutdown_requested(&mut closed) => break,
        }
    }
    let _ = sink.send(WsMessage::Close(None)).await;
    let _ = sink.close().await;
}

async fn read_loop(
    conn: &TunnelConnection,
    stream: &mut WsStream,
    mut shutdown: watch::Receiver<bool>,
    idle_timeout: Duration,
) {
    let mut closed = conn.closed();
    let idle = tokio::time::sleep(idle_timeout);
    tokio::pin!(idle);
    loop {
        tokio::select! {
            frame = stream.next() => {
                // Any frame, pongs included, proves the peer is alive.
                idle.as_mut().reset(Instant::now() + idle_timeout);
                let text = match frame {
                    Some(Ok(WsMessage::Text(t))) => t.as_str().to_owned(),
                    Some(Ok(WsMessage::Binary(_))) => {
                        tracing::warn!(tunnel = %conn.tunnel_id(), "tunnel: dropping binary frame");
                        continue;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        tracing::debug!(tunnel = %conn.tunnel_id(), err = %err, "tunnel: read failed");
                        break;
                    }
                };
                match protocol::decode(&text) {
                    Ok(msg) => conn.handle_inbound(msg),
                    Err(err) => {
                        tracing::warn!(tunnel = %conn.tunnel_id(), err = %err, "tunnel: dropping malformed frame");
                    }
                }
            }
            () = &mut idle => {
                metrics::counter!("outpost_tunnel_idle_closes_total").increment(1);
                tracing::warn!(
                    tunnel = %conn.tunnel_id(),
                    idle_ms = idle_timeout.as_millis() as u64,
                    "tunnel: peer silent; closing"
                );
                break;
            }
            true = net::shutdown_requested(&mut closed) => break,
            true = net::shutdown_requested(&mut shutdown) => break,
        }
    }
}
