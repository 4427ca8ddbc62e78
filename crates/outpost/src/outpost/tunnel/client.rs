use std::{sync::Mutex, time::Duration};

use bytes::{Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use http::{HeaderMap, HeaderName, HeaderValue};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::{Message as WsMessage, protocol::WebSocketConfig};

use crate::outpost::{
    config::{ClientConfig, DEFAULT_MAX_BODY_BYTES},
    net,
    tunnel::protocol::{
        self, Headers, HeaderValues, Message, OpenTunnel, ProtocolError, TunnelRequest,
        TunnelResponse,
    },
};

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub server_url: String,
    pub local_host: String,
    pub local_port: u16,
    pub api_key: Option<String>,
    pub subdomain: Option<String>,
    pub custom_domain: Option<String>,
    pub reconnect_delay: Duration,
    pub ping_interval: Duration,
    pub local_timeout: Duration,
    /// Largest local response body relayed back; bigger ones become a 502.
    pub max_body_bytes: usize,
}

impl ClientOptions {
    pub fn new(server_url: impl Into<String>, local_port: u16) -> Self {
        Self {
            server_url: server_url.into(),
            local_host: "localhost".into(),
            local_port,
            api_key: None,
            subdomain: None,
            custom_domain: None,
            reconnect_delay: Duration::from_secs(2),
            ping_interval: Duration::from_secs(30),
            local_timeout: Duration::from_secs(60),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl From<&ClientConfig> for ClientOptions {
    fn from(c: &ClientConfig) -> Self {
        Self {
            server_url: c.server_url.clone(),
            local_host: c.local_host.clone(),
            local_port: c.local_port,
            api_key: c.api_key.clone(),
            subdomain: c.subdomain.clone(),
            custom_domain: c.custom_domain.clone(),
            reconnect_delay: c.reconnect_delay,
            ping_interval: c.ping_interval,
            local_timeout: c.local_timeout,
            max_body_bytes: c.max_body_bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    Stopped,
    AuthFailed(String),
    SubdomainTaken(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    Connecting,
    Open { url: String },
    Closing,
    Terminated(TerminationReason),
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("subdomain taken: {0}")]
    SubdomainTaken(String),
    #[error("build local http client: {0}")]
    HttpClient(#[source] reqwest::Error),
}

#[derive(Debug, thiserror::Error)]
enum LocalTargetError {
    #[error("invalid method {0:?}")]
    InvalidMethod(String),
    #[error("{0}")]
    Unreachable(#[source] reqwest::Error),
    #[error("response too large")]
    TooLarge,
}

enum SessionEnd {
    Disconnected,
    Stopped,
    Terminal(ClientError),
}

/// Keeps one tunnel open to the relay and replays relayed requests against the local
/// service, reconnecting after `reconnect_delay` until stopped or rejected for good.
pub struct Client {
    opts: ClientOptions,
    http: reqwest::Client,
    local_base: String,
    subdomain: Mutex<Option<String>>,
    state_tx: watch::Sender<ClientState>,
    stop_tx: watch::Sender<bool>,
}

impl Client {
    pub fn new(opts: ClientOptions) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(opts.local_timeout)
            .build()
            .map_err(ClientError::HttpClient)?;

        let host = if opts.local_host.contains(':') && !opts.local_host.starts_with('[') {
            format!("[{}]", opts.local_host)
        } else {
            opts.local_host.clone()
        };
        let local_base = format!("http://{}:{}", host, opts.local_port);

        let (state_tx, _) = watch::channel(ClientState::Idle);
        let (stop_tx, _) = watch::channel(false);
        Ok(Self {
            subdomain: Mutex::new(opts.subdomain.clone()),
            opts,
            http,
            local_base,
            state_tx,
            stop_tx,
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<ClientState> {
        self.state_tx.subscribe()
    }

    /// Subdomain sent on the next `open_tunnel`; learned from the relay once opened.
    pub fn current_subdomain(&self) -> Option<String> {
        self.subdomain
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Closes the tunnel and suppresses reconnection. Safe to call repeatedly.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    fn set_state(&self, s: ClientState) {
        tracing::debug!(state = ?s, "tunnel client: state");
        self.state_tx.send_replace(s);
    }

    pub async fn run(&self) -> Result<(), ClientError> {
        let mut stop = self.stop_tx.subscribe();

        while !*stop.borrow() {
            self.set_state(ClientState::Connecting);

            match self.session(&mut stop).await {
                SessionEnd::Stopped => break,
                SessionEnd::Terminal(err) => {
                    let reason = match &err {
                        ClientError::AuthFailed(m) => TerminationReason::AuthFailed(m.clone()),
                        ClientError::SubdomainTaken(m) => {
                            TerminationReason::SubdomainTaken(m.clone())
                        }
                        ClientError::HttpClient(_) => TerminationReason::Stopped,
                    };
                    tracing::error!(err = %err, "tunnel client: giving up");
                    self.set_state(ClientState::Terminated(reason));
                    return Err(err);
                }
                SessionEnd::Disconnected => {}
            }

            self.set_state(ClientState::Closing);
            self.set_state(ClientState::Idle);
            tracing::warn!(
                server = %self.opts.server_url,
                retry_in_ms = self.opts.reconnect_delay.as_millis() as u64,
                "tunnel client: disconnected; reconnecting"
            );

            tokio::select! {
                _ = tokio::time::sleep(self.opts.reconnect_delay) => {}
                true = net::shutdown_requested(&mut stop) => break,
            }
        }

        self.set_state(ClientState::Terminated(TerminationReason::Stopped));
        Ok(())
    }

    async fn session(&self, stop: &mut watch::Receiver<bool>) -> SessionEnd {
        let limit = protocol::max_frame_len(self.opts.max_body_bytes);
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(limit);
        config.max_frame_size = Some(limit);
        let dial = tokio_tungstenite::connect_async_with_config(
            self.opts.server_url.as_str(),
            Some(config),
            false,
        );
        let ws = tokio::select! {
            res = dial => match res {
                Ok((ws, _)) => ws,
                Err(err) => {
                    tracing::warn!(server = %self.opts.server_url, err = %err, "tunnel client: dial failed");
                    return SessionEnd::Disconnected;
                }
            },
            true = net::shutdown_requested(stop) => return SessionEnd::Stopped,
        };
        let (mut sink, mut stream) = ws.split();

        let open = Message::OpenTunnel(OpenTunnel {
            api_key: self.opts.api_key.clone(),
            subdomain: self.current_subdomain(),
            custom_domain: self.opts.custom_domain.clone(),
        });
        if send(&mut sink, &open).await.is_err() {
            return SessionEnd::Disconnected;
        }

        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        let period = self.opts.ping_interval.max(Duration::from_millis(10));
        let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        let mut opened = false;

        let end = loop {
            tokio::select! {
                frame = stream.next() => {
                    let decoded = match frame {
                        Some(Ok(WsMessage::Text(t))) => protocol::decode(&t),
                        Some(Ok(WsMessage::Binary(_))) => Err(ProtocolError::Binary),
                        Some(Ok(WsMessage::Close(_))) | None => break SessionEnd::Disconnected,
                        Some(Ok(_)) => continue,
                        Some(Err(err)) => {
                            tracing::debug!(err = %err, "tunnel client: read failed");
                            break SessionEnd::Disconnected;
                        }
                    };
                    match decoded {
                        Ok(msg) => {
                            if let Some(end) = self.on_message(msg, &mut opened, &out_tx) {
                                break end;
                            }
                        }
                        Err(err) if !opened => {
                            tracing::warn!(err = %err, "tunnel client: malformed handshake reply");
                            break SessionEnd::Disconnected;
                        }
                        Err(err) => {
                            tracing::warn!(err = %err, "tunnel client: dropping malformed frame");
                        }
                    }
                }
                Some(msg) = out_rx.recv() => {
                    if send(&mut sink, &msg).await.is_err() {
                        break SessionEnd::Disconnected;
                    }
                }
                _ = ping.tick() => {
                    if sink.send(WsMessage::Ping(Vec::new())).await.is_err() {
                        break SessionEnd::Disconnected;
                    }
                }
                true = net::shutdown_requested(stop) => break SessionEnd::Stopped,
            }
        };

        let _ = sink.send(WsMessage::Close(None)).await;
        let _ = sink.close().await;
        end
    }

    fn on_message(
        &self,
        msg: Message,
        opened: &mut bool,
        out_tx: &mpsc::Sender<Message>,
    ) -> Option<SessionEnd> {
        match msg {
            Message::TunnelOpened { url } => {
                *opened = true;
                if self.opts.custom_domain.is_none() {
                    if let Some(sub) = first_label(&url) {
                        *self.subdomain.lock().unwrap_or_else(|e| e.into_inner()) = Some(sub);
                    }
                }
                tracing::info!(url = %url, local = %self.local_base, "tunnel client: tunnel open");
                self.set_state(ClientState::Open { url });
            }
            Message::Error { code, message } if protocol::is_terminal_error_code(&code) => {
                let err = if code == protocol::ERR_AUTH_FAILED {
                    ClientError::AuthFailed(message)
                } else {
                    ClientError::SubdomainTaken(message)
                };
                return Some(SessionEnd::Terminal(err));
            }
            Message::Error { code, message } => {
                tracing::warn!(code = %code, message = %message, "tunnel client: relay error");
            }
            Message::Request(req) => {
                let http = self.http.clone();
                let base = self.local_base.clone();
                let max_body = self.opts.max_body_bytes;
                let out_tx = out_tx.clone();
                tokio::spawn(async move {
                    let resp = forward_local(&http, &base, max_body, req).await;
                    let _ = out_tx.send(Message::Response(resp)).await;
                });
            }
            other => {
                tracing::debug!(kind = other.kind(), "tunnel client: ignoring message");
            }
        }
        None
    }
}

async fn send<S>(sink: &mut S, msg: &Message) -> anyhow::Result<()>
where
    S: futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let text = protocol::encode(msg)?;
    sink.send(WsMessage::Text(text)).await?;
    Ok(())
}

fn first_label(url: &str) -> Option<String> {
    let u = url::Url::parse(url).ok()?;
    let host = u.host_str()?;
    let label = host.split('.').next()?;
    (!label.is_empty()).then(|| label.to_string())
}

/// Replays `req` against the local service. Never fails: local errors become a 502.
async fn forward_local(
    http: &reqwest::Client,
    base: &str,
    max_body: usize,
    req: TunnelRequest,
) -> TunnelResponse {
    let request_id = req.request_id.clone();
    let method = req.method.clone();
    let path = req.path.clone();

    match replay(http, base, max_body, req).await {
        Ok(resp) => {
            tracing::debug!(method = %method, path = %path, status = resp.status_code, "tunnel client: forwarded");
            resp
        }
        Err(err) => {
            tracing::warn!(method = %method, path = %path, err = %err, "tunnel client: local target failed");
            let mut headers = Headers::new();
            headers.insert(
                "content-type".into(),
                HeaderValues::One("text/plain".into()),
            );
            TunnelResponse {
                request_id,
                status_code: 502,
                headers,
                body: Some(Bytes::from(format!("Bad Gateway: {err}"))),
            }
        }
    }
}

async fn replay(
    http: &reqwest::Client,
    base: &str,
    max_body: usize,
    req: TunnelRequest,
) -> Result<TunnelResponse, LocalTargetError> {
    let method = reqwest::Method::from_bytes(req.method.as_bytes())
        .map_err(|_| LocalTargetError::InvalidMethod(req.method.clone()))?;

    let url = if req.path.starts_with('/') {
        format!("{base}{}", req.path)
    } else {
        format!("{base}/{}", req.path)
    };

    let mut headers = HeaderMap::new();
    for (name, value) in protocol::header_pairs(&req.headers) {
        if net::is_hop_by_hop(name) {
            continue;
        }
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            continue;
        };
        headers.append(name, value);
    }

    let mut rb = http.request(method, url).headers(headers);
    if let Some(body) = req.body {
        rb = rb.body(body);
    }

    let mut resp = rb.send().await.map_err(LocalTargetError::Unreachable)?;
    if resp.content_length().is_some_and(|n| n > max_body as u64) {
        return Err(LocalTargetError::TooLarge);
    }
    let status_code = resp.status().as_u16();
    let mut headers = protocol::headers_from_map(resp.headers());
    headers.retain(|name, _| !net::is_hop_by_hop(name));

    let mut body = BytesMut::new();
    while let Some(chunk) = resp.chunk().await.map_err(LocalTargetError::Unreachable)? {
        if body.len() + chunk.len() > max_body {
            return Err(LocalTargetError::TooLarge);
        }
        body.extend_from_slice(&chunk);
    }

    Ok(TunnelResponse {
        request_id: req.request_id,
        status_code,
        headers,
        body: (!body.is_empty()).then(|| body.freeze()),
    })
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, sync::Arc};

    use axum::{Router, routing::get};
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::WebSocketStream;

    use super::*;

    type ServerWs = WebSocketStream<TcpStream>;

    async fn fake_relay() -> (TcpListener, String) {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/", ln.local_addr().unwrap());
        (ln, url)
    }

    async fn accept(ln: &TcpListener) -> ServerWs {
        let (tcp, _) = tokio::time::timeout(Duration::from_secs(5), ln.accept())
            .await
            .expect("client connected")
            .unwrap();
        tokio_tungstenite::accept_async(tcp).await.unwrap()
    }

    async fn recv(ws: &mut ServerWs) -> Message {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("frame in time")
                .expect("stream open")
                .unwrap();
            if let WsMessage::Text(t) = frame {
                return protocol::decode(&t).unwrap();
            }
        }
    }

    async fn push(ws: &mut ServerWs, msg: Message) {
        ws.send(WsMessage::Text(protocol::encode(&msg).unwrap()))
            .await
            .unwrap();
    }

    fn opts(url: &str, port: u16) -> ClientOptions {
        let mut o = ClientOptions::new(url, port);
        o.local_host = "127.0.0.1".into();
        o.reconnect_delay = Duration::from_millis(50);
        o
    }

    async fn local_target() -> SocketAddr {
        let app = Router::new()
            .route("/hello", get(|| async { "hi" }))
            .route(
                "/echo",
                axum::routing::post(|headers: http::HeaderMap, body: Bytes| async move {
                    let tag = headers
                        .get("x-tag")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    ([("x-tag", tag)], body)
                }),
            )
            .route(
                "/moved",
                get(|| async { axum::response::Redirect::temporary("/hello") }),
            );
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(ln, app).await;
        });
        addr
    }

    #[tokio::test]
    async fn reconnect_resends_learned_subdomain() {
        let (ln, url) = fake_relay().await;
        let client = Arc::new(Client::new(opts(&url, 1)).unwrap());
        let mut states = client.subscribe();
        let run = tokio::spawn({
            let c = client.clone();
            async move { c.run().await }
        });

        let mut ws = accept(&ln).await;
        let Message::OpenTunnel(first) = recv(&mut ws).await else {
            panic!("expected open_tunnel");
        };
        assert_eq!(first.subdomain, None);
        push(
            &mut ws,
            Message::TunnelOpened {
                url: "https://abcd.example.dev".into(),
            },
        )
        .await;
        states
            .wait_for(|s| matches!(s, ClientState::Open { .. }))
            .await
            .unwrap();
        assert_eq!(client.current_subdomain().as_deref(), Some("abcd"));
        drop(ws);

        let mut ws = accept(&ln).await;
        let Message::OpenTunnel(second) = recv(&mut ws).await else {
            panic!("expected open_tunnel");
        };
        assert_eq!(second.subdomain.as_deref(), Some("abcd"));

        push(&mut ws, Message::error(protocol::ERR_AUTH_FAILED, "bad key")).await;
        let res = run.await.unwrap();
        assert!(matches!(res, Err(ClientError::AuthFailed(m)) if m == "bad key"));
        assert_eq!(
            *client.subscribe().borrow(),
            ClientState::Terminated(TerminationReason::AuthFailed("bad key".into()))
        );
    }

    #[tokio::test]
    async fn subdomain_taken_is_terminal() {
        let (ln, url) = fake_relay().await;
        let mut o = opts(&url, 1);
        o.subdomain = Some("mine".into());
        let client = Client::new(o).unwrap();

        let relay = async {
            let mut ws = accept(&ln).await;
            let Message::OpenTunnel(open) = recv(&mut ws).await else {
                panic!("expected open_tunnel");
            };
            assert_eq!(open.subdomain.as_deref(), Some("mine"));
            push(&mut ws, Message::error(protocol::ERR_SUBDOMAIN_TAKEN, "taken")).await;
            ws
        };

        let (res, _ws) = tokio::join!(client.run(), relay);
        assert!(matches!(res, Err(ClientError::SubdomainTaken(_))));

        // No reconnect attempt follows.
        assert!(
            tokio::time::timeout(Duration::from_millis(300), ln.accept())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn non_terminal_error_keeps_session() {
        let (ln, url) = fake_relay().await;
        let client = Arc::new(Client::new(opts(&url, 1)).unwrap());
        let run = tokio::spawn({
            let c = client.clone();
            async move { c.run().await }
        });

        let mut ws = accept(&ln).await;
        let _ = recv(&mut ws).await;
        push(&mut ws, Message::error(protocol::ERR_INVALID_SUBDOMAIN, "nope")).await;
        push(
            &mut ws,
            Message::TunnelOpened {
                url: "http://zz.example.dev".into(),
            },
        )
        .await;

        let mut states = client.subscribe();
        states
            .wait_for(|s| *s == ClientState::Open { url: "http://zz.example.dev".into() })
            .await
            .unwrap();

        client.stop();
        client.stop();
        assert!(run.await.unwrap().is_ok());
        assert_eq!(
            *client.subscribe().borrow(),
            ClientState::Terminated(TerminationReason::Stopped)
        );
    }

    #[tokio::test]
    async fn requests_are_replayed_against_local_target() {
        let target = local_target().await;
        let (ln, url) = fake_relay().await;
        let client = Arc::new(Client::new(opts(&url, target.port())).unwrap());
        let run = tokio::spawn({
            let c = client.clone();
            async move { c.run().await }
        });

        let mut ws = accept(&ln).await;
        let _ = recv(&mut ws).await;
        push(
            &mut ws,
            Message::TunnelOpened {
                url: "http://abcd.example.dev".into(),
            },
        )
        .await;

        let mut headers = Headers::new();
        headers.insert("x-tag".into(), HeaderValues::One("t1".into()));
        headers.insert("connection".into(), HeaderValues::One("keep-alive".into()));
        push(
            &mut ws,
            Message::Request(TunnelRequest {
                request_id: "1".into(),
                method: "POST".into(),
                path: "/echo".into(),
                headers,
                body: Some(Bytes::from_static(b"payload")),
            }),
        )
        .await;
        push(
            &mut ws,
            Message::Request(TunnelRequest {
                request_id: "2".into(),
                method: "GET".into(),
                path: "/moved".into(),
                headers: Headers::new(),
                body: None,
            }),
        )
        .await;

        let mut got = std::collections::HashMap::new();
        while got.len() < 2 {
            if let Message::Response(r) = recv(&mut ws).await {
                got.insert(r.request_id.clone(), r);
            }
        }

        let echo = &got["1"];
        assert_eq!(echo.status_code, 200);
        assert_eq!(echo.body.as_deref(), Some(&b"payload"[..]));
        assert_eq!(
            echo.headers.get("x-tag"),
            Some(&HeaderValues::One("t1".into()))
        );

        // Redirects are passed back, not followed.
        let moved = &got["2"];
        assert_eq!(moved.status_code, 307);
        assert_eq!(
            moved.headers.get("location"),
            Some(&HeaderValues::One("/hello".into()))
        );

        client.stop();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unreachable_local_target_answers_502() {
        let dead_port = {
            let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
            ln.local_addr().unwrap().port()
        };
        let (ln, url) = fake_relay().await;
        let client = Arc::new(Client::new(opts(&url, dead_port)).unwrap());
        let run = tokio::spawn({
            let c = client.clone();
            async move { c.run().await }
        });

        let mut ws = accept(&ln).await;
        let _ = recv(&mut ws).await;
        push(
            &mut ws,
            Message::Request(TunnelRequest {
                request_id: "9".into(),
                method: "GET".into(),
                path: "/".into(),
                headers: Headers::new(),
                body: None,
            }),
        )
        .await;

        let Message::Response(resp) = recv(&mut ws).await else {
            panic!("expected response");
        };
        assert_eq!(resp.request_id, "9");
        assert_eq!(resp.status_code, 502);
        assert_eq!(
            resp.headers.get("content-type"),
            Some(&HeaderValues::One("text/plain".into()))
        );
        let body = String::from_utf8(resp.body.unwrap().to_vec()).unwrap();
        assert!(body.starts_with("Bad Gateway: "), "{body}");

        client.stop();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn local_response_over_limit_answers_502() {
        let target = local_target().await;
        let (ln, url) = fake_relay().await;
        let mut o = opts(&url, target.port());
        o.max_body_bytes = 1;
        let client = Arc::new(Client::new(o).unwrap());
        let run = tokio::spawn({
            let c = client.clone();
            async move { c.run().await }
        });

        let mut ws = accept(&ln).await;
        let _ = recv(&mut ws).await;
        push(
            &mut ws,
            Message::Request(TunnelRequest {
                request_id: "big".into(),
                method: "GET".into(),
                path: "/hello".into(),
                headers: Headers::new(),
                body: None,
            }),
        )
        .await;

        let Message::Response(resp) = recv(&mut ws).await else {
            panic!("expected response");
        };
        assert_eq!(resp.status_code, 502);
        assert_eq!(
            resp.body.as_deref(),
            Some(&b"Bad Gateway: response too large"[..])
        );

        client.stop();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn binary_frames_are_treated_as_malformed() {
        let (ln, url) = fake_relay().await;
        let client = Arc::new(Client::new(opts(&url, 1)).unwrap());
        let run = tokio::spawn({
            let c = client.clone();
            async move { c.run().await }
        });

        // Before the tunnel opens a binary reply ends the session.
        let mut ws = accept(&ln).await;
        let _ = recv(&mut ws).await;
        let opened = protocol::encode(&Message::TunnelOpened {
            url: "http://abcd.example.dev".into(),
        })
        .unwrap();
        ws.send(WsMessage::Binary(opened.clone().into_bytes()))
            .await
            .unwrap();

        // The client redials; once open, binary frames are dropped without a reconnect.
        let mut ws = accept(&ln).await;
        let _ = recv(&mut ws).await;
        push(
            &mut ws,
            Message::TunnelOpened {
                url: "http://abcd.example.dev".into(),
            },
        )
        .await;
        let mut states = client.subscribe();
        states
            .wait_for(|s| matches!(s, ClientState::Open { .. }))
            .await
            .unwrap();
        ws.send(WsMessage::Binary(opened.into_bytes())).await.unwrap();
        assert!(
            tokio::time::timeout(Duration::from_millis(300), ln.accept())
                .await
                .is_err()
        );
        assert!(matches!(
            *client.subscribe().borrow(),
            ClientState::Open { .. }
        ));

        client.stop();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn stop_before_run_returns_immediately() {
        let client = Client::new(opts("ws://127.0.0.1:9/", 1)).unwrap();
        client.stop();
        client.run().await.unwrap();
        assert_eq!(
            *client.subscribe().borrow(),
            ClientState::Terminated(TerminationReason::Stopped)
        );
    }

    #[test]
    fn first_label_of_tunnel_url() {
        assert_eq!(
            first_label("https://abcd.example.dev").as_deref(),
            Some("abcd")
        );
        assert_eq!(first_label("http://x.localhost:8080/").as_deref(), Some("x"));
        assert_eq!(first_label("not a url"), None);
    }
}
