//! Public HTTP ingress: resolves the tunnel from the `Host` header, enforces the
//! organization's bandwidth quota and forwards the request through the tunnel.

use std::{
    net::SocketAddr,
    path::Path,
    sync::Arc,
    time::{Instant, SystemTime},
};

use anyhow::Context;
use axum::{
    Router,
    body::Body,
    extract::{ConnectInfo, Request, State},
    response::{IntoResponse, Response},
};
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use http::{HeaderName, HeaderValue, StatusCode, header};
use tokio::sync::watch;

use crate::outpost::{
    net,
    quota::{self, QuotaError, UsageCounter},
    telemetry::{self, EventSink, TunnelEvent},
    tunnel::{
        connection::{BandwidthLimit, ForwardRequest, TunnelMetadata},
        pending::ForwardError,
        protocol::{self, TunnelResponse},
        registry::Registry,
    },
};

const OFFLINE_TOKEN: &str = "{{TUNNEL_ID}}";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaStage {
    Preflight,
    RequestBody,
    ResponseBody,
}

impl QuotaStage {
    fn as_str(self) -> &'static str {
        match self {
            QuotaStage::Preflight => "preflight",
            QuotaStage::RequestBody => "request_body",
            QuotaStage::ResponseBody => "response_body",
        }
    }
}

impl std::fmt::Display for QuotaStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
enum GatewayError {
    #[error("bandwidth limit exceeded at {0}")]
    QuotaExceeded(QuotaStage),
    #[error(transparent)]
    Forward(#[from] ForwardError),
    #[error(transparent)]
    Quota(#[from] QuotaError),
    #[error("read request body: {0}")]
    Body(String),
    #[error("request body exceeds {0} bytes")]
    TooLarge(usize),
    #[error("tunnel answered with invalid status {0}")]
    BadStatus(u16),
}

/// HTML served while a tunnel is unreachable.
#[derive(Debug, Clone, Default)]
pub struct OfflinePage {
    template: Option<String>,
}

impl OfflinePage {
    /// Loads the template at `path`. An unreadable file falls back to the inline page.
    pub fn load(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };
        match std::fs::read_to_string(path) {
            Ok(template) => Self::from_template(template),
            Err(err) => {
                tracing::warn!(path = %path.display(), err = %err, "gateway: offline page unreadable; using inline page");
                Self::default()
            }
        }
    }

    pub fn from_template(template: impl Into<String>) -> Self {
        Self {
            template: Some(template.into()),
        }
    }

    pub fn render(&self, tunnel_id: &str) -> String {
        let id = escape_html(tunnel_id);
        match &self.template {
            Some(t) => t.replace(OFFLINE_TOKEN, &id),
            None => format!("<h1>{id} is offline</h1>"),
        }
    }
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

#[derive(Debug, Clone)]
pub struct GatewayOptions {
    pub base_domain: String,
    pub block_over_quota_responses: bool,
    /// Largest request body forwarded through a tunnel.
    pub max_body_bytes: usize,
}

pub struct Gateway {
    registry: Arc<Registry>,
    usage: Arc<dyn UsageCounter>,
    events: Arc<dyn EventSink>,
    offline: OfflinePage,
    opts: GatewayOptions,
}

struct Proxied {
    response: TunnelResponse,
    bytes_in: u64,
    bytes_out: u64,
}

impl Gateway {
    pub fn new(
        registry: Arc<Registry>,
        usage: Arc<dyn UsageCounter>,
        events: Arc<dyn EventSink>,
        offline: OfflinePage,
        opts: GatewayOptions,
    ) -> Self {
        Self {
            registry,
            usage,
            events,
            offline,
            opts,
        }
    }

    pub async fn handle(&self, req: Request, peer: Option<SocketAddr>) -> Response {
        let started = Instant::now();

        let host = req
            .headers()
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .or_else(|| req.uri().host())
            .unwrap_or("")
            .to_string();

        let Some(tunnel_id) = net::tunnel_id_from_host(&host, &self.opts.base_domain) else {
            return finish(started, text(StatusCode::NOT_FOUND, "Tunnel not found"));
        };

        let method = req.method().to_string();
        let path = req
            .uri()
            .path_and_query()
            .map(|p| p.as_str().to_string())
            .unwrap_or_else(|| "/".into());
        let user_agent = header_str(&req, header::USER_AGENT);
        let client_ip = net::client_ip(
            req.headers()
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok()),
            peer.map(|p| p.ip()),
        );

        let metadata = self.registry.metadata(&tunnel_id);
        let quota = metadata
            .as_ref()
            .and_then(|m| match (&m.organization_id, m.bandwidth_limit) {
                (Some(org), BandwidthLimit::Bytes(limit)) => {
                    Some((quota::bandwidth_key(org, SystemTime::now()), limit))
                }
                _ => None,
            });

        let proxied = self
            .proxy(req, &tunnel_id, path.clone(), quota.as_ref().map(|(k, l)| (k.as_str(), *l)))
            .await
            .and_then(|p| {
                let resp = into_http_response(&p.response)?;
                Ok((p, resp))
            });

        match proxied {
            Ok((p, resp)) => {
                let md = metadata.unwrap_or_else(TunnelMetadata::anonymous);
                self.events.log(TunnelEvent {
                    timestamp: telemetry::now_unix_ms(),
                    tunnel_id: md.record_id.unwrap_or_else(|| tunnel_id.clone()),
                    organization_id: md.organization_id.unwrap_or_default(),
                    host,
                    method,
                    path,
                    status_code: p.response.status_code,
                    request_duration_ms: started.elapsed().as_millis() as u64,
                    bytes_in: p.bytes_in,
                    bytes_out: p.bytes_out,
                    client_ip,
                    user_agent,
                });
                finish(started, resp)
            }
            Err(GatewayError::QuotaExceeded(stage)) => {
                metrics::counter!("outpost_quota_rejections_total", "stage" => stage.as_str())
                    .increment(1);
                tracing::info!(tunnel = %tunnel_id, stage = %stage, "gateway: bandwidth limit exceeded");
                finish(
                    started,
                    text(StatusCode::PAYMENT_REQUIRED, "Bandwidth limit exceeded"),
                )
            }
            Err(GatewayError::TooLarge(limit)) => {
                tracing::info!(tunnel = %tunnel_id, limit, "gateway: request body too large");
                finish(
                    started,
                    text(StatusCode::PAYLOAD_TOO_LARGE, "Payload Too Large"),
                )
            }
            Err(GatewayError::Body(err)) => {
                tracing::debug!(tunnel = %tunnel_id, err = %err, "gateway: request body aborted");
                finish(started, text(StatusCode::BAD_REQUEST, "Bad Request"))
            }
            Err(err) => {
                match &err {
                    GatewayError::Forward(ForwardError::TunnelDisconnected) => {
                        tracing::info!(tunnel = %tunnel_id, "gateway: tunnel offline");
                    }
                    other => {
                        tracing::warn!(tunnel = %tunnel_id, err = %other, "gateway: proxy error");
                    }
                }
                let page = self.offline.render(&tunnel_id);
                finish(
                    started,
                    (
                        StatusCode::BAD_GATEWAY,
                        [(header::CONTENT_TYPE, "text/html")],
                        page,
                    )
                        .into_response(),
                )
            }
        }
    }

    async fn proxy(
        &self,
        req: Request,
        tunnel_id: &str,
        path: String,
        quota: Option<(&str, u64)>,
    ) -> Result<Proxied, GatewayError> {
        if let Some((key, limit)) = quota {
            if self.usage.get(key).await?.unwrap_or(0) >= limit {
                return Err(GatewayError::QuotaExceeded(QuotaStage::Preflight));
            }
        }

        let max_body = self.opts.max_body_bytes;
        let declared = req
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        if declared.is_some_and(|n| n > max_body as u64) {
            return Err(GatewayError::TooLarge(max_body));
        }

        let (parts, body) = req.into_parts();
        let mut stream = body.into_data_stream();
        let mut buf = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| GatewayError::Body(e.to_string()))?;
            // Size is checked before metering so a rejected body is not billed.
            if buf.len() + chunk.len() > max_body {
                return Err(GatewayError::TooLarge(max_body));
            }
            if let Some((key, limit)) = quota {
                if self.usage.incr_by(key, chunk.len() as u64).await? > limit {
                    return Err(GatewayError::QuotaExceeded(QuotaStage::RequestBody));
                }
            }
            buf.extend_from_slice(&chunk);
        }
        let bytes_in = buf.len() as u64;
        let body = (!buf.is_empty()).then(|| buf.freeze());

        let response = self
            .registry
            .forward_request(
                tunnel_id,
                ForwardRequest {
                    method: parts.method.to_string(),
                    path,
                    headers: protocol::headers_from_map(&parts.headers),
                    body,
                },
            )
            .await?;

        let bytes_out = response.body.as_ref().map_or(0, |b| b.len() as u64);
        if let Some((key, limit)) = quota {
            if bytes_out > 0 {
                let used = self.usage.incr_by(key, bytes_out).await?;
                if used > limit {
                    if self.opts.block_over_quota_responses {
                        return Err(GatewayError::QuotaExceeded(QuotaStage::ResponseBody));
                    }
                    let over = (used - limit).min(bytes_out);
                    metrics::counter!("outpost_quota_overage_bytes_total").increment(over);
                    tracing::warn!(
                        tunnel = %tunnel_id,
                        overage_bytes = over,
                        "gateway: response delivered over bandwidth limit"
                    );
                }
            }
        }

        Ok(Proxied {
            response,
            bytes_in,
            bytes_out,
        })
    }
}

fn header_str(req: &Request, name: HeaderName) -> String {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

fn text(status: StatusCode, body: &'static str) -> Response {
    (status, [(header::CONTENT_TYPE, "text/plain")], body).into_response()
}

fn finish(started: Instant, resp: Response) -> Response {
    metrics::counter!("outpost_ingress_requests_total", "status" => resp.status().as_u16().to_string())
        .increment(1);
    metrics::histogram!("outpost_ingress_request_duration_seconds")
        .record(started.elapsed().as_secs_f64());
    resp
}

fn into_http_response(r: &TunnelResponse) -> Result<Response, GatewayError> {
    let status =
        StatusCode::from_u16(r.status_code).map_err(|_| GatewayError::BadStatus(r.status_code))?;

    let body = r.body.clone().unwrap_or_else(Bytes::new);
    let mut resp = Response::new(Body::from(body));
    *resp.status_mut() = status;

    let headers = resp.headers_mut();
    for (name, value) in protocol::header_pairs(&r.headers) {
        if net::is_hop_by_hop(name) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.append(name, value);
        }
    }
    Ok(resp)
}

pub fn router(gw: Arc<Gateway>) -> Router {
    Router::new().fallback(ingress).with_state(gw)
}

async fn ingress(
    State(gw): State<Arc<Gateway>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    gw.handle(req, Some(peer)).await
}

pub async fn serve_with_shutdown(
    listen_addr: &str,
    gw: Arc<Gateway>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = net::normalize_bind_addr(listen_addr);
    let listener = tokio::net::TcpListener::bind(addr.as_ref())
        .await
        .with_context(|| format!("gateway: bind {addr}"))?;
    tracing::info!(addr = %addr, "gateway: listening");
    serve_listener(listener, gw, shutdown).await
}

pub async fn serve_listener(
    listener: tokio::net::TcpListener,
    gw: Arc<Gateway>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    axum::serve(
        listener,
        router(gw).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        net::shutdown_requested(&mut shutdown).await;
    })
    .await
    .context("gateway: serve")
}
