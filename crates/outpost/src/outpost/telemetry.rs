use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use async_trait::async_trait;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};

/// Installs a Prometheus recorder for the `metrics` crate and returns a handle used to render
/// the exposition format.
///
/// This should be called once per process at startup.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// One proxied public request. Field names are the columns of the `tunnel_events` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelEvent {
    pub timestamp: u64,
    pub tunnel_id: String,
    pub organization_id: String,
    pub host: String,
    pub method: String,
    pub path: String,
    pub status_code: u16,
    pub request_duration_ms: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub client_ip: String,
    pub user_agent: String,
}

/// Destination for tunnel events. Logging must never block or fail the request path.
pub trait EventSink: Send + Sync {
    fn log(&self, event: TunnelEvent);
}

/// Writes every event as a structured log record.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn log(&self, e: TunnelEvent) {
        tracing::info!(
            target: "outpost::events",
            tunnel = %e.tunnel_id,
            org = %e.organization_id,
            host = %e.host,
            method = %e.method,
            path = %e.path,
            status = e.status_code,
            duration_ms = e.request_duration_ms,
            bytes_in = e.bytes_in,
            bytes_out = e.bytes_out,
            client_ip = %e.client_ip,
            user_agent = %e.user_agent,
            "request"
        );
    }
}

/// Sends each event to several sinks.
#[derive(Clone, Default)]
pub struct Fanout {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl Fanout {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for Fanout {
    fn log(&self, event: TunnelEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for s in rest {
                s.log(event.clone());
            }
            last.log(event);
        }
    }
}

/// Bounded ring of the most recent events, newest last.
#[derive(Debug)]
pub struct RecentEvents {
    cap: usize,
    buf: Mutex<VecDeque<TunnelEvent>>,
}

impl RecentEvents {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            buf: Mutex::new(VecDeque::with_capacity(cap.min(1024))),
        }
    }

    /// Up to `limit` newest events, optionally only those of `tunnel_id`, newest first.
    pub fn snapshot(&self, tunnel_id: Option<&str>, limit: usize) -> Vec<TunnelEvent> {
        let buf = self.buf.lock().unwrap_or_else(|e| e.into_inner());
        buf.iter()
            .rev()
            .filter(|e| tunnel_id.is_none_or(|id| e.tunnel_id == id))
            .take(limit)
            .cloned()
            .collect()
    }
}

impl EventSink for RecentEvents {
    fn log(&self, event: TunnelEvent) {
        if self.cap == 0 {
            return;
        }
        let mut buf = self.buf.lock().unwrap_or_else(|e| e.into_inner());
        while buf.len() >= self.cap {
            buf.pop_front();
        }
        buf.push_back(event);
    }
}

/// Persists a batch of events somewhere durable.
#[async_trait]
pub trait BatchWriter: Send + Sync + 'static {
    async fn write(&self, rows: &[TunnelEvent]) -> anyhow::Result<()>;
}

/// Inserts rows over the ClickHouse HTTP interface using `FORMAT JSONEachRow`.
#[derive(Debug, Clone)]
pub struct ClickHouseWriter {
    http: reqwest::Client,
    url: url::Url,
}

impl ClickHouseWriter {
    pub fn new(endpoint: &str, table: &str) -> anyhow::Result<Self> {
        let mut url = url::Url::parse(endpoint)
            .with_context(|| format!("events: invalid endpoint {endpoint:?}"))?;
        url.query_pairs_mut()
            .append_pair("query", &format!("INSERT INTO {table} FORMAT JSONEachRow"));
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("events: build http client")?;
        Ok(Self { http, url })
    }
}

#[async_trait]
impl BatchWriter for ClickHouseWriter {
    async fn write(&self, rows: &[TunnelEvent]) -> anyhow::Result<()> {
        let mut body = String::with_capacity(rows.len() * 256);
        for row in rows {
            body.push_str(&serde_json::to_string(row)?);
            body.push('\n');
        }
        let resp = self
            .http
            .post(self.url.clone())
            .header(http::header::CONTENT_TYPE, "application/x-ndjson")
            .body(body)
            .send()
            .await
            .context("events: insert request")?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("events: insert rejected with {status}: {}", text.trim());
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub queue_capacity: usize,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            flush_interval: Duration::from_secs(5),
            queue_capacity: 10_000,
        }
    }
}

/// Buffers events and hands them to a [`BatchWriter`] from a background task, either when
/// `batch_size` events are queued or every `flush_interval`. Failed batches are dropped.
#[derive(Debug, Clone)]
pub struct BatchSink {
    tx: mpsc::Sender<TunnelEvent>,
}

impl BatchSink {
    /// Spawns the flusher. It drains and flushes once more when `shutdown` flips to true
    /// or every sender is dropped.
    pub fn spawn<W: BatchWriter>(
        writer: W,
        opts: BatchOptions,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(opts.queue_capacity.max(1));
        let handle = tokio::spawn(flush_loop(writer, opts, rx, shutdown));
        (Self { tx }, handle)
    }
}

impl EventSink for BatchSink {
    fn log(&self, event: TunnelEvent) {
        if self.tx.try_send(event).is_err() {
            metrics::counter!("outpost_events_dropped_total").increment(1);
        }
    }
}

async fn flush_loop<W: BatchWriter>(
    writer: W,
    opts: BatchOptions,
    mut rx: mpsc::Receiver<TunnelEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let batch_size = opts.batch_size.max(1);
    let mut buf: Vec<TunnelEvent> = Vec::with_capacity(batch_size.min(4096));
    let mut tick = tokio::time::interval(opts.flush_interval.max(Duration::from_millis(10)));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tick.tick().await;

    loop {
        tokio::select! {
            ev = rx.recv() => match ev {
                Some(ev) => {
                    buf.push(ev);
                    if buf.len() >= batch_size {
                        flush(&writer, &mut buf).await;
                    }
                }
                None => break,
            },
            _ = tick.tick() => flush(&writer, &mut buf).await,
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    while let Ok(ev) = rx.try_recv() {
        buf.push(ev);
    }
    flush(&writer, &mut buf).await;
}

async fn flush<W: BatchWriter>(writer: &W, buf: &mut Vec<TunnelEvent>) {
    if buf.is_empty() {
        return;
    }
    let rows = std::mem::take(buf);
    match writer.write(&rows).await {
        Ok(()) => {
            metrics::counter!("outpost_events_flushed_total").increment(rows.len() as u64);
        }
        Err(err) => {
            metrics::counter!("outpost_events_dropped_total").increment(rows.len() as u64);
            tracing::warn!(rows = rows.len(), err = %format!("{err:#}"), "events: flush failed; batch dropped");
        }
    }
}
