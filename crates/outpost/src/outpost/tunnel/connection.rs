use std::{
    net::SocketAddr,
    sync::atomic::{AtomicU8, Ordering},
    time::{Duration, Instant},
};

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{mpsc, watch};

use crate::outpost::{
    telemetry,
    tunnel::{
        pending::{ForwardError, PendingRequests},
        protocol::{Headers, Message, TunnelRequest, TunnelResponse},
    },
};

/// Per-organization byte budget for one billing period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BandwidthLimit {
    Unlimited,
    Bytes(u64),
}

impl BandwidthLimit {
    /// Config values use `-1` (any negative number) as the unlimited sentinel.
    pub fn from_config(v: i64) -> Self {
        if v < 0 {
            BandwidthLimit::Unlimited
        } else {
            BandwidthLimit::Bytes(v as u64)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelMetadata {
    pub organization_id: Option<String>,
    pub bandwidth_limit: BandwidthLimit,
    pub record_id: Option<String>,
}

impl TunnelMetadata {
    pub fn anonymous() -> Self {
        Self {
            organization_id: None,
            bandwidth_limit: BandwidthLimit::Unlimited,
            record_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    Alive,
    Closing,
    Closed,
}

const ALIVE: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub method: String,
    pub path: String,
    pub headers: Headers,
    pub body: Option<Bytes>,
}

/// Relay-side handle to one connected tunnel client.
///
/// The transport itself lives in the session task that created the handle; this type
/// only owns the outbound queue feeding that task and the table of requests in flight.
pub struct TunnelConnection {
    serial: u64,
    tunnel_id: String,
    metadata: TunnelMetadata,
    outbound: mpsc::Sender<Message>,
    pending: PendingRequests,
    state: AtomicU8,
    closed_tx: watch::Sender<bool>,
    remote: Option<SocketAddr>,
    started_unix_ms: u64,
}

impl std::fmt::Debug for TunnelConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelConnection")
            .field("serial", &self.serial)
            .field("tunnel_id", &self.tunnel_id)
            .field("liveness", &self.liveness())
            .finish_non_exhaustive()
    }
}

impl TunnelConnection {
    pub fn new(
        serial: u64,
        tunnel_id: String,
        metadata: TunnelMetadata,
        outbound: mpsc::Sender<Message>,
        remote: Option<SocketAddr>,
    ) -> Self {
        let (closed_tx, _rx) = watch::channel(false);
        Self {
            serial,
            tunnel_id,
            metadata,
            outbound,
            pending: PendingRequests::new(),
            state: AtomicU8::new(ALIVE),
            closed_tx,
            remote,
            started_unix_ms: telemetry::now_unix_ms(),
        }
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn tunnel_id(&self) -> &str {
        &self.tunnel_id
    }

    pub fn metadata(&self) -> &TunnelMetadata {
        &self.metadata
    }

    pub fn remote(&self) -> Option<SocketAddr> {
        self.remote
    }

    pub fn started_unix_ms(&self) -> u64 {
        self.started_unix_ms
    }

    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    pub fn liveness(&self) -> Liveness {
        match self.state.load(Ordering::Acquire) {
            ALIVE => Liveness::Alive,
            CLOSING => Liveness::Closing,
            _ => Liveness::Closed,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.liveness() == Liveness::Alive
    }

    /// Resolves to `true` once `close` has been requested.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    /// Sends a `request` frame and waits for its `response`, bounded by `deadline`.
    pub async fn forward(
        &self,
        req: ForwardRequest,
        deadline: Duration,
    ) -> Result<TunnelResponse, ForwardError> {
        if !self.is_alive() {
            return Err(ForwardError::TunnelDisconnected);
        }

        let started = Instant::now();
        let pending = self.pending.allocate()?;
        let request_id = pending.id().to_string();

        let msg = Message::Request(TunnelRequest {
            request_id: request_id.clone(),
            method: req.method,
            path: req.path,
            headers: req.headers,
            body: req.body,
        });

        match tokio::time::timeout(deadline, self.outbound.send(msg)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                self.pending.cancel(&request_id);
                return Err(ForwardError::TunnelDisconnected);
            }
            Err(_) => {
                self.pending.cancel(&request_id);
                return Err(ForwardError::RequestTimeout(deadline));
            }
        }

        let remaining = deadline.saturating_sub(started.elapsed());
        match self.pending.wait(pending, remaining).await {
            Err(ForwardError::RequestTimeout(_)) => Err(ForwardError::RequestTimeout(deadline)),
            other => other,
        }
    }

    /// Handles a frame read from the client after the handshake.
    pub fn handle_inbound(&self, msg: Message) {
        match msg {
            Message::Response(resp) => {
                self.pending.resolve(resp);
            }
            other => {
                tracing::debug!(
                    tunnel = %self.tunnel_id,
                    kind = other.kind(),
                    "tunnel: ignoring unexpected message from client"
                );
            }
        }
    }

    /// Starts shutting the connection down: fails outstanding requests and signals the
    /// session task to close the transport. Idempotent.
    pub fn close(&self) {
        if self
            .state
            .compare_exchange(ALIVE, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.pending.close();
            let _ = self.closed_tx.send(true);
        }
    }

    /// Marks the transport as gone.
    pub fn mark_closed(&self) {
        self.close();
        self.state.store(CLOSED, Ordering::Release);
    }
}
