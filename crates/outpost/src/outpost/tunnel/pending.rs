//! Per-connection table of forwarded requests awaiting a `response` frame.

use std::{
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::{Duration, Instant},
};

use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::outpost::tunnel::protocol::TunnelResponse;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ForwardError {
    #[error("tunnel disconnected")]
    TunnelDisconnected,
    #[error("request timed out after {0:?}")]
    RequestTimeout(Duration),
}

type Slot = oneshot::Sender<Result<TunnelResponse, ForwardError>>;

struct PendingRequest {
    created: Instant,
    slot: Slot,
}

/// Waiter half of an allocated request id.
pub struct PendingResponse {
    id: String,
    rx: oneshot::Receiver<Result<TunnelResponse, ForwardError>>,
}

impl PendingResponse {
    pub fn id(&self) -> &str {
        &self.id
    }
}

pub struct PendingRequests {
    next_id: AtomicU64,
    slots: DashMap<String, PendingRequest>,
    closed: AtomicBool,
}

impl std::fmt::Debug for PendingRequests {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequests")
            .field("outstanding", &self.slots.len())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingRequests {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            slots: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Allocates a fresh request id and registers its result slot.
    ///
    /// Fails with `TunnelDisconnected` once the owning connection has closed.
    pub fn allocate(&self) -> Result<PendingResponse, ForwardError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ForwardError::TunnelDisconnected);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let (tx, rx) = oneshot::channel();
        self.slots.insert(
            id.clone(),
            PendingRequest {
                created: Instant::now(),
                slot: tx,
            },
        );

        // close() may have drained the table between the check above and the insert.
        if self.closed.load(Ordering::SeqCst) {
            self.slots.remove(&id);
            return Err(ForwardError::TunnelDisconnected);
        }

        Ok(PendingResponse { id, rx })
    }

    /// Waits for the response to `pending` for at most `deadline`.
    pub async fn wait(
        &self,
        pending: PendingResponse,
        deadline: Duration,
    ) -> Result<TunnelResponse, ForwardError> {
        let PendingResponse { id, rx } = pending;
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(res)) => res,
            // Slot dropped without a value: the table was torn down.
            Ok(Err(_)) => Err(ForwardError::TunnelDisconnected),
            Err(_) => {
                self.slots.remove(&id);
                Err(ForwardError::RequestTimeout(deadline))
            }
        }
    }

    /// Delivers a response to its waiter. Unknown ids (already resolved, timed out or
    /// never issued) are ignored and reported as `false`.
    pub fn resolve(&self, resp: TunnelResponse) -> bool {
        let Some((id, pending)) = self.slots.remove(&resp.request_id) else {
            tracing::debug!(request_id = %resp.request_id, "tunnel: response for unknown request dropped");
            return false;
        };
        tracing::trace!(
            request_id = %id,
            elapsed_ms = pending.created.elapsed().as_millis() as u64,
            "tunnel: response matched"
        );
        pending.slot.send(Ok(resp)).is_ok()
    }

    /// Forgets an id without resolving it.
    pub fn cancel(&self, id: &str) {
        self.slots.remove(id);
    }

    /// Fails every outstanding request with `TunnelDisconnected` and rejects new ones.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let ids: Vec<String> = self.slots.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, pending)) = self.slots.remove(&id) {
                let _ = pending.slot.send(Err(ForwardError::TunnelDisconnected));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }
}
