use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::{DashMap, mapref::entry::Entry};
use serde::Serialize;

use crate::outpost::tunnel::{
    connection::{BandwidthLimit, ForwardRequest, Liveness, TunnelConnection, TunnelMetadata},
    pending::ForwardError,
    protocol::TunnelResponse,
};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    #[error("tunnel {0} is already claimed by another organization")]
    Taken(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct TunnelSnapshot {
    pub tunnel_id: String,
    pub organization_id: Option<String>,
    pub bandwidth_limit: BandwidthLimit,
    pub record_id: Option<String>,
    pub remote: String,
    pub liveness: Liveness,
    pub outstanding_requests: usize,
    pub started_at_unix_ms: u64,
}

/// Authoritative map from tunnel identifier (public host) to its live connection.
pub struct Registry {
    tunnels: DashMap<String, Arc<TunnelConnection>>,
    serial: AtomicU64,
    request_timeout: Duration,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("tunnels", &self.tunnels.len())
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl Registry {
    pub fn new(request_timeout: Duration) -> Self {
        let request_timeout = if request_timeout.is_zero() {
            DEFAULT_REQUEST_TIMEOUT
        } else {
            request_timeout
        };
        Self {
            tunnels: DashMap::new(),
            serial: AtomicU64::new(1),
            request_timeout,
        }
    }

    /// Serial numbers distinguish successive connections claiming the same identifier.
    pub fn next_serial(&self) -> u64 {
        self.serial.fetch_add(1, Ordering::Relaxed)
    }

    /// Claims `conn.tunnel_id()` for `conn`.
    ///
    /// An existing live claim is replaced only when both connections belong to the same
    /// organization (a client reconnecting before the relay noticed the old socket die).
    /// The replaced connection is closed and returned.
    pub fn register(
        &self,
        conn: Arc<TunnelConnection>,
    ) -> Result<Option<Arc<TunnelConnection>>, RegisterError> {
        let id = conn.tunnel_id().to_string();
        let evicted = match self.tunnels.entry(id.clone()) {
            Entry::Vacant(v) => {
                v.insert(conn);
                None
            }
            Entry::Occupied(mut o) => {
                let current = o.get();
                let same_org = current.metadata().organization_id.is_some()
                    && current.metadata().organization_id == conn.metadata().organization_id;
                if current.is_alive() && !same_org {
                    return Err(RegisterError::Taken(id));
                }
                let old = o.insert(conn);
                old.close();
                Some(old)
            }
        };

        metrics::gauge!("outpost_active_tunnels").set(self.tunnels.len() as f64);
        if let Some(old) = &evicted {
            tracing::info!(tunnel = %id, old_serial = old.serial(), "registry: replaced existing connection");
        }
        Ok(evicted)
    }

    pub fn lookup(&self, tunnel_id: &str) -> Option<Arc<TunnelConnection>> {
        self.tunnels.get(tunnel_id).map(|e| e.value().clone())
    }

    pub fn metadata(&self, tunnel_id: &str) -> Option<TunnelMetadata> {
        self.tunnels
            .get(tunnel_id)
            .map(|e| e.value().metadata().clone())
    }

    /// Removes the mapping only if it still points at the connection with `serial`.
    pub fn unregister(&self, tunnel_id: &str, serial: u64) -> bool {
        let removed = self
            .tunnels
            .remove_if(tunnel_id, |_, c| c.serial() == serial)
            .is_some();
        if removed {
            metrics::gauge!("outpost_active_tunnels").set(self.tunnels.len() as f64);
        }
        removed
    }

    /// Closes and removes whatever connection holds `tunnel_id`.
    pub fn kill(&self, tunnel_id: &str) -> bool {
        let Some((_, conn)) = self.tunnels.remove(tunnel_id) else {
            return false;
        };
        conn.close();
        metrics::gauge!("outpost_active_tunnels").set(self.tunnels.len() as f64);
        tracing::info!(tunnel = %tunnel_id, serial = conn.serial(), "registry: tunnel killed");
        true
    }

    pub async fn forward_request(
        &self,
        tunnel_id: &str,
        req: ForwardRequest,
    ) -> Result<TunnelResponse, ForwardError> {
        let conn = self
            .lookup(tunnel_id)
            .ok_or(ForwardError::TunnelDisconnected)?;
        conn.forward(req, self.request_timeout).await
    }

    pub fn snapshot(&self) -> Vec<TunnelSnapshot> {
        let mut out: Vec<TunnelSnapshot> = self
            .tunnels
            .iter()
            .map(|e| {
                let c = e.value();
                let md = c.metadata();
                TunnelSnapshot {
                    tunnel_id: c.tunnel_id().to_string(),
                    organization_id: md.organization_id.clone(),
                    bandwidth_limit: md.bandwidth_limit,
                    record_id: md.record_id.clone(),
                    remote: c.remote().map(|a| a.to_string()).unwrap_or_default(),
                    liveness: c.liveness(),
                    outstanding_requests: c.outstanding(),
                    started_at_unix_ms: c.started_unix_ms(),
                }
            })
            .collect();
        out.sort_by(|a, b| a.started_at_unix_ms.cmp(&b.started_at_unix_ms));
        out
    }
}
