//! Bandwidth accounting per organization and billing period.

use std::time::SystemTime;

use async_trait::async_trait;
use dashmap::DashMap;

#[derive(Debug, thiserror::Error)]
pub enum QuotaError {
    #[error("usage store unavailable: {0}")]
    Unavailable(String),
}

/// Atomic counter store shared by every relay instance that enforces the same quota.
#[async_trait]
pub trait UsageCounter: Send + Sync {
    /// Current value, `None` when the key was never incremented.
    async fn get(&self, key: &str) -> Result<Option<u64>, QuotaError>;

    /// Adds `n` and returns the value after the increment.
    async fn incr_by(&self, key: &str, n: u64) -> Result<u64, QuotaError>;
}

/// Key of the usage counter for `org` in the calendar month containing `now` (UTC).
pub fn bandwidth_key(org: &str, now: SystemTime) -> String {
    let stamp = humantime::format_rfc3339_seconds(now).to_string();
    // "YYYY-MM-DDTHH:MM:SSZ"
    let month = stamp.get(..7).unwrap_or(&stamp);
    format!("bandwidth:{org}:{month}")
}

/// Process-local counter store.
#[derive(Debug, Default)]
pub struct MemoryUsageCounter {
    counters: DashMap<String, u64>,
}

impl MemoryUsageCounter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UsageCounter for MemoryUsageCounter {
    async fn get(&self, key: &str) -> Result<Option<u64>, QuotaError> {
        Ok(self.counters.get(key).map(|v| *v))
    }

    async fn incr_by(&self, key: &str, n: u64) -> Result<u64, QuotaError> {
        let mut entry = self.counters.entry(key.to_string()).or_insert(0);
        *entry = entry
            .checked_add(n)
            .ok_or_else(|| QuotaError::Unavailable(format!("counter {key} overflowed")))?;
        Ok(*entry)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::Arc,
        time::{Duration, UNIX_EPOCH},
    };

    use super::*;

    #[test]
    fn key_uses_utc_month() {
        // 2024-02-29T23:59:59Z
        let t = UNIX_EPOCH + Duration::from_secs(1_709_251_199);
        assert_eq!(bandwidth_key("org_1", t), "bandwidth:org_1:2024-02");
        // One second later is March.
        assert_eq!(
            bandwidth_key("org_1", t + Duration::from_secs(1)),
            "bandwidth:org_1:2024-03"
        );
    }

    #[tokio::test]
    async fn memory_counter_starts_absent() {
        let c = MemoryUsageCounter::new();
        assert_eq!(c.get("k").await.unwrap(), None);
        assert_eq!(c.incr_by("k", 0).await.unwrap(), 0);
        assert_eq!(c.get("k").await.unwrap(), Some(0));
        assert_eq!(c.incr_by("k", 5).await.unwrap(), 5);
        assert_eq!(c.incr_by("k", 7).await.unwrap(), 12);
    }

    #[tokio::test]
    async fn overflow_is_an_error_and_keeps_the_value() {
        let c = MemoryUsageCounter::new();
        c.incr_by("k", u64::MAX - 1).await.unwrap();
        assert!(matches!(
            c.incr_by("k", 2).await,
            Err(QuotaError::Unavailable(_))
        ));
        assert_eq!(c.get("k").await.unwrap(), Some(u64::MAX - 1));
    }

    #[tokio::test]
    async fn concurrent_increments_are_not_lost() {
        let c = Arc::new(MemoryUsageCounter::new());
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let c = c.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..250 {
                    c.incr_by("bandwidth:o:2024-01", 2).await.unwrap();
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(c.get("bandwidth:o:2024-01").await.unwrap(), Some(4000));
    }
}
