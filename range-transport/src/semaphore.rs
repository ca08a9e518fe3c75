//! Per-host concurrency gating for sub-range workers.
use std::{collections::HashMap, sync::Arc};

use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::{error::Error, Result};

/// Lowercase a host and strip any trailing `:port`, so `Example.COM:443`
/// and `example.com` share a gate.
#[must_use]
pub fn canonical_host(host: &str) -> String {
    let host = host.rsplit_once(':').map_or(host, |(h, _)| h);
    host.to_ascii_lowercase()
}

/// A permit on a host's gate. Capacity-0 ("unlimited") hosts hand out a
/// permit that holds nothing and releases nothing.
#[derive(Debug)]
pub struct HostPermit(#[allow(dead_code)] Option<OwnedSemaphorePermit>);

/// Lazily-populated, per-host counting semaphores.
///
/// Hosts are never removed once created: the map lives for the lifetime of
/// the owning [`ParallelTransport`](crate::transport::ParallelTransport).
#[derive(Debug)]
pub struct HostSemaphores {
    limits: HashMap<String, usize>,
    gates: RwLock<HashMap<String, Arc<Semaphore>>>,
}

impl HostSemaphores {
    /// Build a gate keyed by the configured `max_concurrent_per_host` map.
    /// The `""` entry, if present, is the default limit for hosts with no
    /// specific entry.
    #[must_use]
    pub fn new(limits: HashMap<String, usize>) -> Self {
        Self {
            limits,
            gates: RwLock::new(HashMap::new()),
        }
    }

    /// `canon` must already be canonicalized: this looks the limit up
    /// directly, it does not re-canonicalize.
    fn limit_for(&self, canon: &str) -> usize {
        self.limits
            .get(canon)
            .or_else(|| self.limits.get(""))
            .copied()
            .unwrap_or(4)
    }

    async fn semaphore_for(&self, host: &str) -> Option<Arc<Semaphore>> {
        let canon = canonical_host(host);
        let limit = self.limit_for(&canon);
        if limit == 0 {
            return None;
        }

        if let Some(sem) = self.gates.read().await.get(&canon) {
            return Some(Arc::clone(sem));
        }

        let mut gates = self.gates.write().await;
        let sem = gates
            .entry(canon)
            .or_insert_with(|| Arc::new(Semaphore::new(limit)));
        Some(Arc::clone(sem))
    }

    /// Acquire a permit for `host`, respecting `cancel`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] if `cancel` fires before a permit is
    /// available.
    pub async fn acquire(&self, host: &str, cancel: &CancellationToken) -> Result<HostPermit> {
        let Some(sem) = self.semaphore_for(host).await else {
            return Ok(HostPermit(None));
        };

        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::Cancelled),
            permit = sem.acquire_owned() => {
                Ok(HostPermit(Some(permit.expect("semaphore is never closed"))))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn canonicalizes_case_and_port() {
        assert_eq!(canonical_host("Example.COM:443"), "example.com");
        assert_eq!(canonical_host("example.com"), "example.com");
    }

    #[tokio::test]
    async fn zero_capacity_is_unlimited() {
        let sems = HostSemaphores::new(HashMap::from([(String::new(), 0)]));
        let cancel = CancellationToken::new();

        // Would deadlock with a real capacity of zero.
        let _a = sems.acquire("host", &cancel).await.unwrap();
        let _b = sems.acquire("host", &cancel).await.unwrap();
    }

    #[tokio::test]
    async fn gates_limit_concurrency() {
        let sems = Arc::new(HostSemaphores::new(HashMap::from([(String::new(), 1)])));
        let cancel = CancellationToken::new();

        let permit = sems.acquire("host", &cancel).await.unwrap();

        let sems2 = Arc::clone(&sems);
        let cancel2 = cancel.clone();
        let waiter = tokio::spawn(async move { sems2.acquire("host", &cancel2).await });

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiter.is_finished());

        drop(permit);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn cancellation_unblocks_acquire() {
        let sems = Arc::new(HostSemaphores::new(HashMap::from([(String::new(), 1)])));
        let cancel = CancellationToken::new();
        let _held = sems.acquire("host", &cancel).await.unwrap();

        let sems2 = Arc::clone(&sems);
        let cancel2 = cancel.clone();
        let waiter = tokio::spawn(async move { sems2.acquire("host", &cancel2).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let res = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("acquire did not unblock after cancellation")
            .unwrap();
        assert!(matches!(res, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn distinct_hosts_share_default_limit_independently() {
        let sems = HostSemaphores::new(HashMap::from([(String::new(), 1)]));
        let cancel = CancellationToken::new();

        let _a = sems.acquire("a.example.com", &cancel).await.unwrap();
        // A different host must not be blocked by a's permit.
        let _b = tokio::time::timeout(
            Duration::from_millis(100),
            sems.acquire("b.example.com", &cancel),
        )
        .await
        .expect("different host should not contend")
        .unwrap();
    }
}
