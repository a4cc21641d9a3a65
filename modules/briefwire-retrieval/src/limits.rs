//! Concurrency primitives for the extraction stage: a global semaphore, a
//! lazily-created per-host semaphore map, and a bounded indexed worker pool.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{anyhow, Result};
use futures::stream::{self, StreamExt, TryStreamExt};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use briefwire_common::BriefError;

/// Both permits needed to extract one candidate. Held for the duration of the
/// fetch; dropped (host first, then global) on every exit path.
#[derive(Debug)]
pub struct ExtractionPermits {
    _host: OwnedSemaphorePermit,
    _global: OwnedSemaphorePermit,
}

/// Global + per-host extraction limits. Host semaphores are created lazily,
/// keyed by lowercased hostname, and shared across runs.
pub struct HostLimits {
    global: Arc<Semaphore>,
    per_host_limit: usize,
    hosts: StdMutex<HashMap<String, Arc<Semaphore>>>,
}

impl HostLimits {
    pub fn new(global_concurrency: usize, per_host_concurrency: usize) -> Self {
        Self {
            global: Arc::new(Semaphore::new(global_concurrency.max(1))),
            per_host_limit: per_host_concurrency.max(1),
            hosts: StdMutex::new(HashMap::new()),
        }
    }

    fn host_semaphore(&self, host: &str) -> Arc<Semaphore> {
        let key = host.to_lowercase();
        let mut hosts = self.hosts.lock().unwrap_or_else(|e| e.into_inner());
        hosts
            .entry(key)
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_host_limit)))
            .clone()
    }

    /// Acquire the global permit, then the host permit. Cancellation while
    /// waiting raises `Aborted` and leaves both semaphores untouched.
    pub async fn acquire(
        &self,
        host: &str,
        cancel: &CancellationToken,
    ) -> Result<ExtractionPermits> {
        let global = acquire_cancellable(self.global.clone(), cancel).await?;
        let host_permit = acquire_cancellable(self.host_semaphore(host), cancel).await?;
        Ok(ExtractionPermits {
            _host: host_permit,
            _global: global,
        })
    }

    #[cfg(test)]
    fn global_available(&self) -> usize {
        self.global.available_permits()
    }
}

async fn acquire_cancellable(
    semaphore: Arc<Semaphore>,
    cancel: &CancellationToken,
) -> Result<OwnedSemaphorePermit> {
    tokio::select! {
        permit = semaphore.acquire_owned() => {
            permit.map_err(|_| anyhow!("semaphore closed"))
        }
        _ = cancel.cancelled() => Err(BriefError::Aborted.into()),
    }
}

/// Run `count` tasks with at most `limit` in flight, returning results in
/// index order. The first failure propagates and drops the in-flight
/// siblings.
pub async fn run_indexed<T, F, Fut>(count: usize, limit: usize, task: F) -> Result<Vec<T>>
where
    F: Fn(usize) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut indexed: Vec<(usize, T)> = stream::iter(0..count)
        .map(|i| {
            let fut = task(i);
            async move { fut.await.map(|value| (i, value)) }
        })
        .buffer_unordered(limit.max(1))
        .try_collect()
        .await?;
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, value)| value).collect())
}
