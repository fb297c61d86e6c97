//! A set of weighted backend endpoints behind one balancer.

use crate::balancer::Balancer;
use crate::error::BackendError;
use crate::pool::{ConnectionPool, PoolFactory, PooledConnection};
use parking_lot::Mutex;
use shroud_core::{BackendAddr, SliceConfig};
use std::sync::Arc;
use std::time::Duration;

/// One backend address and its pool.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub addr: BackendAddr,
    pub pool: Arc<dyn ConnectionPool>,
}

/// The unit a namespace routes through.
///
/// Endpoints are fixed for the lifetime of the slice; a weight change builds
/// a new slice. Only the balancer cursor moves, under the slice's own lock.
#[derive(Debug)]
pub struct Slice {
    name: String,
    endpoints: Vec<Endpoint>,
    balancer: Mutex<Balancer>,
    acquire_timeout: Duration,
}

impl Slice {
    pub fn new(name: impl Into<String>, endpoints: Vec<Endpoint>, acquire_timeout: Duration) -> Self {
        let weights: Vec<u32> = endpoints.iter().map(|e| e.addr.weight).collect();
        Self {
            name: name.into(),
            balancer: Mutex::new(Balancer::new(&weights)),
            endpoints,
            acquire_timeout,
        }
    }

    /// Build a slice and one pool per endpoint from its configuration.
    pub fn from_config(
        config: &SliceConfig,
        factory: &dyn PoolFactory,
        acquire_timeout: Duration,
    ) -> Result<Self, BackendError> {
        let addrs = config
            .endpoints()
            .map_err(|e| BackendError::Internal(e.into()))?;
        let mut endpoints = Vec::with_capacity(addrs.len());
        for addr in addrs {
            let pool = factory.create(&addr, config)?;
            tracing::debug!(slice = %config.name, addr = %addr, weight = addr.weight, "Created backend pool");
            endpoints.push(Endpoint { addr, pool });
        }
        Ok(Self::new(config.name.clone(), endpoints, acquire_timeout))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// Endpoint the next connection comes from.
    pub fn next_endpoint(&self) -> Result<&Endpoint, BackendError> {
        if self.endpoints.is_empty() {
            return Err(BackendError::NoBackend);
        }
        let index = self.balancer.lock().next(self.endpoints.len())?;
        self.endpoints.get(index).ok_or(BackendError::NoBackend)
    }

    /// Check out a connection from the next scheduled endpoint.
    ///
    /// Fails immediately with [`BackendError::NoBackend`] when the slice has
    /// no endpoint; otherwise waits at most the slice's acquire timeout.
    pub async fn acquire(&self) -> Result<PooledConnection, BackendError> {
        let endpoint = self.next_endpoint()?;
        endpoint.pool.get(self.acquire_timeout).await.inspect_err(|e| {
            tracing::warn!(slice = %self.name, addr = %endpoint.addr, error = %e, "Backend acquire failed");
        })
    }

    /// Close every pool of the slice.
    pub async fn close(&self) {
        for endpoint in &self.endpoints {
            endpoint.pool.close().await;
        }
        tracing::info!(slice = %self.name, endpoints = self.endpoints.len(), "Closed slice");
    }

    pub fn is_closed(&self) -> bool {
        !self.endpoints.is_empty() && self.endpoints.iter().all(|e| e.pool.is_closed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryPoolFactory;

    fn slice_config(slaves: &[&str]) -> SliceConfig {
        serde_yaml::from_str(&format!(
            "user_name: proxy\nslaves: [{}]\ncapacity: 1\nmax_capacity: 1\n",
            slaves
                .iter()
                .map(|s| format!("{s:?}"))
                .collect::<Vec<_>>()
                .join(", ")
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_single_endpoint_always_chosen() {
        let factory = MemoryPoolFactory::default();
        let slice = Slice::from_config(&slice_config(&["db1:5432@3"]), &factory, Duration::from_millis(50)).unwrap();
        for _ in 0..5 {
            assert_eq!(slice.next_endpoint().unwrap().addr.host, "db1");
            drop(slice.acquire().await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_empty_slice_fails_with_no_backend() {
        let slice = Slice::new("empty", Vec::new(), Duration::from_millis(50));
        assert!(matches!(slice.acquire().await, Err(BackendError::NoBackend)));
        assert!(matches!(slice.next_endpoint(), Err(BackendError::NoBackend)));
    }

    #[tokio::test]
    async fn test_weighted_distribution() {
        let factory = MemoryPoolFactory::default();
        let slice = Slice::from_config(&slice_config(&["a:1@1", "b:1@3"]), &factory, Duration::from_millis(50)).unwrap();
        let mut b = 0;
        for _ in 0..40 {
            if slice.next_endpoint().unwrap().addr.host == "b" {
                b += 1;
            }
        }
        assert_eq!(b, 30);
    }

    #[tokio::test]
    async fn test_exhausted_pool_times_out_and_release_restores_capacity() {
        let factory = MemoryPoolFactory::default();
        let slice = Slice::from_config(&slice_config(&["a:1"]), &factory, Duration::from_millis(20)).unwrap();

        let held = slice.acquire().await.unwrap();
        assert!(matches!(slice.acquire().await, Err(BackendError::AcquireTimeout { .. })));

        drop(held);
        assert!(slice.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_close_closes_every_pool() {
        let factory = MemoryPoolFactory::default();
        let slice = Slice::from_config(&slice_config(&["a:1", "b:1"]), &factory, Duration::from_millis(20)).unwrap();
        slice.close().await;
        assert!(slice.is_closed());
        assert!(matches!(slice.acquire().await, Err(BackendError::PoolClosed { .. })));
    }
}
