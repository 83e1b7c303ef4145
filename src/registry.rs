//! One client per broker endpoint
//!
//! Endpoints are keyed by their normalized URL. Construction is guarded by a
//! per-URL async lock so concurrent callers for one endpoint share a single
//! client, while different endpoints never wait on each other.

use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::client::RpcClient;
use crate::config::RabbitMqConfig;
use crate::error::{Error, Result};
use crate::transport::Connector;

/// Registry of shared clients, keyed by endpoint URL
#[derive(Default)]
pub struct EndpointRegistry {
    clients: DashMap<String, Arc<RpcClient>>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the client for `config`'s endpoint, building it with `factory` on first use
    ///
    /// An existing client is returned as is, connected or not. If `factory`
    /// fails nothing is stored and the next call tries again.
    pub async fn acquire<F, Fut>(&self, config: &RabbitMqConfig, factory: F) -> Result<Arc<RpcClient>>
    where
        F: FnOnce(RabbitMqConfig) -> Fut,
        Fut: Future<Output = Result<RpcClient>>,
    {
        let url = config.url()?;
        if let Some(client) = self.lookup(&url) {
            return Ok(client);
        }

        let lock = self.locks.entry(url.clone()).or_default().clone();
        let _guard = lock.lock().await;

        // Another caller may have finished while we waited
        if let Some(client) = self.lookup(&url) {
            debug!(url = %config.redacted_url(), "Endpoint created concurrently, reusing");
            return Ok(client);
        }

        let client = Arc::new(factory(config.clone()).await?);
        self.clients.insert(url, client.clone());

        info!(url = %config.redacted_url(), "Registered broker endpoint");
        Ok(client)
    }

    /// [`acquire`](Self::acquire) with a connected client opened through `connector`
    pub async fn acquire_with(&self, config: &RabbitMqConfig, connector: Arc<dyn Connector>) -> Result<Arc<RpcClient>> {
        self.acquire(config, |config| async move {
            let client = RpcClient::new(config, connector)?;
            client.connect().await?;
            Ok::<_, Error>(client)
        })
        .await
    }

    /// The registered client for `config`'s endpoint, if any
    pub fn get(&self, config: &RabbitMqConfig) -> Option<Arc<RpcClient>> {
        config.url().ok().and_then(|url| self.lookup(&url))
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Forget the client for `config`'s endpoint without closing it
    ///
    /// The endpoint's construction lock is kept, so a construction still in
    /// flight stays the only one for that URL.
    pub fn evict(&self, config: &RabbitMqConfig) -> Option<Arc<RpcClient>> {
        let url = config.url().ok()?;
        self.clients.remove(&url).map(|(_, client)| client)
    }

    /// Close every registered client and empty the registry
    ///
    /// All clients are closed even if some fail; the first failure is returned.
    pub async fn close_all(&self) -> Result<()> {
        let urls: Vec<String> = self.clients.iter().map(|entry| entry.key().clone()).collect();

        let mut first_error = None;
        for url in urls {
            let Some((_, client)) = self.clients.remove(&url) else {
                continue;
            };
            if let Err(e) = client.close().await {
                warn!(url = %client.endpoint(), error = %e, "Failed to close endpoint");
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    fn lookup(&self, url: &str) -> Option<Arc<RpcClient>> {
        self.clients.get(url).map(|entry| entry.value().clone())
    }
}
