//! Per-tenant forwarding handlers

use crate::pool::{ConnectionPool, ForwardError, ProxyBody};
use crate::registry::TenantRegistry;
use crate::router::extract_identity;
use crate::wait_page::WaitPage;
use hyper::header::HeaderValue;
use hyper::{Request, Response, Uri};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{info, warn};

/// Header tagging every request the proxy forwards
pub const X_PROXY: &str = "x-proxy";
const X_PROXY_VALUE: &str = env!("CARGO_PKG_NAME");

/// Builds forwarding handlers that share one connection pool
pub struct ProxyFactory {
    pool: Arc<ConnectionPool>,
    registry: Arc<TenantRegistry>,
    wait_page: Arc<WaitPage>,
    request_timeout: Duration,
}

impl ProxyFactory {
    pub fn new(
        pool: Arc<ConnectionPool>,
        registry: Arc<TenantRegistry>,
        wait_page: Arc<WaitPage>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            registry,
            wait_page,
            request_timeout,
        }
    }

    /// Build a handler that forwards to `backend_url` (e.g. `http://172.18.0.5:80`)
    pub fn build(&self, backend_url: &str) -> anyhow::Result<Arc<ForwardHandler>> {
        let backend: Uri = backend_url
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid backend URL '{}': {}", backend_url, e))?;
        if backend.authority().is_none() {
            anyhow::bail!("Backend URL '{}' has no host", backend_url);
        }
        Ok(Arc::new(ForwardHandler {
            backend_url: backend_url.to_string(),
            backend,
            pool: Arc::clone(&self.pool),
            registry: Arc::downgrade(&self.registry),
            wait_page: Arc::clone(&self.wait_page),
            request_timeout: self.request_timeout,
        }))
    }
}

/// Forwards requests to one tenant workload
pub struct ForwardHandler {
    backend_url: String,
    backend: Uri,
    pool: Arc<ConnectionPool>,
    // Weak: the registry owns the entries that own this handler
    registry: Weak<TenantRegistry>,
    wait_page: Arc<WaitPage>,
    request_timeout: Duration,
}

impl ForwardHandler {
    pub fn backend_url(&self) -> &str {
        &self.backend_url
    }

    /// Forward `req`; a forwarding failure evicts the tenant and yields the wait page
    pub async fn forward(&self, mut req: Request<ProxyBody>) -> Response<ProxyBody> {
        req.headers_mut()
            .insert(X_PROXY, HeaderValue::from_static(X_PROXY_VALUE));
        let path = req.uri().path().to_string();

        let result = tokio::time::timeout(
            self.request_timeout,
            self.pool.send_request(req, &self.backend),
        )
        .await
        .unwrap_or(Err(ForwardError::Timeout(self.request_timeout)));

        match result {
            Ok(response) => {
                info!(
                    target_url = %self.backend_url,
                    path = %path,
                    status = response.status().as_u16(),
                    "Forwarded request"
                );
                response
            }
            Err(e) => self.on_failure(&path, e),
        }
    }

    /// Drop the stale registry entry so the next request provisions again
    fn on_failure(&self, path: &str, error: ForwardError) -> Response<ProxyBody> {
        let identity = extract_identity(path).unwrap_or_default();
        let identity = identity.as_str();
        warn!(
            identity,
            target_url = %self.backend_url,
            error = %error,
            "Forwarding failed, evicting tenant"
        );
        if let Some(registry) = self.registry.upgrade() {
            if registry.evict_backend(identity, &self.backend_url).is_some() {
                info!(identity, "Stale tenant entry removed");
            }
        }
        self.wait_page.response(identity)
    }
}
