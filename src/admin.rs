use crate::cull::{CullService, Eviction};
use crate::pool::PoolStats;
use crate::registry::TenantRegistry;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the proxy
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

const TENANTS_PATH: &str = "/tenants";

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

/// What the admin handlers operate on
pub struct AdminState {
    registry: Arc<TenantRegistry>,
    culler: Arc<CullService>,
    pool_stats: Arc<PoolStats>,
    auth_token: String,
}

impl AdminState {
    pub fn new(
        registry: Arc<TenantRegistry>,
        culler: Arc<CullService>,
        pool_stats: Arc<PoolStats>,
        auth_token: String,
    ) -> Self {
        Self {
            registry,
            culler,
            pool_stats,
            auth_token,
        }
    }
}

/// Operator API: health, version, tenant listing and eviction
pub struct AdminServer {
    bind_addr: SocketAddr,
    state: Arc<AdminState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl AdminServer {
    pub fn new(bind_addr: SocketAddr, state: AdminState, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            state: Arc::new(state),
            shutdown_rx,
        }
    }

    pub fn auth_token(&self) -> &str {
        &self.state.auth_token
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Admin API server listening (HTTP/1.1 and HTTP/2)");
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown is signalled
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, state).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection(stream: TcpStream, state: Arc<AdminState>) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        async move { Ok::<_, hyper::Error>(handle_admin_request(req, &state).await) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn check_auth<B>(req: &Request<B>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| {
            // Support "Bearer <token>" format
            auth.strip_prefix("Bearer ")
                .unwrap_or(auth)
                .eq(expected_token)
        })
        .unwrap_or(false)
}

fn list_tenants(state: &AdminState) -> Response<Full<Bytes>> {
    let now = Instant::now();
    let mut tenants = state.registry.snapshot();
    tenants.sort_by(|a, b| a.identity.cmp(&b.identity));

    let tenant_list: Vec<serde_json::Value> = tenants
        .into_iter()
        .map(|t| {
            serde_json::json!({
                "identity": t.identity,
                "state": t.state,
                "backend_url": t.backend_url,
                "workload_id": t.workload_id,
                "access_count": t.access_count,
                "idle_secs": t.idle_at(now).as_secs(),
                "created_at": t.created_wall.to_rfc3339(),
            })
        })
        .collect();
    let body = serde_json::json!({
        "count": tenant_list.len(),
        "tenants": tenant_list,
        "requests": {
            "total": state.pool_stats.get_total_requests(),
            "failed": state.pool_stats.get_failed_requests(),
        },
    });
    json_response(StatusCode::OK, body.to_string())
}

async fn evict_tenant(state: &AdminState, identity: &str) -> Response<Full<Bytes>> {
    match state.culler.evict(identity).await {
        Eviction::Missing => response(StatusCode::NOT_FOUND, "unknown tenant"),
        Eviction::Busy => response(StatusCode::CONFLICT, "tenant is provisioning or draining"),
        Eviction::Evicted {
            snapshot,
            teardown_failed,
        } => {
            let body = serde_json::json!({
                "identity": snapshot.identity,
                "workload_id": snapshot.workload_id,
                "teardown_failed": teardown_failed,
            });
            json_response(StatusCode::OK, body.to_string())
        }
    }
}

async fn handle_admin_request<B>(req: Request<B>, state: &AdminState) -> Response<Full<Bytes>> {
    let path = req.uri().path();
    let method = req.method();

    debug!(%method, %path, "Admin API request");

    match (method, path) {
        // Health check for the admin API itself (no auth required)
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        // Version endpoint: GET /version (no auth required)
        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            json_response(StatusCode::OK, version_info.to_string())
        }

        // List tenants and their state: GET /tenants (auth required)
        (&Method::GET, TENANTS_PATH) => {
            if !check_auth(&req, &state.auth_token) {
                warn!(path, "Unauthorized admin API request");
                return response(StatusCode::UNAUTHORIZED, "unauthorized");
            }
            list_tenants(state)
        }

        // Evict a tenant: DELETE /tenants/{identity} (auth required)
        (&Method::DELETE, path) if path.starts_with("/tenants/") => {
            if !check_auth(&req, &state.auth_token) {
                warn!(path, "Unauthorized admin API request");
                return response(StatusCode::UNAUTHORIZED, "unauthorized");
            }
            let identity = path.strip_prefix("/tenants/").unwrap_or("");
            if identity.is_empty() {
                response(StatusCode::BAD_REQUEST, "missing identity")
            } else {
                evict_tenant(state, identity).await
            }
        }

        // 404 for everything else
        _ => response(StatusCode::NOT_FOUND, "not found"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forward::ProxyFactory;
    use crate::pool::{ConnectionPool, PoolConfig};
    use crate::provision::WorkloadNaming;
    use crate::runtime::testing::MockRuntime;
    use crate::runtime::SharedRuntime;
    use crate::wait_page::WaitPage;
    use http_body_util::BodyExt;
    use std::time::Duration;

    const TOKEN: &str = "secret";

    fn state(runtime: &Arc<MockRuntime>) -> AdminState {
        let registry = TenantRegistry::new();
        let culler = CullService::new(
            Arc::clone(&registry),
            Arc::clone(runtime) as SharedRuntime,
            WorkloadNaming::new("hp-"),
            Duration::from_secs(600),
            Duration::from_secs(5),
        );
        AdminState::new(
            registry,
            Arc::new(culler),
            Arc::new(PoolStats::default()),
            TOKEN.to_string(),
        )
    }

    fn make_ready(state: &AdminState, identity: &str, workload_id: &str) {
        let factory = ProxyFactory::new(
            Arc::new(ConnectionPool::new(PoolConfig::default())),
            Arc::clone(&state.registry),
            Arc::new(WaitPage::default()),
            Duration::from_secs(5),
        );
        let url = "http://127.0.0.1:9";
        state.registry.claim(identity);
        state
            .registry
            .promote(identity, url, workload_id, factory.build(url).unwrap());
    }

    fn request(method: Method, path: &str, token: Option<&str>) -> Request<()> {
        let mut builder = Request::builder().method(method).uri(path);
        if let Some(token) = token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        builder.body(()).unwrap()
    }

    async fn body_json(response: Response<Full<Bytes>>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_and_version_need_no_auth() {
        let state = state(&Arc::new(MockRuntime::new()));

        let health = handle_admin_request(request(Method::GET, "/health", None), &state).await;
        assert_eq!(health.status(), StatusCode::OK);

        let version = handle_admin_request(request(Method::GET, "/version", None), &state).await;
        assert_eq!(version.status(), StatusCode::OK);
        let json = body_json(version).await;
        assert_eq!(json["name"], PKG_NAME);
        assert_eq!(json["version"], VERSION);
    }

    #[tokio::test]
    async fn test_tenants_requires_auth() {
        let state = state(&Arc::new(MockRuntime::new()));

        let denied = handle_admin_request(request(Method::GET, "/tenants", None), &state).await;
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

        let wrong = handle_admin_request(request(Method::GET, "/tenants", Some("nope")), &state).await;
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

        let delete = handle_admin_request(request(Method::DELETE, "/tenants/alice", None), &state).await;
        assert_eq!(delete.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_list_tenants() {
        let state = state(&Arc::new(MockRuntime::new()));
        make_ready(&state, "alice", "c-alice");
        state.registry.claim("bob");

        let response = handle_admin_request(request(Method::GET, "/tenants", Some(TOKEN)), &state).await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["count"], 2);
        assert_eq!(json["tenants"][0]["identity"], "alice");
        assert_eq!(json["tenants"][0]["state"], "ready");
        assert_eq!(json["tenants"][0]["workload_id"], "c-alice");
        assert_eq!(json["tenants"][1]["identity"], "bob");
        assert_eq!(json["tenants"][1]["state"], "provisioning");
    }

    #[tokio::test]
    async fn test_evict_tenant() {
        let runtime = Arc::new(MockRuntime::new());
        let state = state(&runtime);
        make_ready(&state, "alice", "c-alice");
        state.registry.claim("bob");

        let response = handle_admin_request(request(Method::DELETE, "/tenants/alice", Some(TOKEN)), &state).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!state.registry.contains("alice"));
        assert_eq!(runtime.stopped.lock().as_slice(), ["c-alice".to_string()]);

        let again = handle_admin_request(request(Method::DELETE, "/tenants/alice", Some(TOKEN)), &state).await;
        assert_eq!(again.status(), StatusCode::NOT_FOUND);

        let busy = handle_admin_request(request(Method::DELETE, "/tenants/bob", Some(TOKEN)), &state).await;
        assert_eq!(busy.status(), StatusCode::CONFLICT);
        assert!(state.registry.contains("bob"));
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let state = state(&Arc::new(MockRuntime::new()));
        let response = handle_admin_request(request(Method::POST, "/tenants", Some(TOKEN)), &state).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
