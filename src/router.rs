//! Request routing: tenant identity extraction and dispatch
//!
//! `/~<identity>[/<rest>]` is tenant traffic, `/ping` is the health endpoint and
//! everything else is a 404. A tenant request either goes through the tenant's
//! forward handler, gets the wait page while the workload starts, or claims the
//! tenant and provisions it.

use crate::error::{json_error_response, ProxyErrorCode};
use crate::forward::ProxyFactory;
use crate::pool::ProxyBody;
use crate::provision::WorkloadProvisioner;
use crate::registry::TenantRegistry;
use crate::wait_page::WaitPage;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::HeaderValue;
use hyper::{Request, Response, StatusCode};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Health endpoint path
pub const PING_PATH: &str = "/ping";

/// Longest identity accepted from a path
const MAX_IDENTITY_LEN: usize = 64;

const X_REQUEST_ID: &str = "x-request-id";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Tenant identity embedded in `path`, if the path is tenant traffic.
///
/// The path is percent-decoded first, so `/%7Ealice/` and `/~al%69ce/` both name `alice`.
/// Identities are limited to ASCII alphanumerics, `.`, `_` and `-` so that the
/// derived workload name is valid and distinct per tenant.
pub fn extract_identity(path: &str) -> Option<String> {
    let decoded = urlencoding::decode(path).ok()?;
    let rest = decoded.strip_prefix("/~")?;
    let identity = rest.split('/').next().unwrap_or(rest);

    if identity.is_empty() || identity.len() > MAX_IDENTITY_LEN {
        return None;
    }
    if !identity
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return None;
    }
    Some(identity.to_string())
}

/// `{"message":"pong","version":...}` with 201 Created
pub fn ping_response() -> Response<ProxyBody> {
    let body = serde_json::json!({
        "message": "pong",
        "version": env!("CARGO_PKG_VERSION"),
    });
    Response::builder()
        .status(StatusCode::CREATED)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(
            Full::new(Bytes::from(body.to_string()))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response with static headers")
}

pub struct Router {
    registry: Arc<TenantRegistry>,
    provisioner: Arc<WorkloadProvisioner>,
    factory: Arc<ProxyFactory>,
    wait_page: Arc<WaitPage>,
}

impl Router {
    pub fn new(
        registry: Arc<TenantRegistry>,
        provisioner: Arc<WorkloadProvisioner>,
        factory: Arc<ProxyFactory>,
        wait_page: Arc<WaitPage>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            provisioner,
            factory,
            wait_page,
        })
    }

    pub fn registry(&self) -> &Arc<TenantRegistry> {
        &self.registry
    }

    pub async fn route(
        self: &Arc<Self>,
        mut req: Request<ProxyBody>,
        client_addr: SocketAddr,
    ) -> Response<ProxyBody> {
        let path = req.uri().path().to_string();
        let referer = req
            .headers()
            .get(hyper::header::REFERER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if path == PING_PATH {
            debug!(path, remote = %client_addr, referer, "Ping");
            return ping_response();
        }

        let Some(identity) = extract_identity(&path) else {
            return json_error_response(ProxyErrorCode::NotFound, "Not found");
        };
        info!(identity, path, remote = %client_addr, referer, "Tenant request");

        if let Some(handler) = self.registry.touch(&identity) {
            add_forwarding_headers(&mut req, client_addr);
            return handler.forward(req).await;
        }

        if !self.registry.claim(&identity) {
            debug!(identity, "Tenant is being provisioned");
            return self.wait_page.response(&identity);
        }

        // Runs detached so a client hanging up cannot strand the claim
        let router = Arc::clone(self);
        let task_identity = identity.clone();
        let task = tokio::spawn(async move { router.provision_claimed(&task_identity).await });

        let provisioned = match task.await {
            Ok(result) => result,
            Err(e) => {
                self.registry.remove(&identity);
                error!(identity, error = %e, "Provisioning task aborted");
                return json_error_response(ProxyErrorCode::InternalError, "Internal error");
            }
        };

        match provisioned {
            Ok(()) => self.wait_page.response(&identity),
            Err(e) => {
                error!(identity, error = %e, "Provisioning failed");
                json_error_response(
                    ProxyErrorCode::ProvisioningFailed,
                    "The page could not be started",
                )
            }
        }
    }

    /// Provision a claimed tenant and promote its entry; releases the claim on failure
    async fn provision_claimed(&self, identity: &str) -> anyhow::Result<()> {
        let result = async {
            let provisioned = self.provisioner.provision(identity).await?;
            let handler = self.factory.build(&provisioned.backend_url)?;
            Ok::<_, anyhow::Error>((provisioned, handler))
        }
        .await;

        match result {
            Ok((provisioned, handler)) => {
                if !self.registry.promote(
                    identity,
                    &provisioned.backend_url,
                    &provisioned.workload_id,
                    handler,
                ) {
                    warn!(identity, workload_id = %provisioned.workload_id, "Claim vanished before promotion");
                }
                Ok(())
            }
            Err(e) => {
                self.registry.remove(identity);
                Err(e)
            }
        }
    }
}

/// Overwrite X-Forwarded-* and ensure a request id; this proxy is the first trusted hop
fn add_forwarding_headers(req: &mut Request<ProxyBody>, client_addr: SocketAddr) {
    let headers = req.headers_mut();

    if !headers.contains_key(X_REQUEST_ID) {
        if let Ok(value) = HeaderValue::from_str(&Uuid::new_v4().to_string()) {
            headers.insert(X_REQUEST_ID, value);
        }
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
}
