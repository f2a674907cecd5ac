//! Idempotent provisioning of tenant workloads

use crate::config::RuntimeConfig;
use crate::directory::{DirectoryError, SharedResolver};
use crate::mounts::plan_mounts;
use crate::runtime::{RuntimeError, SharedRuntime, WorkloadInfo, WorkloadSpec};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Label carrying the tenant identity on every workload
pub const TENANT_LABEL: &str = "homeproxy.tenant";

/// Why a provisioning attempt failed
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// A reachable tenant workload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provisioned {
    pub backend_url: String,
    pub workload_id: String,
}

/// Deterministic workload naming shared by the provisioner and the orphan cull
#[derive(Debug, Clone)]
pub struct WorkloadNaming {
    prefix: String,
}

impl WorkloadNaming {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn name_for(&self, identity: &str) -> String {
        format!("{}{}", self.prefix, identity)
    }

    /// Inverse of [`name_for`](Self::name_for); `None` for foreign workloads
    pub fn identity_of<'a>(&self, name: &'a str) -> Option<&'a str> {
        let name = name.strip_prefix('/').unwrap_or(name);
        name.strip_prefix(self.prefix.as_str())
            .filter(|identity| !identity.is_empty())
    }
}

/// Settings the provisioner needs from the runtime configuration
#[derive(Debug, Clone)]
pub struct ProvisionSettings {
    pub image: String,
    pub network: Option<String>,
    pub backend_port: u16,
    pub call_timeout: Duration,
}

impl From<&RuntimeConfig> for ProvisionSettings {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            image: config.image.clone(),
            network: config.network.clone(),
            backend_port: config.backend_port,
            call_timeout: config.call_timeout(),
        }
    }
}

/// Bound a runtime call, turning an elapsed timer into a [`RuntimeError::Timeout`]
pub async fn bounded<T, F>(
    timeout: Duration,
    operation: &'static str,
    target: &str,
    call: F,
) -> Result<T, RuntimeError>
where
    F: Future<Output = Result<T, RuntimeError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(RuntimeError::Timeout {
            operation,
            target: target.to_string(),
            secs: timeout.as_secs(),
        }),
    }
}

/// Ensures a tenant's workload exists, runs, and is reachable
pub struct WorkloadProvisioner {
    runtime: SharedRuntime,
    resolver: SharedResolver,
    naming: WorkloadNaming,
    settings: ProvisionSettings,
}

impl WorkloadProvisioner {
    pub fn new(
        runtime: SharedRuntime,
        resolver: SharedResolver,
        naming: WorkloadNaming,
        settings: ProvisionSettings,
    ) -> Self {
        Self {
            runtime,
            resolver,
            naming,
            settings,
        }
    }

    pub fn naming(&self) -> &WorkloadNaming {
        &self.naming
    }

    pub async fn provision(&self, identity: &str) -> Result<Provisioned, ProvisionError> {
        let name = self.naming.name_for(identity);
        let timeout = self.settings.call_timeout;

        // A previous orchestrator may have left the workload running
        let existing = bounded(
            timeout,
            "list",
            &name,
            self.runtime.list_workloads(&name),
        )
        .await?
        .into_iter()
        .find(|w| self.naming.identity_of(&w.name) == Some(identity));

        if let Some(workload) = existing {
            if workload.running {
                let info = bounded(
                    timeout,
                    "inspect",
                    &workload.id,
                    self.runtime.inspect_workload(&workload.id),
                )
                .await?;
                let provisioned = self.reachable(&name, &info)?;
                info!(identity, workload_id = %provisioned.workload_id, "Reusing running workload");
                return Ok(provisioned);
            }
            debug!(identity, workload_id = %workload.id, "Removing stopped workload before recreating");
            bounded(
                timeout,
                "remove",
                &workload.id,
                self.runtime.remove(&workload.id),
            )
            .await?;
        }

        let sources = match tokio::time::timeout(timeout, self.resolver.resolve(identity)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(DirectoryError::Lookup(format!(
                    "lookup for '{}' timed out after {}s",
                    identity,
                    timeout.as_secs()
                ))
                .into())
            }
        };
        let (primary, extras) = sources
            .split_first()
            .ok_or_else(|| DirectoryError::NoHome(identity.to_string()))?;
        let mounts = plan_mounts(identity, primary, extras);

        let spec = WorkloadSpec {
            name: name.clone(),
            image: self.settings.image.clone(),
            env: vec![format!("USERNAME={}", identity)],
            hostname: name.clone(),
            labels: HashMap::from([(TENANT_LABEL.to_string(), identity.to_string())]),
            mounts,
            network: self.settings.network.clone(),
        };

        let workload_id = bounded(
            timeout,
            "create",
            &name,
            self.runtime.create_and_start(&spec),
        )
        .await?;
        info!(identity, workload_id = %workload_id, image = %spec.image, mounts = spec.mounts.len(), "Workload started");

        let info = bounded(
            timeout,
            "inspect",
            &workload_id,
            self.runtime.inspect_workload(&workload_id),
        )
        .await?;

        self.reachable(&name, &info)
    }

    fn reachable(&self, name: &str, info: &WorkloadInfo) -> Result<Provisioned, ProvisionError> {
        let network = self.settings.network.as_deref();
        let ip = info.address_in(network).ok_or_else(|| {
            warn!(workload = name, network = ?network, "Workload has no address");
            RuntimeError::operation(
                "inspect",
                name,
                format!("no address in network '{}'", network.unwrap_or("bridge")),
            )
        })?;
        Ok(Provisioned {
            backend_url: format!("http://{}:{}", ip, self.settings.backend_port),
            workload_id: info.id.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::testing::StaticResolver;
    use crate::runtime::testing::MockRuntime;
    use std::sync::Arc;

    fn settings(network: Option<&str>) -> ProvisionSettings {
        ProvisionSettings {
            image: "userweb:latest".to_string(),
            network: network.map(String::from),
            backend_port: 8080,
            call_timeout: Duration::from_secs(5),
        }
    }

    fn provisioner(
        runtime: Arc<MockRuntime>,
        resolver: StaticResolver,
        network: Option<&str>,
    ) -> WorkloadProvisioner {
        WorkloadProvisioner::new(
            runtime,
            Arc::new(resolver),
            WorkloadNaming::new("hp-"),
            settings(network),
        )
    }

    #[test]
    fn test_naming_round_trip() {
        let naming = WorkloadNaming::new("hp-");
        assert_eq!(naming.name_for("alice"), "hp-alice");
        assert_eq!(naming.identity_of("hp-alice"), Some("alice"));
        assert_eq!(naming.identity_of("/hp-alice"), Some("alice"));
        assert_eq!(naming.identity_of("hp-"), None);
        assert_eq!(naming.identity_of("postgres"), None);
    }

    #[tokio::test]
    async fn test_provision_creates_workload() {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path().join("public_html");
        std::fs::create_dir_all(&home).unwrap();

        let runtime = Arc::new(MockRuntime::new());
        let resolver = StaticResolver::default().with(
            "alice",
            vec![home.display().to_string(), "/missing/path".to_string()],
        );
        let p = provisioner(Arc::clone(&runtime), resolver, Some("homenet"));

        let provisioned = p.provision("alice").await.unwrap();
        assert_eq!(provisioned.backend_url, "http://127.0.0.1:8080");
        assert_eq!(runtime.create_count(), 1);

        let created = runtime.created.lock()[0].clone();
        assert_eq!(created.name, "hp-alice");
        assert_eq!(created.image, "userweb:latest");
        assert_eq!(created.env, vec!["USERNAME=alice"]);
        assert_eq!(created.network.as_deref(), Some("homenet"));
        assert_eq!(created.labels.get(TENANT_LABEL).map(String::as_str), Some("alice"));
        assert_eq!(created.mounts.len(), 1);
        assert_eq!(created.mounts[0].target, "/users/alice/public_html");
    }

    #[tokio::test]
    async fn test_provision_reuses_running_workload() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.insert_running("old1", "hp-alice", "172.17.0.4");
        let p = provisioner(Arc::clone(&runtime), StaticResolver::default(), None);

        let provisioned = p.provision("alice").await.unwrap();
        assert_eq!(
            provisioned,
            Provisioned {
                backend_url: "http://172.17.0.4:8080".to_string(),
                workload_id: "old1".to_string(),
            }
        );
        assert_eq!(runtime.create_count(), 0);
    }

    #[tokio::test]
    async fn test_provision_does_not_reuse_prefix_sibling() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.insert_running("other", "hp-alice2", "172.17.0.9");
        let resolver = StaticResolver::default().with("alice", vec!["/nowhere".to_string()]);
        let p = provisioner(Arc::clone(&runtime), resolver, None);

        let provisioned = p.provision("alice").await.unwrap();
        assert_ne!(provisioned.workload_id, "other");
        assert_eq!(runtime.create_count(), 1);
    }

    #[tokio::test]
    async fn test_provision_replaces_stopped_workload() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.insert_running("old1", "hp-alice", "172.17.0.4");
        runtime.workloads.lock().get_mut("old1").unwrap().running = false;
        let resolver = StaticResolver::default().with("alice", vec!["/nowhere".to_string()]);
        let p = provisioner(Arc::clone(&runtime), resolver, None);

        p.provision("alice").await.unwrap();
        assert_eq!(runtime.removed.lock().as_slice(), ["old1".to_string()]);
        assert_eq!(runtime.create_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_tenant_is_directory_error() {
        let runtime = Arc::new(MockRuntime::new());
        let p = provisioner(Arc::clone(&runtime), StaticResolver::default(), None);

        let err = p.provision("mallory").await.unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::Directory(DirectoryError::UnknownTenant(_))
        ));
        assert_eq!(runtime.create_count(), 0);
    }

    #[tokio::test]
    async fn test_runtime_failure_is_surfaced() {
        let runtime = Arc::new(MockRuntime::new().failing_create());
        let resolver = StaticResolver::default().with("alice", vec!["/nowhere".to_string()]);
        let p = provisioner(Arc::clone(&runtime), resolver, None);

        let err = p.provision("alice").await.unwrap_err();
        assert!(matches!(err, ProvisionError::Runtime(RuntimeError::Operation { .. })));
    }

    #[tokio::test]
    async fn test_slow_runtime_times_out() {
        let runtime = Arc::new(MockRuntime::new().with_create_delay(Duration::from_millis(500)));
        let resolver = StaticResolver::default().with("alice", vec!["/nowhere".to_string()]);
        let mut s = settings(None);
        s.call_timeout = Duration::from_millis(50);
        let p = WorkloadProvisioner::new(runtime, Arc::new(resolver), WorkloadNaming::new("hp-"), s);

        let err = p.provision("alice").await.unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::Runtime(RuntimeError::Timeout { operation: "create", .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_address_fails() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.insert_running("old1", "hp-alice", "172.17.0.4");
        // Configured network differs from the one the workload sits in
        let p = provisioner(Arc::clone(&runtime), StaticResolver::default(), Some("homenet"));

        let err = p.provision("alice").await.unwrap_err();
        assert!(matches!(err, ProvisionError::Runtime(_)));
    }
}
