//! Reclaiming idle and orphaned tenant workloads
//!
//! Two independent passes, each meant to be driven by its own timer:
//! - the idle pass evicts Ready tenants nobody has requested for a while,
//! - the orphan pass removes tenant workloads the registry does not know about.
//!
//! A failure for one tenant is logged and the pass moves on to the next.

use crate::provision::{bounded, WorkloadNaming};
use crate::registry::{EntryState, TenantRegistry, TenantSnapshot};
use crate::runtime::{RuntimeError, SharedRuntime};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// What one pass did
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CullReport {
    pub examined: usize,
    pub removed: usize,
    pub failed: usize,
}

/// Outcome of evicting a single tenant on request
#[derive(Debug, Clone, PartialEq)]
pub enum Eviction {
    /// No entry for this identity
    Missing,
    /// The entry is provisioning or already being torn down, and was left alone
    Busy,
    /// The entry was removed; `teardown_failed` is set when the workload could not be cleaned up
    Evicted {
        snapshot: TenantSnapshot,
        teardown_failed: bool,
    },
}

pub struct CullService {
    registry: Arc<TenantRegistry>,
    runtime: SharedRuntime,
    naming: WorkloadNaming,
    idle_timeout: Duration,
    call_timeout: Duration,
}

impl CullService {
    pub fn new(
        registry: Arc<TenantRegistry>,
        runtime: SharedRuntime,
        naming: WorkloadNaming,
        idle_timeout: Duration,
        call_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            runtime,
            naming,
            idle_timeout,
            call_timeout,
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub async fn run_idle_cull(&self) -> CullReport {
        self.run_idle_cull_at(Instant::now()).await
    }

    /// Idle pass evaluated as if the clock read `now`
    pub async fn run_idle_cull_at(&self, now: Instant) -> CullReport {
        let mut report = CullReport::default();

        let candidates: Vec<String> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|entry| entry.state == EntryState::Ready)
            .inspect(|_| report.examined += 1)
            .filter(|entry| entry.idle_at(now) > self.idle_timeout)
            .map(|entry| entry.identity)
            .collect();

        for identity in candidates {
            // Re-checked under the entry lock; a request may have arrived since the snapshot.
            // The entry stays Draining until teardown ends so nobody re-adopts the workload.
            let Some(evicted) = self.registry.drain_idle(&identity, now, self.idle_timeout) else {
                continue;
            };
            info!(
                identity,
                idle_secs = evicted.idle_at(now).as_secs(),
                access_count = evicted.access_count,
                "Tenant idle timeout reached"
            );
            report.removed += 1;

            if let Some(workload_id) = evicted.workload_id.as_deref() {
                if let Err(e) = self.teardown(workload_id).await {
                    warn!(identity, workload_id, error = %e, "Failed to tear down idle workload");
                    report.failed += 1;
                }
            }
            self.registry.finish_drain(&identity);
        }

        if report.removed > 0 {
            info!(examined = report.examined, removed = report.removed, failed = report.failed, "Idle cull finished");
        } else {
            debug!(examined = report.examined, "Idle cull found nothing to do");
        }
        report
    }

    /// Evict one Ready tenant regardless of how recently it was used
    pub async fn evict(&self, identity: &str) -> Eviction {
        let Some(current) = self.registry.get(identity) else {
            return Eviction::Missing;
        };
        let evicted = match (current.state, current.backend_url.as_deref()) {
            (EntryState::Ready, Some(backend_url)) => self.registry.drain_backend(identity, backend_url),
            _ => return Eviction::Busy,
        };
        // Lost a race with another eviction or a forwarding failure
        let Some(snapshot) = evicted else {
            return Eviction::Busy;
        };
        info!(identity, access_count = snapshot.access_count, "Tenant evicted on request");

        let mut teardown_failed = false;
        if let Some(workload_id) = snapshot.workload_id.as_deref() {
            if let Err(e) = self.teardown(workload_id).await {
                warn!(identity, workload_id, error = %e, "Failed to tear down evicted workload");
                teardown_failed = true;
            }
        }
        self.registry.finish_drain(identity);
        Eviction::Evicted {
            snapshot,
            teardown_failed,
        }
    }

    /// Stop and remove tenant workloads that have no registry entry
    pub async fn run_orphan_cull(&self) -> Result<CullReport, RuntimeError> {
        let mut report = CullReport::default();
        let prefix = self.naming.prefix();

        let workloads = bounded(
            self.call_timeout,
            "list",
            prefix,
            self.runtime.list_workloads(prefix),
        )
        .await?;

        for workload in workloads {
            let Some(identity) = self.naming.identity_of(&workload.name) else {
                continue;
            };
            report.examined += 1;
            if self.registry.contains(identity) {
                continue;
            }

            info!(identity, workload_id = %workload.id, running = workload.running, "Removing orphaned workload");
            match self.teardown(&workload.id).await {
                Ok(()) => report.removed += 1,
                Err(e) => {
                    warn!(identity, workload_id = %workload.id, error = %e, "Failed to remove orphaned workload");
                    report.failed += 1;
                }
            }
        }

        if report.removed > 0 || report.failed > 0 {
            info!(examined = report.examined, removed = report.removed, failed = report.failed, "Orphan cull finished");
        } else {
            debug!(examined = report.examined, "Orphan cull found nothing to do");
        }
        Ok(report)
    }

    /// Stop then remove. Removal is attempted even when stop fails.
    async fn teardown(&self, workload_id: &str) -> Result<(), RuntimeError> {
        let stopped = bounded(
            self.call_timeout,
            "stop",
            workload_id,
            self.runtime.stop(workload_id),
        )
        .await;
        if let Err(ref e) = stopped {
            debug!(workload_id, error = %e, "Stop failed, removing anyway");
        }
        bounded(
            self.call_timeout,
            "remove",
            workload_id,
            self.runtime.remove(workload_id),
        )
        .await?;
        stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forward::ProxyFactory;
    use crate::pool::{ConnectionPool, PoolConfig};
    use crate::runtime::testing::MockRuntime;
    use crate::wait_page::WaitPage;

    const TIMEOUT: Duration = Duration::from_secs(600);

    fn service(registry: &Arc<TenantRegistry>, runtime: &Arc<MockRuntime>) -> CullService {
        CullService::new(
            Arc::clone(registry),
            Arc::clone(runtime) as SharedRuntime,
            WorkloadNaming::new("hp-"),
            TIMEOUT,
            Duration::from_secs(5),
        )
    }

    fn make_ready(registry: &Arc<TenantRegistry>, identity: &str, workload_id: &str) {
        let factory = ProxyFactory::new(
            Arc::new(ConnectionPool::new(PoolConfig::default())),
            Arc::clone(registry),
            Arc::new(WaitPage::default()),
            Duration::from_secs(5),
        );
        let url = "http://127.0.0.1:9";
        registry.claim(identity);
        registry.promote(identity, url, workload_id, factory.build(url).unwrap());
    }

    #[tokio::test]
    async fn test_idle_cull_timeout_boundary() {
        let registry = TenantRegistry::new();
        let runtime = Arc::new(MockRuntime::new());
        make_ready(&registry, "alice", "c-alice");
        let last = registry.get("alice").unwrap().last_access_at;
        let culler = service(&registry, &runtime);

        let report = culler.run_idle_cull_at(last + Duration::from_secs(599)).await;
        assert_eq!(report.removed, 0);
        assert!(registry.contains("alice"));

        let report = culler.run_idle_cull_at(last + Duration::from_secs(601)).await;
        assert_eq!(report.removed, 1);
        assert!(!registry.contains("alice"));
        assert_eq!(runtime.stopped.lock().as_slice(), ["c-alice".to_string()]);
        assert_eq!(runtime.removed.lock().as_slice(), ["c-alice".to_string()]);
    }

    #[tokio::test]
    async fn test_idle_cull_never_touches_provisioning() {
        let registry = TenantRegistry::new();
        let runtime = Arc::new(MockRuntime::new());
        registry.claim("bob");
        let culler = service(&registry, &runtime);

        let report = culler
            .run_idle_cull_at(Instant::now() + Duration::from_secs(100_000))
            .await;
        assert_eq!(report, CullReport::default());
        assert!(registry.contains("bob"));
    }

    #[tokio::test]
    async fn test_idle_cull_removes_entry_even_if_teardown_fails() {
        let registry = TenantRegistry::new();
        let runtime = Arc::new(MockRuntime::new());
        runtime.fail_stop_for.lock().push("c-alice".to_string());
        make_ready(&registry, "alice", "c-alice");
        make_ready(&registry, "carol", "c-carol");
        let culler = service(&registry, &runtime);

        let report = culler
            .run_idle_cull_at(Instant::now() + Duration::from_secs(700))
            .await;
        assert_eq!(report.removed, 2);
        assert_eq!(report.failed, 1);
        assert!(registry.is_empty());
        assert!(runtime.stopped.lock().contains(&"c-carol".to_string()));
    }

    #[tokio::test]
    async fn test_evict_on_request() {
        let registry = TenantRegistry::new();
        let runtime = Arc::new(MockRuntime::new());
        make_ready(&registry, "alice", "c-alice");
        registry.claim("bob");
        let culler = service(&registry, &runtime);

        assert_eq!(culler.evict("nobody").await, Eviction::Missing);
        assert_eq!(culler.evict("bob").await, Eviction::Busy);
        assert!(registry.contains("bob"));

        match culler.evict("alice").await {
            Eviction::Evicted {
                snapshot,
                teardown_failed,
            } => {
                assert_eq!(snapshot.identity, "alice");
                assert!(!teardown_failed);
            }
            other => panic!("unexpected eviction outcome: {:?}", other),
        }
        assert!(!registry.contains("alice"));
        assert_eq!(runtime.removed.lock().as_slice(), ["c-alice".to_string()]);
    }

    #[tokio::test]
    async fn test_orphan_cull() {
        let registry = TenantRegistry::new();
        let runtime = Arc::new(MockRuntime::new());
        runtime.insert_running("c-alice", "hp-alice", "172.17.0.2");
        runtime.insert_running("c-ghost", "hp-ghost", "172.17.0.3");
        runtime.insert_running("c-db", "postgres", "172.17.0.4");
        make_ready(&registry, "alice", "c-alice");
        let culler = service(&registry, &runtime);

        let report = culler.run_orphan_cull().await.unwrap();
        assert_eq!(report.examined, 2);
        assert_eq!(report.removed, 1);
        assert_eq!(runtime.removed.lock().as_slice(), ["c-ghost".to_string()]);
        assert!(runtime.workloads.lock().contains_key("c-alice"));
        assert!(runtime.workloads.lock().contains_key("c-db"));
    }

    #[tokio::test]
    async fn test_orphan_cull_spares_provisioning_claims() {
        let registry = TenantRegistry::new();
        let runtime = Arc::new(MockRuntime::new());
        runtime.insert_running("c-bob", "hp-bob", "172.17.0.2");
        registry.claim("bob");

        let report = service(&registry, &runtime).run_orphan_cull().await.unwrap();
        assert_eq!(report.removed, 0);
        assert!(runtime.workloads.lock().contains_key("c-bob"));
    }
}
