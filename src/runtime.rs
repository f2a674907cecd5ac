//! Container runtime interface consumed by the provisioner and the culling service

use crate::mounts::MountSpec;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Name the runtime gives its default network
pub const DEFAULT_NETWORK: &str = "bridge";

/// Failure talking to or executing against the container runtime
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The runtime rejected or failed an operation
    #[error("{operation} failed for '{target}': {message}")]
    Operation {
        operation: &'static str,
        target: String,
        message: String,
    },
    /// The runtime did not answer within the configured bound
    #[error("{operation} timed out after {secs}s for '{target}'")]
    Timeout {
        operation: &'static str,
        target: String,
        secs: u64,
    },
    /// The runtime could not be reached at all
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),
}

impl RuntimeError {
    pub fn operation(
        operation: &'static str,
        target: impl Into<String>,
        message: impl ToString,
    ) -> Self {
        RuntimeError::Operation {
            operation,
            target: target.into(),
            message: message.to_string(),
        }
    }
}

/// What the runtime reports about one workload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkloadInfo {
    pub id: String,
    /// Name without the leading slash the Docker API reports
    pub name: String,
    pub running: bool,
    /// Network name to IP address inside that network
    pub addresses: HashMap<String, String>,
}

impl WorkloadInfo {
    /// Address inside `network`, or the default bridge address when no network is configured
    pub fn address_in(&self, network: Option<&str>) -> Option<&str> {
        let key = network.unwrap_or(DEFAULT_NETWORK);
        self.addresses
            .get(key)
            .map(String::as_str)
            .filter(|ip| !ip.is_empty())
    }
}

/// Everything needed to create and start one tenant workload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<String>,
    pub hostname: String,
    pub labels: HashMap<String, String>,
    pub mounts: Vec<MountSpec>,
    pub network: Option<String>,
}

/// Abstract container runtime.
///
/// Implementations must tolerate concurrent calls; the orchestrator never serializes them.
#[async_trait]
pub trait RuntimeClient: Send + Sync {
    /// List workloads (running or not) whose name starts with `prefix`
    async fn list_workloads(&self, prefix: &str) -> Result<Vec<WorkloadInfo>, RuntimeError>;

    async fn inspect_workload(&self, id: &str) -> Result<WorkloadInfo, RuntimeError>;

    /// Create and start a workload, returning its runtime-assigned id
    async fn create_and_start(&self, spec: &WorkloadSpec) -> Result<String, RuntimeError>;

    async fn stop(&self, id: &str) -> Result<(), RuntimeError>;

    async fn remove(&self, id: &str) -> Result<(), RuntimeError>;

    /// Create the named network if it does not exist yet
    async fn ensure_network(&self, name: &str) -> Result<(), RuntimeError>;
}

pub type SharedRuntime = Arc<dyn RuntimeClient>;

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory runtime double shared by the unit tests

    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    pub struct MockRuntime {
        pub workloads: Mutex<HashMap<String, WorkloadInfo>>,
        pub created: Mutex<Vec<WorkloadSpec>>,
        pub stopped: Mutex<Vec<String>>,
        pub removed: Mutex<Vec<String>>,
        pub create_calls: AtomicUsize,
        pub create_delay: Option<Duration>,
        pub stop_delay: Option<Duration>,
        pub fail_create: bool,
        pub panic_create: bool,
        pub fail_stop_for: Mutex<Vec<String>>,
        next_id: AtomicUsize,
    }

    impl MockRuntime {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_create_delay(mut self, delay: Duration) -> Self {
            self.create_delay = Some(delay);
            self
        }

        pub fn with_stop_delay(mut self, delay: Duration) -> Self {
            self.stop_delay = Some(delay);
            self
        }

        pub fn failing_create(mut self) -> Self {
            self.fail_create = true;
            self
        }

        pub fn panicking_create(mut self) -> Self {
            self.panic_create = true;
            self
        }

        /// Register a workload as if a previous orchestrator had started it
        pub fn insert_running(&self, id: &str, name: &str, ip: &str) {
            let mut addresses = HashMap::new();
            addresses.insert(DEFAULT_NETWORK.to_string(), ip.to_string());
            self.workloads.lock().insert(
                id.to_string(),
                WorkloadInfo {
                    id: id.to_string(),
                    name: name.to_string(),
                    running: true,
                    addresses,
                },
            );
        }

        pub fn create_count(&self) -> usize {
            self.create_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RuntimeClient for MockRuntime {
        async fn list_workloads(&self, prefix: &str) -> Result<Vec<WorkloadInfo>, RuntimeError> {
            Ok(self
                .workloads
                .lock()
                .values()
                .filter(|w| w.name.starts_with(prefix))
                .cloned()
                .collect())
        }

        async fn inspect_workload(&self, id: &str) -> Result<WorkloadInfo, RuntimeError> {
            self.workloads
                .lock()
                .get(id)
                .cloned()
                .ok_or_else(|| RuntimeError::operation("inspect", id, "no such container"))
        }

        async fn create_and_start(&self, spec: &WorkloadSpec) -> Result<String, RuntimeError> {
            self.create_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.create_delay {
                tokio::time::sleep(delay).await;
            }
            if self.panic_create {
                panic!("runtime double panicked in create");
            }
            if self.fail_create {
                return Err(RuntimeError::operation("create", &spec.name, "image not found"));
            }
            let id = format!("c{}", self.next_id.fetch_add(1, Ordering::SeqCst));
            let network = spec.network.clone().unwrap_or(DEFAULT_NETWORK.to_string());
            let mut addresses = HashMap::new();
            addresses.insert(network, "127.0.0.1".to_string());
            self.workloads.lock().insert(
                id.clone(),
                WorkloadInfo {
                    id: id.clone(),
                    name: spec.name.clone(),
                    running: true,
                    addresses,
                },
            );
            self.created.lock().push(spec.clone());
            Ok(id)
        }

        async fn stop(&self, id: &str) -> Result<(), RuntimeError> {
            if let Some(delay) = self.stop_delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_stop_for.lock().iter().any(|f| f == id) {
                return Err(RuntimeError::operation("stop", id, "daemon error"));
            }
            if let Some(w) = self.workloads.lock().get_mut(id) {
                w.running = false;
            }
            self.stopped.lock().push(id.to_string());
            Ok(())
        }

        async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
            self.workloads.lock().remove(id);
            self.removed.lock().push(id.to_string());
            Ok(())
        }

        async fn ensure_network(&self, _name: &str) -> Result<(), RuntimeError> {
            Ok(())
        }
    }
}
