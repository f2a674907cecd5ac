//! The shared tenant registry.
//!
//! Every tenant that is being provisioned or is being served has exactly one entry here.
//! Structural changes (claim, remove) go through the map's shard locks, field updates
//! through the per-entry mutex, so callers never copy an entry out and write it back.

use crate::forward::ForwardHandler;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Lifecycle state of a tenant entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
    /// Claimed, workload not reachable yet
    Provisioning,
    /// Backend reachable, requests are forwarded
    Ready,
    /// Workload is being torn down; the entry blocks new claims until it is dropped
    Draining,
}

/// One tenant's proxy entry
pub struct ProxyEntry {
    identity: String,
    state: EntryState,
    backend_url: Option<String>,
    workload_id: Option<String>,
    handler: Option<Arc<ForwardHandler>>,
    created_at: Instant,
    created_wall: chrono::DateTime<chrono::Utc>,
    last_access_at: Instant,
    access_count: u64,
}

impl ProxyEntry {
    fn provisioning(identity: &str) -> Self {
        let now = Instant::now();
        Self {
            identity: identity.to_string(),
            state: EntryState::Provisioning,
            backend_url: None,
            workload_id: None,
            handler: None,
            created_at: now,
            created_wall: chrono::Utc::now(),
            last_access_at: now,
            access_count: 0,
        }
    }

    fn snapshot(&self) -> TenantSnapshot {
        TenantSnapshot {
            identity: self.identity.clone(),
            state: self.state,
            backend_url: self.backend_url.clone(),
            workload_id: self.workload_id.clone(),
            created_at: self.created_at,
            created_wall: self.created_wall,
            last_access_at: self.last_access_at,
            access_count: self.access_count,
        }
    }

    fn idle_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_access_at)
    }
}

/// Point-in-time copy of an entry, without the forwarding handler
#[derive(Debug, Clone, PartialEq)]
pub struct TenantSnapshot {
    pub identity: String,
    pub state: EntryState,
    pub backend_url: Option<String>,
    pub workload_id: Option<String>,
    pub created_at: Instant,
    pub created_wall: chrono::DateTime<chrono::Utc>,
    pub last_access_at: Instant,
    pub access_count: u64,
}

impl TenantSnapshot {
    pub fn idle_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_access_at)
    }
}

/// Registry of tenant proxy entries.
///
/// Designed to be shared behind an `Arc`; all methods take `&self`.
#[derive(Default)]
pub struct TenantRegistry {
    entries: DashMap<String, Mutex<ProxyEntry>>,
}

impl TenantRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Insert a Provisioning entry if none exists.
    ///
    /// Returns true only for the single caller that created the entry.
    pub fn claim(&self, identity: &str) -> bool {
        match self.entries.entry(identity.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(Mutex::new(ProxyEntry::provisioning(identity)));
                debug!(identity, "Claimed tenant for provisioning");
                true
            }
        }
    }

    /// Move a Provisioning entry to Ready.
    ///
    /// Returns false if the entry vanished or was already Ready.
    pub fn promote(
        &self,
        identity: &str,
        backend_url: &str,
        workload_id: &str,
        handler: Arc<ForwardHandler>,
    ) -> bool {
        let Some(entry) = self.entries.get(identity) else {
            return false;
        };
        let mut guard = entry.lock();
        if guard.state != EntryState::Provisioning {
            return false;
        }
        guard.state = EntryState::Ready;
        guard.backend_url = Some(backend_url.to_string());
        guard.workload_id = Some(workload_id.to_string());
        guard.handler = Some(handler);
        guard.last_access_at = Instant::now();
        info!(identity, backend = backend_url, workload_id, "Tenant is ready");
        true
    }

    /// Record one forwarded request and hand out the entry's handler.
    ///
    /// Returns `None` unless the entry is Ready.
    pub fn touch(&self, identity: &str) -> Option<Arc<ForwardHandler>> {
        let entry = self.entries.get(identity)?;
        let mut guard = entry.lock();
        if guard.state != EntryState::Ready {
            return None;
        }
        guard.access_count += 1;
        let now = Instant::now();
        if now > guard.last_access_at {
            guard.last_access_at = now;
        }
        guard.handler.clone()
    }

    pub fn get(&self, identity: &str) -> Option<TenantSnapshot> {
        self.entries.get(identity).map(|e| e.lock().snapshot())
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.entries.contains_key(identity)
    }

    /// Drop an entry whatever its state, returning its last snapshot
    pub fn remove(&self, identity: &str) -> Option<TenantSnapshot> {
        self.entries
            .remove(identity)
            .map(|(_, entry)| entry.into_inner().snapshot())
    }

    /// Drop a Ready entry only if it still points at `backend_url`.
    ///
    /// Used by forwarding failures so a stale handler cannot evict a newer claim.
    pub fn evict_backend(&self, identity: &str, backend_url: &str) -> Option<TenantSnapshot> {
        self.entries
            .remove_if(identity, |_, entry| {
                let guard = entry.lock();
                guard.state == EntryState::Ready && guard.backend_url.as_deref() == Some(backend_url)
            })
            .map(|(_, entry)| entry.into_inner().snapshot())
    }

    /// Move a Ready entry that has been idle longer than `timeout` at `now` to Draining.
    ///
    /// The check and the transition happen under the same lock, so a request that touched
    /// the entry after a snapshot was taken keeps it alive. The returned snapshot is the
    /// entry as it was while Ready.
    pub fn drain_idle(
        &self,
        identity: &str,
        now: Instant,
        timeout: Duration,
    ) -> Option<TenantSnapshot> {
        self.drain_if(identity, |entry| entry.idle_at(now) > timeout)
    }

    /// Move a Ready entry still pointing at `backend_url` to Draining
    pub fn drain_backend(&self, identity: &str, backend_url: &str) -> Option<TenantSnapshot> {
        self.drain_if(identity, |entry| entry.backend_url.as_deref() == Some(backend_url))
    }

    fn drain_if(
        &self,
        identity: &str,
        predicate: impl FnOnce(&ProxyEntry) -> bool,
    ) -> Option<TenantSnapshot> {
        let entry = self.entries.get(identity)?;
        let mut guard = entry.lock();
        if guard.state != EntryState::Ready || !predicate(&*guard) {
            return None;
        }
        let snapshot = guard.snapshot();
        guard.state = EntryState::Draining;
        guard.handler = None;
        debug!(identity, "Tenant draining");
        Some(snapshot)
    }

    /// Drop a Draining entry once its workload is gone
    pub fn finish_drain(&self, identity: &str) -> bool {
        self.entries
            .remove_if(identity, |_, entry| entry.lock().state == EntryState::Draining)
            .is_some()
    }

    pub fn snapshot(&self) -> Vec<TenantSnapshot> {
        self.entries.iter().map(|e| e.value().lock().snapshot()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
