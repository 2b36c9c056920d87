use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use gatehouse_core_types::{ActionType, RoleId};

/// Declaration of a worker role: which action types it can execute and how
/// many tasks it may run at once. Workers themselves are external
/// executors reached through the orchestrator's dispatch seam.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerRoleSpec {
    pub name: String,
    pub capabilities: HashSet<ActionType>,
    pub concurrency: usize,
}

impl WorkerRoleSpec {
    pub fn new(
        name: impl Into<String>,
        capabilities: impl IntoIterator<Item = ActionType>,
        concurrency: usize,
    ) -> Self {
        Self {
            name: name.into(),
            capabilities: capabilities.into_iter().collect(),
            concurrency: concurrency.max(1),
        }
    }
}

#[derive(Debug, Error)]
pub enum WorkerRegistryError {
    #[error("unknown worker role: {0}")]
    UnknownRole(RoleId),
    #[error("worker role name already registered: {0}")]
    DuplicateName(String),
}

struct RoleEntry {
    spec: WorkerRoleSpec,
    running: Arc<AtomicUsize>,
    registered_seq: u64,
}

/// Read-only view for the administrative query surface.
#[derive(Clone, Debug, Serialize)]
pub struct RoleStatus {
    pub id: RoleId,
    pub name: String,
    pub capabilities: HashSet<ActionType>,
    pub concurrency: usize,
    pub running: usize,
}

/// An eligible role for one assignment attempt, ordered least-loaded first
/// with registration order as the deterministic tie-break.
#[derive(Clone, Debug)]
pub struct Candidate {
    pub id: RoleId,
    pub running: usize,
    pub registered_seq: u64,
}

/// RAII slot on a role's concurrency budget; dropping it frees the slot.
pub struct LoadPermit {
    running: Arc<AtomicUsize>,
    role: RoleId,
}

impl LoadPermit {
    pub fn role(&self) -> &RoleId {
        &self.role
    }
}

impl Drop for LoadPermit {
    fn drop(&mut self) {
        self.running.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Capability table, mutable only through administrative registration.
/// Changes take effect for future assignment cycles; running tasks are
/// never preempted because their permits outlive deregistration.
#[derive(Default)]
pub struct WorkerRegistry {
    roles: DashMap<RoleId, RoleEntry>,
    seq: AtomicU64,
}

impl WorkerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, spec: WorkerRoleSpec) -> Result<RoleId, WorkerRegistryError> {
        if self
            .roles
            .iter()
            .any(|entry| entry.value().spec.name == spec.name)
        {
            return Err(WorkerRegistryError::DuplicateName(spec.name));
        }
        let id = RoleId::new();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        info!(target: "worker_registry", role = %spec.name, concurrency = spec.concurrency, "worker role registered");
        self.roles.insert(
            id.clone(),
            RoleEntry {
                spec,
                running: Arc::new(AtomicUsize::new(0)),
                registered_seq: seq,
            },
        );
        Ok(id)
    }

    pub fn deregister(&self, role: &RoleId) -> Result<WorkerRoleSpec, WorkerRegistryError> {
        match self.roles.remove(role) {
            Some((_, entry)) => {
                info!(target: "worker_registry", role = %entry.spec.name, "worker role deregistered");
                Ok(entry.spec)
            }
            None => Err(WorkerRegistryError::UnknownRole(role.clone())),
        }
    }

    /// Roles able to run `action` with spare capacity right now, ordered
    /// least-loaded then by registration order.
    pub fn candidates(&self, action: ActionType) -> Vec<Candidate> {
        let mut out: Vec<Candidate> = self
            .roles
            .iter()
            .filter_map(|entry| {
                let role = entry.value();
                if !role.spec.capabilities.contains(&action) {
                    return None;
                }
                let running = role.running.load(Ordering::Acquire);
                (running < role.spec.concurrency).then(|| Candidate {
                    id: entry.key().clone(),
                    running,
                    registered_seq: role.registered_seq,
                })
            })
            .collect();
        out.sort_by(|a, b| {
            a.running
                .cmp(&b.running)
                .then(a.registered_seq.cmp(&b.registered_seq))
        });
        out
    }

    /// Claim a concurrency slot on `role`. Returns `None` when the role is
    /// gone or already at its limit (a concurrent claim may have won).
    pub fn try_acquire(&self, role: &RoleId) -> Option<LoadPermit> {
        let entry = self.roles.get(role)?;
        let limit = entry.spec.concurrency;
        let running = Arc::clone(&entry.running);
        drop(entry);
        running
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < limit).then_some(current + 1)
            })
            .ok()?;
        Some(LoadPermit {
            running,
            role: role.clone(),
        })
    }

    pub fn status(&self) -> Vec<RoleStatus> {
        let mut out: Vec<RoleStatus> = self
            .roles
            .iter()
            .map(|entry| {
                let role = entry.value();
                RoleStatus {
                    id: entry.key().clone(),
                    name: role.spec.name.clone(),
                    capabilities: role.spec.capabilities.clone(),
                    concurrency: role.spec.concurrency,
                    running: role.running.load(Ordering::Acquire),
                }
            })
            .collect();
        out.sort_by_key(|status| status.name.clone());
        out
    }

    pub fn contains(&self, role: &RoleId) -> bool {
        self.roles.contains_key(role)
    }
}
