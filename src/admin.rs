use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use serde_json::json;
use tracing::info;

use gatehouse_audit_center::{AuditEvent, AuditFilter, AuditKind};
use gatehouse_core_types::{ActionType, ActorId, CorrelationId, RoleId, TaskId, TenantId, TierLevel};
use gatehouse_identity_center::{Actor, Credential};
use gatehouse_orchestrator::{TaskRecord, TaskStatus};
use gatehouse_policy_center::{
    PolicyCenter, PolicySnapshot, RuntimeOverrideSpec, Tenant, TenantStatus, TierDraft,
};
use gatehouse_worker_registry::{RoleStatus, WorkerRoleSpec};

use crate::kernel::Kernel;

/// Administrative surface consumed by the external UI/CLI layer: tenant
/// CRUD, tier versioning, worker registration, manual identity actions,
/// and read-only queries over tasks and decisions.
pub struct AdminApi {
    kernel: Arc<Kernel>,
}

impl AdminApi {
    pub fn new(kernel: Arc<Kernel>) -> Self {
        Self { kernel }
    }

    pub async fn create_tenant(
        &self,
        name: impl Into<String>,
        tier: TierLevel,
    ) -> anyhow::Result<Tenant> {
        let tenant = Tenant::new(name, tier);
        self.kernel
            .policy
            .upsert_tenant(tenant.clone())
            .await
            .context("creating tenant")?;
        self.audit_admin(
            AuditKind::TenantUpdated,
            Some(tenant.id.clone()),
            json!({ "name": tenant.name, "tier": tenant.default_tier, "op": "create" }),
        )
        .await;
        info!(tenant = %tenant.id, name = %tenant.name, "tenant created");
        Ok(tenant)
    }

    pub async fn set_tenant_status(
        &self,
        tenant: &TenantId,
        status: TenantStatus,
    ) -> anyhow::Result<()> {
        self.kernel
            .policy
            .set_tenant_status(tenant, status)
            .await
            .context("updating tenant status")?;
        self.audit_admin(
            AuditKind::TenantUpdated,
            Some(tenant.clone()),
            json!({ "status": status, "op": "status" }),
        )
        .await;
        Ok(())
    }

    /// Durable per-tenant action switch (`enabled = false` disables an
    /// action the tier would otherwise allow).
    pub async fn set_tenant_action(
        &self,
        tenant_id: &TenantId,
        action: ActionType,
        enabled: bool,
    ) -> anyhow::Result<()> {
        let snapshot = self
            .kernel
            .policy
            .snapshot()
            .await
            .context("reading policy snapshot")?;
        let mut tenant = snapshot
            .tenant(tenant_id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown tenant {tenant_id}"))?;
        tenant.overrides.insert(action, enabled);
        self.kernel
            .policy
            .upsert_tenant(tenant)
            .await
            .context("updating tenant overrides")?;
        self.audit_admin(
            AuditKind::TenantUpdated,
            Some(tenant_id.clone()),
            json!({ "action": action, "enabled": enabled, "op": "action_override" }),
        )
        .await;
        Ok(())
    }

    /// Publish a new tier version; evaluations pick it up at the next
    /// decision.
    pub async fn publish_tier(&self, draft: TierDraft) -> anyhow::Result<u64> {
        let level = draft.level;
        let version = self
            .kernel
            .policy
            .publish_tier(draft)
            .await
            .context("publishing tier version")?;
        self.audit_admin(
            AuditKind::TierPublished,
            None,
            json!({ "tier": level, "version": version }),
        )
        .await;
        Ok(version)
    }

    /// TTL'd runtime policy override (ops escape hatch).
    pub async fn apply_policy_override(&self, spec: RuntimeOverrideSpec) -> anyhow::Result<()> {
        self.kernel
            .policy
            .apply_override(spec)
            .await
            .context("applying runtime override")?;
        Ok(())
    }

    pub async fn register_worker(&self, spec: WorkerRoleSpec) -> anyhow::Result<RoleId> {
        let name = spec.name.clone();
        let role = self
            .kernel
            .registry
            .register(spec)
            .map_err(|err| anyhow!("{err}"))?;
        self.audit_admin(
            AuditKind::WorkerRegistered,
            None,
            json!({ "role": role.to_string(), "name": name }),
        )
        .await;
        // Takes effect for future assign cycles.
        self.kernel.orchestrator.wake();
        Ok(role)
    }

    pub async fn deregister_worker(&self, role: &RoleId) -> anyhow::Result<WorkerRoleSpec> {
        let spec = self
            .kernel
            .registry
            .deregister(role)
            .map_err(|err| anyhow!("{err}"))?;
        self.audit_admin(
            AuditKind::WorkerDeregistered,
            None,
            json!({ "role": role.to_string(), "name": spec.name }),
        )
        .await;
        Ok(spec)
    }

    pub fn worker_status(&self) -> Vec<RoleStatus> {
        self.kernel.registry.status()
    }

    pub async fn issue_human(
        &self,
        tenant: TenantId,
        tier: TierLevel,
    ) -> anyhow::Result<(Actor, Credential)> {
        self.kernel
            .identity
            .issue_human_identity(tenant, tier)
            .await
            .map_err(|err| anyhow!("{err}"))
    }

    pub async fn issue_agent(
        &self,
        origin: &ActorId,
        scope: HashSet<ActionType>,
        ttl: Duration,
    ) -> anyhow::Result<(Actor, Credential)> {
        self.kernel
            .identity
            .issue_agent_identity(origin, scope, Some(ttl))
            .await
            .map_err(|err| anyhow!("{err}"))
    }

    pub async fn revoke_actor(
        &self,
        actor: &ActorId,
        reason: impl Into<String>,
    ) -> anyhow::Result<()> {
        self.kernel
            .identity
            .revoke_identity(actor, reason)
            .await
            .map_err(|err| anyhow!("{err}"))
    }

    pub async fn rotate_actor(&self, actor: &ActorId) -> anyhow::Result<Credential> {
        self.kernel
            .identity
            .rotate_credential(actor)
            .await
            .map_err(|err| anyhow!("{err}"))
    }

    pub fn task(&self, task: &TaskId) -> Option<TaskRecord> {
        self.kernel.orchestrator.task(task)
    }

    /// All task states for one correlation, for "all complete" detection.
    pub fn correlation_status(&self, correlation: &CorrelationId) -> Vec<(TaskId, TaskStatus)> {
        self.kernel.orchestrator.correlation_states(correlation)
    }

    pub async fn audit_query(
        &self,
        filter: &AuditFilter,
    ) -> anyhow::Result<Vec<AuditEvent>> {
        self.kernel
            .audit
            .query(filter)
            .await
            .map_err(|err| anyhow!("{err}"))
    }

    pub async fn policy_snapshot(&self) -> anyhow::Result<Arc<PolicySnapshot>> {
        self.kernel
            .policy
            .snapshot()
            .await
            .map_err(|err| anyhow!("{err}"))
    }

    async fn audit_admin(
        &self,
        kind: AuditKind,
        tenant: Option<TenantId>,
        detail: serde_json::Value,
    ) {
        let mut event = AuditEvent::new(kind, self.kernel.clock.now()).detail(detail);
        if let Some(tenant) = tenant {
            event = event.tenant(tenant);
        }
        if let Err(err) = self.kernel.audit.append(event).await {
            tracing::warn!(target: "admin", %err, "audit append failed");
        }
    }
}
