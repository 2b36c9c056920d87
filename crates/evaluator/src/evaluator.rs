use std::sync::Arc;

use tracing::{debug, warn};

use gatehouse_audit_center::{AuditEvent, AuditKind, AuditSink};
use gatehouse_core_types::{ActionType, ActorId, ActorKind, Clock, DecisionId, ReasonCode};
use gatehouse_identity_center::{IdentityError, IdentityManager};
use gatehouse_policy_center::{PolicyCenter, PolicyError, PolicyResolution};
use gatehouse_rate_limiter::{QuotaSpec, RateLimitError, RateLimiter};

use crate::errors::EvalError;
use crate::metrics;
use crate::model::{EvalContext, PermissionDecision};

/// The permission evaluation pipeline. Check order is fixed: actor
/// resolution (with lazy expiry), tenant suspension (absolute override),
/// tier membership plus tenant override, delegated scope for agents, and
/// finally the atomic rate-limit charge. Every decision is written to the
/// audit sink before it is returned; an allow whose audit write fails is
/// degraded to an infrastructure denial and its charge refunded.
pub struct PermissionEvaluator {
    identity: Arc<IdentityManager>,
    policy: Arc<dyn PolicyCenter>,
    limiter: Arc<RateLimiter>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
}

impl PermissionEvaluator {
    pub fn new(
        identity: Arc<IdentityManager>,
        policy: Arc<dyn PolicyCenter>,
        limiter: Arc<RateLimiter>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Arc::new(Self {
            identity,
            policy,
            limiter,
            audit,
            clock,
        })
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub async fn evaluate(
        &self,
        actor_id: &ActorId,
        action: ActionType,
        ctx: &EvalContext,
    ) -> PermissionDecision {
        let (mut decision, charged) = self.decide(actor_id, action, ctx).await;

        if let Err(err) = self.audit.append(decision_event(&decision)).await {
            warn!(target: "evaluator", %err, "audit append failed; failing decision closed");
            metrics::record_infra_failure();
            if let Some(quota) = charged {
                self.limiter.refund(actor_id, &quota, decision.decided_at);
            }
            decision.reason = ReasonCode::InfrastructureUnavailable;
            decision.remaining_window = None;
            decision.remaining_burst = None;
            // Best effort: the sink is already failing, but try to leave a
            // trace of the degraded denial.
            let _ = self.audit.append(decision_event(&decision)).await;
        }

        match decision.reason {
            ReasonCode::Allowed => metrics::record_allowed(),
            ReasonCode::RateLimitExceeded => {
                metrics::record_rate_limited();
                metrics::record_denied();
            }
            _ => metrics::record_denied(),
        }
        decision
    }

    /// `evaluate` and surface denials as taxonomy errors.
    pub async fn evaluate_strict(
        &self,
        actor_id: &ActorId,
        action: ActionType,
        ctx: &EvalContext,
    ) -> Result<PermissionDecision, EvalError> {
        self.evaluate(actor_id, action, ctx).await.ensure_allowed()
    }

    /// Runs the check pipeline. The second element carries the quota spec
    /// when (and only when) the rate bucket was charged, so a failed audit
    /// write can refund exactly what was taken.
    async fn decide(
        &self,
        actor_id: &ActorId,
        action: ActionType,
        ctx: &EvalContext,
    ) -> (PermissionDecision, Option<QuotaSpec>) {
        let now = self.clock.now();
        let mut decision = PermissionDecision {
            id: DecisionId::new(),
            actor_id: actor_id.clone(),
            tenant_id: None,
            action,
            resource: ctx.resource.clone(),
            reason: ReasonCode::Allowed,
            tier: None,
            tier_version: None,
            policy_rev: None,
            stale: false,
            remaining_window: None,
            remaining_burst: None,
            retry_after: None,
            decided_at: now,
        };

        // 1. Resolve the actor; expiry is re-checked at decision time.
        let actor = match self.identity.resolve_active(actor_id).await {
            Ok(actor) => actor,
            Err(err) => {
                decision.tenant_id = self.identity.actor(actor_id).map(|a| a.tenant_id);
                decision.reason = match err {
                    IdentityError::UnknownActor(_) => ReasonCode::UnknownActor,
                    IdentityError::ActorRevoked(_) => ReasonCode::ActorRevoked,
                    other => {
                        warn!(target: "evaluator", %other, "actor resolution failed");
                        ReasonCode::InfrastructureUnavailable
                    }
                };
                return (decision, None);
            }
        };
        decision.tenant_id = Some(actor.tenant_id.clone());
        decision.tier = Some(actor.tier);

        // 2. Resolve tenant and tier from the policy cache.
        let resolution: PolicyResolution =
            match self.policy.resolve(&actor.tenant_id, actor.tier).await {
                Ok(resolution) => resolution,
                Err(PolicyError::Unavailable(detail)) => {
                    warn!(target: "evaluator", %detail, "policy cache unavailable; failing closed");
                    decision.reason = ReasonCode::InfrastructureUnavailable;
                    return (decision, None);
                }
                Err(err) => {
                    warn!(target: "evaluator", %err, "policy resolution failed");
                    decision.reason = ReasonCode::InfrastructureUnavailable;
                    return (decision, None);
                }
            };
        decision.tier_version = Some(resolution.tier.version);
        decision.policy_rev = Some(resolution.rev);
        decision.stale = resolution.stale;

        // Tenant suspension precedes every other check.
        if resolution.tenant.is_suspended() {
            decision.reason = ReasonCode::TenantSuspended;
            return (decision, None);
        }

        // 3. Tier membership, minus tenant-disabled actions.
        if !resolution.tier.allows(action)
            || resolution.tenant.action_override(action) == Some(false)
        {
            decision.reason = ReasonCode::ActionNotPermitted;
            return (decision, None);
        }

        // 4. Agents are additionally bounded by their delegated scope; the
        // narrower of tier-allowed and delegated wins.
        if actor.kind == ActorKind::Agent {
            let effective = actor.effective_scope(&resolution.tier.allowed);
            if !effective.contains(&action) {
                decision.reason = ReasonCode::ScopeExceeded;
                return (decision, None);
            }
        }

        // 5/6. Charge-and-decide in one atomic step per actor.
        let quota = QuotaSpec {
            window_quota: resolution.tier.window_quota,
            window_secs: resolution.tier.window_secs,
            burst_quota: resolution.tier.burst_quota,
            burst_secs: resolution.tier.burst_secs,
        };
        let mut charged = None;
        match self.limiter.check_and_charge(actor_id, &quota, now) {
            Ok(receipt) => {
                charged = Some(quota);
                decision.remaining_window = Some(receipt.remaining_window);
                decision.remaining_burst = Some(receipt.remaining_burst);
                debug!(
                    target: "evaluator",
                    actor = %actor_id,
                    action = %action,
                    remaining = receipt.remaining_window,
                    "action allowed"
                );
            }
            Err(RateLimitError::Exceeded { retry_after, scope }) => {
                decision.reason = ReasonCode::RateLimitExceeded;
                decision.retry_after = Some(retry_after);
                debug!(
                    target: "evaluator",
                    actor = %actor_id,
                    action = %action,
                    ?scope,
                    "rate limit exceeded"
                );
            }
        }
        (decision, charged)
    }

}

fn decision_event(decision: &PermissionDecision) -> AuditEvent {
    let kind = if decision.allowed() {
        AuditKind::DecisionAllowed
    } else {
        AuditKind::DecisionDenied
    };
    let mut event = AuditEvent::new(kind, decision.decided_at)
        .actor(decision.actor_id.clone())
        .decision(decision.id.clone())
        .detail(serde_json::to_value(decision).unwrap_or(serde_json::Value::Null));
    if let Some(tenant) = &decision.tenant_id {
        event = event.tenant(tenant.clone());
    }
    event
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use gatehouse_audit_center::{AuditError, AuditFilter, InMemoryAuditCenter};
    use gatehouse_core_types::{ManualClock, TenantId, TierLevel};
    use gatehouse_identity_center::{IdentityConfig, IdentityManager};
    use gatehouse_policy_center::{
        default_snapshot, CachedPolicyCenter, InMemoryPolicyBackend, RuntimeOverrideSpec, Tenant,
        TenantStatus,
    };

    struct Fixture {
        evaluator: Arc<PermissionEvaluator>,
        identity: Arc<IdentityManager>,
        policy: Arc<CachedPolicyCenter>,
        audit: Arc<InMemoryAuditCenter>,
        clock: Arc<ManualClock>,
        tenant: TenantId,
    }

    async fn fixture() -> Fixture {
        fixture_with_sink(None).await
    }

    async fn fixture_with_sink(sink: Option<Arc<dyn AuditSink>>) -> Fixture {
        let clock = ManualClock::starting_now();
        let policy =
            CachedPolicyCenter::bootstrap(InMemoryPolicyBackend::new(), default_snapshot()).await;
        let tenant = Tenant::new("acme", TierLevel::Standard);
        let tenant_id = tenant.id.clone();
        policy.upsert_tenant(tenant).await.unwrap();

        let audit = InMemoryAuditCenter::new(4096);
        let sink: Arc<dyn AuditSink> = match sink {
            Some(sink) => sink,
            None => audit.clone(),
        };
        let identity = IdentityManager::new(
            policy.clone(),
            sink.clone(),
            IdentityConfig::default(),
            clock.clone(),
        );
        let evaluator = PermissionEvaluator::new(
            identity.clone(),
            policy.clone(),
            Arc::new(RateLimiter::new()),
            sink,
            clock.clone(),
        );
        Fixture {
            evaluator,
            identity,
            policy,
            audit,
            clock,
            tenant: tenant_id,
        }
    }

    struct FlakySink {
        inner: Arc<InMemoryAuditCenter>,
        failing: AtomicBool,
    }

    #[async_trait]
    impl AuditSink for FlakySink {
        async fn append(&self, event: AuditEvent) -> Result<(), AuditError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(AuditError::Unavailable("sink offline".into()));
            }
            self.inner.append(event).await
        }

        async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEvent>, AuditError> {
            self.inner.query(filter).await
        }
    }

    #[tokio::test]
    async fn tier_membership_bounds_every_action() {
        let fx = fixture().await;
        let snapshot = fx.policy.snapshot().await.unwrap();
        for level in TierLevel::ALL {
            let allowed = snapshot.tier_current(level).unwrap().allowed.clone();
            let (actor, _) = fx
                .identity
                .issue_human_identity(fx.tenant.clone(), level)
                .await
                .unwrap();
            for action in ActionType::ALL {
                let decision = fx
                    .evaluator
                    .evaluate(&actor.id, action, &EvalContext::default())
                    .await;
                assert_eq!(
                    decision.allowed(),
                    allowed.contains(&action),
                    "tier {level} action {action}"
                );
                if !allowed.contains(&action) {
                    assert_eq!(decision.reason, ReasonCode::ActionNotPermitted);
                }
            }
        }
    }

    #[tokio::test]
    async fn suspended_tenant_overrides_every_other_reason() {
        let fx = fixture().await;
        let (actor, _) = fx
            .identity
            .issue_human_identity(fx.tenant.clone(), TierLevel::Trial)
            .await
            .unwrap();
        fx.policy
            .set_tenant_status(&fx.tenant, TenantStatus::Suspended)
            .await
            .unwrap();

        // Even an action the tier does not allow reports suspension first.
        let decision = fx
            .evaluator
            .evaluate(&actor.id, ActionType::PortalScrape, &EvalContext::default())
            .await;
        assert_eq!(decision.reason, ReasonCode::TenantSuspended);
    }

    #[tokio::test]
    async fn agent_is_bounded_by_delegated_scope() {
        let fx = fixture().await;
        let (human, _) = fx
            .identity
            .issue_human_identity(fx.tenant.clone(), TierLevel::Professional)
            .await
            .unwrap();
        let (agent, _) = fx
            .identity
            .issue_agent_identity(
                &human.id,
                [ActionType::CodeReview].into_iter().collect(),
                Some(Duration::from_secs(3600)),
            )
            .await
            .unwrap();

        let allowed = fx
            .evaluator
            .evaluate(&agent.id, ActionType::CodeReview, &EvalContext::default())
            .await;
        assert!(allowed.allowed());

        // Tier-allowed but outside the delegated scope.
        let denied = fx
            .evaluator
            .evaluate(&agent.id, ActionType::ChatReply, &EvalContext::default())
            .await;
        assert_eq!(denied.reason, ReasonCode::ScopeExceeded);
    }

    #[tokio::test]
    async fn quota_exhausts_then_resets_with_window() {
        let fx = fixture().await;
        fx.policy
            .apply_override(RuntimeOverrideSpec {
                path: "tier.trial.window_quota".into(),
                value: serde_json::json!(3),
                owner: "test".into(),
                reason: "quota test".into(),
                ttl_seconds: 0,
            })
            .await
            .unwrap();
        fx.policy
            .apply_override(RuntimeOverrideSpec {
                path: "tier.trial.burst_quota".into(),
                value: serde_json::json!(100),
                owner: "test".into(),
                reason: "quota test".into(),
                ttl_seconds: 0,
            })
            .await
            .unwrap();
        let (actor, _) = fx
            .identity
            .issue_human_identity(fx.tenant.clone(), TierLevel::Trial)
            .await
            .unwrap();

        for _ in 0..3 {
            let decision = fx
                .evaluator
                .evaluate(&actor.id, ActionType::ChatReply, &EvalContext::default())
                .await;
            assert!(decision.allowed());
        }
        let denied = fx
            .evaluator
            .evaluate(&actor.id, ActionType::ChatReply, &EvalContext::default())
            .await;
        assert_eq!(denied.reason, ReasonCode::RateLimitExceeded);
        assert!(denied.retry_after.is_some());

        fx.clock.advance(Duration::from_secs(86_401));
        let fresh = fx
            .evaluator
            .evaluate(&actor.id, ActionType::ChatReply, &EvalContext::default())
            .await;
        assert!(fresh.allowed());
    }

    #[tokio::test]
    async fn unknown_actor_is_reported_as_such() {
        let fx = fixture().await;
        let decision = fx
            .evaluator
            .evaluate(&ActorId::new(), ActionType::ChatReply, &EvalContext::default())
            .await;
        assert_eq!(decision.reason, ReasonCode::UnknownActor);
        assert!(matches!(
            decision.ensure_allowed().unwrap_err(),
            EvalError::UnknownActor(_)
        ));
    }

    #[tokio::test]
    async fn every_decision_lands_in_the_audit_log() {
        let fx = fixture().await;
        let (actor, _) = fx
            .identity
            .issue_human_identity(fx.tenant.clone(), TierLevel::Trial)
            .await
            .unwrap();
        fx.evaluator
            .evaluate(&actor.id, ActionType::ChatReply, &EvalContext::default())
            .await;
        fx.evaluator
            .evaluate(&actor.id, ActionType::CodeReview, &EvalContext::default())
            .await;

        let decisions = fx
            .audit
            .query(&AuditFilter {
                kinds: Some(vec![AuditKind::DecisionAllowed, AuditKind::DecisionDenied]),
                ..AuditFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(decisions.len(), 2);
    }

    #[tokio::test]
    async fn lost_audit_write_fails_closed_and_refunds_the_charge() {
        let inner = InMemoryAuditCenter::new(64);
        let sink = Arc::new(FlakySink {
            inner: inner.clone(),
            failing: AtomicBool::new(false),
        });
        let dyn_sink: Arc<dyn AuditSink> = sink.clone();
        let fx = fixture_with_sink(Some(dyn_sink)).await;
        fx.policy
            .apply_override(RuntimeOverrideSpec {
                path: "tier.trial.window_quota".into(),
                value: serde_json::json!(1),
                owner: "test".into(),
                reason: "refund test".into(),
                ttl_seconds: 0,
            })
            .await
            .unwrap();
        let (actor, _) = fx
            .identity
            .issue_human_identity(fx.tenant.clone(), TierLevel::Trial)
            .await
            .unwrap();

        sink.failing.store(true, Ordering::SeqCst);
        let degraded = fx
            .evaluator
            .evaluate(&actor.id, ActionType::ChatReply, &EvalContext::default())
            .await;
        assert_eq!(degraded.reason, ReasonCode::InfrastructureUnavailable);

        // The refunded charge leaves the full quota for the next call.
        sink.failing.store(false, Ordering::SeqCst);
        let allowed = fx
            .evaluator
            .evaluate(&actor.id, ActionType::ChatReply, &EvalContext::default())
            .await;
        assert!(allowed.allowed());
    }
}
