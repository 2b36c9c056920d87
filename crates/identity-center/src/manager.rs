use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::json;
use tracing::warn;

use gatehouse_audit_center::{AuditEvent, AuditKind, AuditSink};
use gatehouse_core_types::{ActionType, ActorId, Clock, TenantId, TierLevel};
use gatehouse_policy_center::PolicyCenter;
use gatehouse_state_store::{RecordKind, StateStore};

use crate::config::IdentityConfig;
use crate::errors::IdentityError;
use crate::model::{Actor, ActorStatus, Credential};

/// Issues, rotates, revokes, and resolves actor identities. Revocation and
/// expiry are terminal; expiry is re-checked lazily on every resolve so an
/// evaluation can never ride a cached-but-expired identity.
pub struct IdentityManager {
    actors: DashMap<ActorId, Arc<RwLock<Actor>>>,
    credentials: DashMap<ActorId, Arc<RwLock<Vec<Credential>>>>,
    policy: Arc<dyn PolicyCenter>,
    audit: Arc<dyn AuditSink>,
    store: Option<Arc<StateStore>>,
    config: IdentityConfig,
    clock: Arc<dyn Clock>,
}

impl IdentityManager {
    pub fn new(
        policy: Arc<dyn PolicyCenter>,
        audit: Arc<dyn AuditSink>,
        config: IdentityConfig,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Arc::new(Self {
            actors: DashMap::new(),
            credentials: DashMap::new(),
            policy,
            audit,
            store: None,
            config,
            clock,
        })
    }

    pub fn with_store(
        policy: Arc<dyn PolicyCenter>,
        audit: Arc<dyn AuditSink>,
        config: IdentityConfig,
        clock: Arc<dyn Clock>,
        store: Arc<StateStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            actors: DashMap::new(),
            credentials: DashMap::new(),
            policy,
            audit,
            store: Some(store),
            config,
            clock,
        })
    }

    /// Rebuild actors and credentials from the journal; last record per
    /// entity wins.
    pub fn recover(&self) -> Result<(), IdentityError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let actor_records = store
            .replay_kind(RecordKind::Actor)
            .map_err(|err| IdentityError::Store(err.to_string()))?;
        for record in actor_records {
            match serde_json::from_value::<Actor>(record.payload) {
                Ok(actor) => {
                    self.actors
                        .insert(actor.id.clone(), Arc::new(RwLock::new(actor)));
                }
                Err(err) => warn!(target: "identity", %err, "skipping unreadable actor record"),
            }
        }
        let credential_records = store
            .replay_kind(RecordKind::Credential)
            .map_err(|err| IdentityError::Store(err.to_string()))?;
        for record in credential_records {
            match serde_json::from_value::<Credential>(record.payload) {
                Ok(credential) => {
                    let slot = self
                        .credentials
                        .entry(credential.actor_id.clone())
                        .or_insert_with(|| Arc::new(RwLock::new(Vec::new())))
                        .clone();
                    let mut creds = slot.write();
                    if let Some(existing) =
                        creds.iter_mut().find(|cred| cred.id == credential.id)
                    {
                        *existing = credential;
                    } else {
                        creds.push(credential);
                    }
                }
                Err(err) => {
                    warn!(target: "identity", %err, "skipping unreadable credential record")
                }
            }
        }
        Ok(())
    }

    /// Administrative issuance, out of the evaluation hot path.
    pub async fn issue_human_identity(
        &self,
        tenant_id: TenantId,
        tier: TierLevel,
    ) -> Result<(Actor, Credential), IdentityError> {
        let now = self.clock.now();
        let actor = Actor::human(tenant_id, tier, now);
        let credential = self.mint_credential(&actor, now);
        self.admit(actor.clone(), credential.clone(), "human").await;
        Ok((actor, credential))
    }

    /// JIT provisioning of a short-lived agent identity scoped to a task.
    /// Delegated authority never exceeds the delegator's: the requested
    /// scope must be a subset of the origin's effective scope, and the
    /// origin chain is depth-bounded.
    pub async fn issue_agent_identity(
        &self,
        origin_id: &ActorId,
        requested_scope: HashSet<ActionType>,
        ttl: Option<Duration>,
    ) -> Result<(Actor, Credential), IdentityError> {
        let ttl = ttl.ok_or(IdentityError::TtlRequired)?;
        let now = self.clock.now();
        let origin = self.resolve_active(origin_id).await?;

        let depth = origin.delegation_depth + 1;
        if depth > self.config.max_delegation_depth {
            return Err(IdentityError::DelegationDepthExceeded {
                depth,
                max: self.config.max_delegation_depth,
            });
        }

        let tier_allowed = self
            .policy
            .resolve(&origin.tenant_id, origin.tier)
            .await?
            .tier
            .allowed;
        let origin_effective = origin.effective_scope(&tier_allowed);
        let scope = if requested_scope.is_empty() {
            // Inherited wholesale unless explicitly narrowed.
            origin_effective
        } else {
            if !requested_scope.is_subset(&origin_effective) {
                return Err(IdentityError::ScopeExceedsOrigin);
            }
            requested_scope
        };

        let ttl = chrono::Duration::from_std(ttl).map_err(|_| IdentityError::TtlRequired)?;
        let actor = Actor::agent(&origin, scope, now + ttl, now);
        let mut credential = self.mint_credential(&actor, now);
        // An agent credential never outlives the agent itself.
        if let Some(expires_at) = actor.expires_at {
            credential.expires_at = credential.expires_at.min(expires_at);
        }
        self.admit(actor.clone(), credential.clone(), "agent").await;
        Ok((actor, credential))
    }

    /// Issue a replacement credential and schedule the old ones out after
    /// the configured overlap. There is never a gap: the new credential is
    /// active before the old ones stop being so.
    pub async fn rotate_credential(
        &self,
        actor_id: &ActorId,
    ) -> Result<Credential, IdentityError> {
        let now = self.clock.now();
        let actor = self
            .actor(actor_id)
            .ok_or_else(|| IdentityError::UnknownActor(actor_id.clone()))?;
        if actor.is_revoked() {
            return Err(IdentityError::ActorRevoked(actor_id.clone()));
        }

        let replacement = self.mint_credential(&actor, now);
        let overlap = chrono::Duration::from_std(self.config.rotation_overlap)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        let slot = self
            .credentials
            .entry(actor_id.clone())
            .or_insert_with(|| Arc::new(RwLock::new(Vec::new())))
            .clone();
        let retired: Vec<Credential> = {
            let mut creds = slot.write();
            let mut retired = Vec::new();
            for cred in creds.iter_mut() {
                if cred.is_active(now) {
                    cred.revoked_at = Some(now + overlap);
                    retired.push(cred.clone());
                }
            }
            creds.push(replacement.clone());
            retired
        };

        self.persist_credential(&replacement);
        for cred in &retired {
            self.persist_credential(cred);
        }
        self.emit(
            AuditEvent::new(AuditKind::CredentialRotated, now)
                .actor(actor_id.clone())
                .tenant(actor.tenant_id.clone())
                .detail(json!({
                    "new_credential": replacement.id.to_string(),
                    "retired": retired.iter().map(|c| c.id.to_string()).collect::<Vec<_>>(),
                })),
        )
        .await;
        Ok(replacement)
    }

    /// Terminal and idempotent: a revoked actor can never be reactivated;
    /// a new actor must be issued instead.
    pub async fn revoke_identity(
        &self,
        actor_id: &ActorId,
        reason: impl Into<String>,
    ) -> Result<(), IdentityError> {
        let now = self.clock.now();
        let reason = reason.into();
        let entry = self
            .actors
            .get(actor_id)
            .ok_or_else(|| IdentityError::UnknownActor(actor_id.clone()))?;
        let actor_ref = Arc::clone(entry.value());
        drop(entry);

        let (already_revoked, snapshot) = {
            let mut actor = actor_ref.write();
            if actor.is_revoked() {
                (true, actor.clone())
            } else {
                actor.status = ActorStatus::Revoked;
                actor.revoked_reason = Some(reason.clone());
                (false, actor.clone())
            }
        };
        if already_revoked {
            return Ok(());
        }

        let revoked_creds: Vec<Credential> = if let Some(slot) = self.credentials.get(actor_id) {
            let mut creds = slot.write();
            creds
                .iter_mut()
                .filter(|cred| cred.is_active(now))
                .map(|cred| {
                    cred.revoked_at = Some(now);
                    cred.clone()
                })
                .collect()
        } else {
            Vec::new()
        };

        self.persist_actor(&snapshot);
        for cred in &revoked_creds {
            self.persist_credential(cred);
        }
        self.emit(
            AuditEvent::new(AuditKind::IdentityRevoked, now)
                .actor(actor_id.clone())
                .tenant(snapshot.tenant_id.clone())
                .detail(json!({ "reason": reason })),
        )
        .await;
        Ok(())
    }

    /// Revoke every actor whose TTL has passed. Run periodically; the
    /// evaluator additionally re-checks expiry on every resolve.
    pub async fn expire_sweep(&self, now: DateTime<Utc>) -> usize {
        let expired: Vec<ActorId> = self
            .actors
            .iter()
            .filter(|entry| {
                let actor = entry.value().read();
                !actor.is_revoked() && actor.is_expired(now)
            })
            .map(|entry| entry.key().clone())
            .collect();
        let mut revoked = 0;
        for actor_id in expired {
            if self.revoke_identity(&actor_id, "expired").await.is_ok() {
                revoked += 1;
            }
        }
        revoked
    }

    /// Decision-time resolution. Re-checks expiry against the clock even
    /// if the actor was admitted earlier, and requires a live credential.
    pub async fn resolve_active(&self, actor_id: &ActorId) -> Result<Actor, IdentityError> {
        let now = self.clock.now();
        let actor = self
            .actor(actor_id)
            .ok_or_else(|| IdentityError::UnknownActor(actor_id.clone()))?;
        if actor.is_revoked() {
            return Err(IdentityError::ActorRevoked(actor_id.clone()));
        }
        if actor.is_expired(now) {
            // Lazy terminal expiry: flip the status now rather than racing
            // a sweeper.
            let _ = self.revoke_identity(actor_id, "expired").await;
            return Err(IdentityError::ActorRevoked(actor_id.clone()));
        }
        if self.active_credential(actor_id).is_none() {
            return Err(IdentityError::ActorRevoked(actor_id.clone()));
        }
        Ok(actor)
    }

    pub fn actor(&self, actor_id: &ActorId) -> Option<Actor> {
        self.actors
            .get(actor_id)
            .map(|entry| entry.value().read().clone())
    }

    /// The newest credential that is valid right now.
    pub fn active_credential(&self, actor_id: &ActorId) -> Option<Credential> {
        let now = self.clock.now();
        self.credentials.get(actor_id).and_then(|slot| {
            let creds = slot.read();
            creds
                .iter()
                .filter(|cred| cred.is_active(now))
                .max_by_key(|cred| cred.issued_at)
                .cloned()
        })
    }

    pub fn active_credential_count(&self, actor_id: &ActorId) -> usize {
        let now = self.clock.now();
        self.credentials
            .get(actor_id)
            .map(|slot| slot.read().iter().filter(|cred| cred.is_active(now)).count())
            .unwrap_or(0)
    }

    /// Actors whose newest credential has outlived its risk-class rotation
    /// interval.
    pub fn rotation_due(&self, now: DateTime<Utc>) -> Vec<ActorId> {
        self.actors
            .iter()
            .filter_map(|entry| {
                let actor = entry.value().read();
                if actor.is_revoked() {
                    return None;
                }
                let interval = chrono::Duration::from_std(
                    self.config.rotation_interval(actor.risk_class()),
                )
                .ok()?;
                let newest = self.credentials.get(entry.key()).and_then(|slot| {
                    slot.read().iter().map(|cred| cred.issued_at).max()
                })?;
                (now >= newest + interval).then(|| entry.key().clone())
            })
            .collect()
    }

    /// Scheduled rotation pass keyed by risk class.
    pub async fn rotation_sweep(&self) -> usize {
        let now = self.clock.now();
        let due = self.rotation_due(now);
        let mut rotated = 0;
        for actor_id in due {
            match self.rotate_credential(&actor_id).await {
                Ok(_) => rotated += 1,
                Err(err) => warn!(target: "identity", actor = %actor_id, %err, "scheduled rotation failed"),
            }
        }
        rotated
    }

    fn mint_credential(&self, actor: &Actor, now: DateTime<Utc>) -> Credential {
        let lifetime = chrono::Duration::from_std(
            self.config.credential_lifetime(actor.risk_class()),
        )
        .unwrap_or_else(|_| chrono::Duration::hours(48));
        Credential::issue(actor.id.clone(), actor.risk_class(), now, lifetime)
    }

    async fn admit(&self, actor: Actor, credential: Credential, kind: &str) {
        let now = actor.created_at;
        let actor_id = actor.id.clone();
        let tenant_id = actor.tenant_id.clone();
        let origin = actor.origin.clone();
        self.persist_actor(&actor);
        self.persist_credential(&credential);
        self.actors
            .insert(actor_id.clone(), Arc::new(RwLock::new(actor)));
        self.credentials
            .entry(actor_id.clone())
            .or_insert_with(|| Arc::new(RwLock::new(Vec::new())))
            .write()
            .push(credential);
        self.emit(
            AuditEvent::new(AuditKind::IdentityIssued, now)
                .actor(actor_id)
                .tenant(tenant_id)
                .detail(json!({
                    "kind": kind,
                    "origin": origin.map(|id| id.to_string()),
                })),
        )
        .await;
    }

    fn persist_actor(&self, actor: &Actor) {
        if let Some(store) = &self.store {
            if let Err(err) = store.append(RecordKind::Actor, actor) {
                warn!(target: "identity", %err, "actor journal append failed");
            }
        }
    }

    fn persist_credential(&self, credential: &Credential) {
        if let Some(store) = &self.store {
            if let Err(err) = store.append(RecordKind::Credential, credential) {
                warn!(target: "identity", %err, "credential journal append failed");
            }
        }
    }

    async fn emit(&self, event: AuditEvent) {
        if let Err(err) = self.audit.append(event).await {
            warn!(target: "identity", %err, "audit append failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatehouse_audit_center::InMemoryAuditCenter;
    use gatehouse_core_types::{ActorKind, ManualClock};
    use gatehouse_policy_center::{
        default_snapshot, CachedPolicyCenter, InMemoryPolicyBackend,
    };

    async fn manager_with_clock(clock: Arc<ManualClock>) -> Arc<IdentityManager> {
        let policy = CachedPolicyCenter::bootstrap(
            InMemoryPolicyBackend::new(),
            default_snapshot(),
        )
        .await;
        IdentityManager::new(
            policy,
            InMemoryAuditCenter::new(64),
            IdentityConfig::default(),
            clock,
        )
    }

    #[tokio::test]
    async fn agent_scope_must_be_subset_of_origin() {
        let clock = ManualClock::starting_now();
        let manager = manager_with_clock(clock).await;
        let (human, _) = manager
            .issue_human_identity(TenantId::new(), TierLevel::Standard)
            .await
            .unwrap();

        // Standard tier does not allow ledger sync; requesting it must fail.
        let err = manager
            .issue_agent_identity(
                &human.id,
                [ActionType::LedgerSync].into_iter().collect(),
                Some(Duration::from_secs(3600)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, IdentityError::ScopeExceedsOrigin));

        let (agent, _) = manager
            .issue_agent_identity(
                &human.id,
                [ActionType::ChatReply].into_iter().collect(),
                Some(Duration::from_secs(3600)),
            )
            .await
            .unwrap();
        assert_eq!(agent.kind, ActorKind::Agent);
        assert_eq!(agent.origin, Some(human.id));
        assert_eq!(agent.delegation_depth, 1);
    }

    #[tokio::test]
    async fn delegation_chain_is_depth_bounded_and_monotonic() {
        let clock = ManualClock::starting_now();
        let manager = manager_with_clock(clock).await;
        let (human, _) = manager
            .issue_human_identity(TenantId::new(), TierLevel::Enterprise)
            .await
            .unwrap();

        let mut scopes: Vec<HashSet<ActionType>> = Vec::new();
        let mut origin = human.id.clone();
        for _ in 0..4 {
            let (agent, _) = manager
                .issue_agent_identity(
                    &origin,
                    HashSet::new(),
                    Some(Duration::from_secs(3600)),
                )
                .await
                .unwrap();
            scopes.push(agent.scope.clone().unwrap());
            origin = agent.id;
        }
        // Depth 5 exceeds the bound of 4.
        let err = manager
            .issue_agent_identity(&origin, HashSet::new(), Some(Duration::from_secs(3600)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            IdentityError::DelegationDepthExceeded { depth: 5, max: 4 }
        ));
        // Scope never widens along the chain.
        for pair in scopes.windows(2) {
            assert!(pair[1].is_subset(&pair[0]));
        }
    }

    #[tokio::test]
    async fn agent_without_ttl_is_rejected() {
        let clock = ManualClock::starting_now();
        let manager = manager_with_clock(clock).await;
        let (human, _) = manager
            .issue_human_identity(TenantId::new(), TierLevel::Trial)
            .await
            .unwrap();
        let err = manager
            .issue_agent_identity(&human.id, HashSet::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, IdentityError::TtlRequired));
    }

    #[tokio::test]
    async fn rotation_overlaps_briefly_and_never_gaps() {
        let clock = ManualClock::starting_now();
        let manager = manager_with_clock(Arc::clone(&clock)).await;
        let (human, _) = manager
            .issue_human_identity(TenantId::new(), TierLevel::Professional)
            .await
            .unwrap();
        assert_eq!(manager.active_credential_count(&human.id), 1);

        manager.rotate_credential(&human.id).await.unwrap();
        // Inside the overlap window both credentials are valid.
        assert_eq!(manager.active_credential_count(&human.id), 2);
        clock.advance(Duration::from_secs(31));
        // After the overlap exactly one remains.
        assert_eq!(manager.active_credential_count(&human.id), 1);
        assert!(manager.active_credential(&human.id).is_some());
    }

    #[tokio::test]
    async fn expired_agent_resolves_as_revoked() {
        let clock = ManualClock::starting_now();
        let manager = manager_with_clock(Arc::clone(&clock)).await;
        let (human, _) = manager
            .issue_human_identity(TenantId::new(), TierLevel::Standard)
            .await
            .unwrap();
        let (agent, _) = manager
            .issue_agent_identity(
                &human.id,
                [ActionType::ChatReply].into_iter().collect(),
                Some(Duration::from_secs(3600)),
            )
            .await
            .unwrap();

        assert!(manager.resolve_active(&agent.id).await.is_ok());
        clock.advance(Duration::from_secs(61 * 60));
        let err = manager.resolve_active(&agent.id).await.unwrap_err();
        assert!(matches!(err, IdentityError::ActorRevoked(_)));
        // Terminal: the actor stays revoked even for direct lookups.
        assert!(manager.actor(&agent.id).unwrap().is_revoked());
    }

    #[tokio::test]
    async fn revoke_is_idempotent_and_terminal() {
        let clock = ManualClock::starting_now();
        let manager = manager_with_clock(clock).await;
        let (human, _) = manager
            .issue_human_identity(TenantId::new(), TierLevel::Trial)
            .await
            .unwrap();
        manager.revoke_identity(&human.id, "offboarded").await.unwrap();
        manager.revoke_identity(&human.id, "again").await.unwrap();
        let actor = manager.actor(&human.id).unwrap();
        assert!(actor.is_revoked());
        assert_eq!(actor.revoked_reason.as_deref(), Some("offboarded"));
        assert!(matches!(
            manager.resolve_active(&human.id).await.unwrap_err(),
            IdentityError::ActorRevoked(_)
        ));
    }

    #[tokio::test]
    async fn expire_sweep_revokes_lapsed_actors() {
        let clock = ManualClock::starting_now();
        let manager = manager_with_clock(Arc::clone(&clock)).await;
        let (human, _) = manager
            .issue_human_identity(TenantId::new(), TierLevel::Standard)
            .await
            .unwrap();
        manager
            .issue_agent_identity(
                &human.id,
                HashSet::new(),
                Some(Duration::from_secs(60)),
            )
            .await
            .unwrap();

        clock.advance(Duration::from_secs(120));
        let revoked = manager.expire_sweep(clock.now()).await;
        assert_eq!(revoked, 1);
    }

    #[tokio::test]
    async fn state_survives_journal_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.jsonl");
        let clock = ManualClock::starting_now();
        let policy = CachedPolicyCenter::bootstrap(
            InMemoryPolicyBackend::new(),
            default_snapshot(),
        )
        .await;
        let store = Arc::new(StateStore::open(&path).unwrap());

        let human_id = {
            let manager = IdentityManager::with_store(
                Arc::clone(&policy) as Arc<dyn PolicyCenter>,
                InMemoryAuditCenter::new(16),
                IdentityConfig::default(),
                Arc::clone(&clock) as Arc<dyn Clock>,
                Arc::clone(&store),
            );
            let (human, _) = manager
                .issue_human_identity(TenantId::new(), TierLevel::Starter)
                .await
                .unwrap();
            human.id
        };

        let manager = IdentityManager::with_store(
            policy,
            InMemoryAuditCenter::new(16),
            IdentityConfig::default(),
            clock,
            store,
        );
        manager.recover().unwrap();
        assert!(manager.resolve_active(&human_id).await.is_ok());
    }
}
