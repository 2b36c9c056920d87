use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use gatehouse_core_types::{ActionType, ActorId, ActorKind, CredentialId, TenantId, TierLevel};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorStatus {
    Active,
    Revoked,
}

/// Rotation cadence bucket. Higher-privilege tiers rotate more often.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskClass {
    Low,
    Standard,
    High,
}

impl RiskClass {
    pub fn for_tier(tier: TierLevel) -> Self {
        match tier {
            TierLevel::Trial => RiskClass::Low,
            TierLevel::Starter | TierLevel::Standard => RiskClass::Standard,
            TierLevel::Professional | TierLevel::Enterprise => RiskClass::High,
        }
    }
}

/// A human or agent identity. Agents always carry an origin reference and
/// a delegated scope; revocation and expiry are terminal.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Actor {
    pub id: ActorId,
    pub tenant_id: TenantId,
    pub kind: ActorKind,
    pub tier: TierLevel,
    pub status: ActorStatus,
    /// The actor that caused this one's creation; always set for agents.
    pub origin: Option<ActorId>,
    /// Delegated action set for agents; `None` means bounded by tier only
    /// (humans).
    pub scope: Option<HashSet<ActionType>>,
    pub delegation_depth: u8,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub revoked_reason: Option<String>,
}

impl Actor {
    pub fn human(tenant_id: TenantId, tier: TierLevel, now: DateTime<Utc>) -> Self {
        Self {
            id: ActorId::new(),
            tenant_id,
            kind: ActorKind::Human,
            tier,
            status: ActorStatus::Active,
            origin: None,
            scope: None,
            delegation_depth: 0,
            expires_at: None,
            created_at: now,
            revoked_reason: None,
        }
    }

    pub fn agent(
        origin: &Actor,
        scope: HashSet<ActionType>,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ActorId::new(),
            tenant_id: origin.tenant_id.clone(),
            kind: ActorKind::Agent,
            tier: origin.tier,
            status: ActorStatus::Active,
            origin: Some(origin.id.clone()),
            scope: Some(scope),
            delegation_depth: origin.delegation_depth + 1,
            expires_at: Some(expires_at),
            created_at: now,
            revoked_reason: None,
        }
    }

    pub fn is_revoked(&self) -> bool {
        self.status == ActorStatus::Revoked
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }

    pub fn risk_class(&self) -> RiskClass {
        RiskClass::for_tier(self.tier)
    }

    /// The narrower of the tier-allowed set and the delegated scope. This
    /// is what the evaluator checks actions against.
    pub fn effective_scope(&self, tier_allowed: &HashSet<ActionType>) -> HashSet<ActionType> {
        match &self.scope {
            Some(scope) => scope.intersection(tier_allowed).copied().collect(),
            None => tier_allowed.clone(),
        }
    }
}

/// A secret bound to exactly one actor. `revoked_at` in the future means
/// the credential is inside the rotation-overlap window and still valid.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Credential {
    pub id: CredentialId,
    pub actor_id: ActorId,
    pub secret: String,
    pub risk_class: RiskClass,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn issue(
        actor_id: ActorId,
        risk_class: RiskClass,
        now: DateTime<Utc>,
        lifetime: chrono::Duration,
    ) -> Self {
        Self {
            id: CredentialId::new(),
            actor_id,
            secret: format!("ghc_{}", Uuid::new_v4().simple()),
            risk_class,
            issued_at: now,
            expires_at: now + lifetime,
            revoked_at: None,
        }
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        if self.expires_at <= now {
            return false;
        }
        match self.revoked_at {
            Some(at) => at > now,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_scope_is_intersection_for_agents() {
        let now = Utc::now();
        let human = Actor::human(TenantId::new(), TierLevel::Standard, now);
        let agent = Actor::agent(
            &human,
            [ActionType::CodeReview, ActionType::ChatReply]
                .into_iter()
                .collect(),
            now + chrono::Duration::hours(1),
            now,
        );
        let tier_allowed: HashSet<ActionType> =
            [ActionType::ChatReply, ActionType::DocumentDraft]
                .into_iter()
                .collect();

        let effective = agent.effective_scope(&tier_allowed);
        assert_eq!(effective.len(), 1);
        assert!(effective.contains(&ActionType::ChatReply));
        // Humans fall back to the full tier set.
        assert_eq!(human.effective_scope(&tier_allowed), tier_allowed);
    }

    #[test]
    fn credential_overlap_window_keeps_it_active() {
        let now = Utc::now();
        let mut credential = Credential::issue(
            ActorId::new(),
            RiskClass::Standard,
            now,
            chrono::Duration::hours(48),
        );
        credential.revoked_at = Some(now + chrono::Duration::seconds(30));
        assert!(credential.is_active(now));
        assert!(credential.is_active(now + chrono::Duration::seconds(29)));
        assert!(!credential.is_active(now + chrono::Duration::seconds(30)));
    }
}
