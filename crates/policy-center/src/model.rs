use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use gatehouse_core_types::{ActionType, TenantId, TierLevel};

/// One published version of a tier. Definitions are immutable once
/// published; administrative updates append a new version, and evaluations
/// resolve the version current at decision time.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TierDefinition {
    pub level: TierLevel,
    pub version: u64,
    pub allowed: HashSet<ActionType>,
    /// Primary quota over the long fixed window.
    pub window_quota: u32,
    pub window_secs: u64,
    /// Secondary quota over the short burst window.
    pub burst_quota: u32,
    pub burst_secs: u64,
    /// Default concurrency cap for workers executing on behalf of this tier.
    pub worker_concurrency: usize,
    pub task_timeout_ms: u64,
    pub max_attempts: u8,
}

impl TierDefinition {
    pub fn allows(&self, action: ActionType) -> bool {
        self.allowed.contains(&action)
    }
}

/// Administrative input for publishing a new tier version; the center
/// assigns the version number.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TierDraft {
    pub level: TierLevel,
    pub allowed: HashSet<ActionType>,
    pub window_quota: u32,
    pub window_secs: u64,
    pub burst_quota: u32,
    pub burst_secs: u64,
    pub worker_concurrency: usize,
    pub task_timeout_ms: u64,
    pub max_attempts: u8,
}

impl TierDraft {
    pub fn into_definition(self, version: u64) -> TierDefinition {
        TierDefinition {
            level: self.level,
            version,
            allowed: self.allowed,
            window_quota: self.window_quota,
            window_secs: self.window_secs,
            burst_quota: self.burst_quota,
            burst_secs: self.burst_secs,
            worker_concurrency: self.worker_concurrency,
            task_timeout_ms: self.task_timeout_ms,
            max_attempts: self.max_attempts,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    Active,
    Suspended,
}

/// Isolation boundary. Suspension is absolute: a suspended tenant rejects
/// every evaluation regardless of tier or scope.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
    pub default_tier: TierLevel,
    /// Per-action feature switches; `false` disables an action the tier
    /// would otherwise allow.
    #[serde(default)]
    pub overrides: HashMap<ActionType, bool>,
    pub status: TenantStatus,
    pub created_at: DateTime<Utc>,
}

impl Tenant {
    pub fn new(name: impl Into<String>, default_tier: TierLevel) -> Self {
        Self {
            id: TenantId::new(),
            name: name.into(),
            default_tier,
            overrides: HashMap::new(),
            status: TenantStatus::Active,
            created_at: Utc::now(),
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.status == TenantStatus::Suspended
    }

    pub fn action_override(&self, action: ActionType) -> Option<bool> {
        self.overrides.get(&action).copied()
    }
}

/// Full policy state at one revision.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PolicySnapshot {
    pub rev: u64,
    /// Version history per tier level, ascending by version.
    pub tiers: HashMap<TierLevel, Vec<TierDefinition>>,
    pub tenants: HashMap<TenantId, Tenant>,
}

impl PolicySnapshot {
    pub fn tier_current(&self, level: TierLevel) -> Option<&TierDefinition> {
        self.tiers.get(&level).and_then(|versions| versions.last())
    }

    pub fn tier_version(&self, level: TierLevel, version: u64) -> Option<&TierDefinition> {
        self.tiers
            .get(&level)
            .and_then(|versions| versions.iter().find(|def| def.version == version))
    }

    pub fn push_tier(&mut self, definition: TierDefinition) {
        let versions = self.tiers.entry(definition.level).or_default();
        versions.push(definition);
        versions.sort_by_key(|def| def.version);
    }

    pub fn tenant(&self, id: &TenantId) -> Option<&Tenant> {
        self.tenants.get(id)
    }
}

/// What the evaluator consumes for one decision: the tenant, the tier
/// version current at this revision, and whether the cache was stale.
#[derive(Clone, Debug)]
pub struct PolicyResolution {
    pub rev: u64,
    pub stale: bool,
    pub tenant: Tenant,
    pub tier: TierDefinition,
}

/// TTL'd runtime adjustment applied on top of the durable snapshot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RuntimeOverrideSpec {
    pub path: String,
    pub value: serde_json::Value,
    pub owner: String,
    pub reason: String,
    pub ttl_seconds: u64,
}
