use std::time::Duration;

use crate::model::RiskClass;

/// Tunables for identity issuance and credential rotation. The defaults
/// are the documented engine constants; operators override them through
/// the engine configuration file.
#[derive(Clone, Debug)]
pub struct IdentityConfig {
    /// Longest permitted chain of agent origin references.
    pub max_delegation_depth: u8,
    /// How long an old credential stays valid after rotation issues its
    /// replacement. Bounds the brief-overlap invariant.
    pub rotation_overlap: Duration,
    pub rotation_interval_high: Duration,
    pub rotation_interval_standard: Duration,
    pub rotation_interval_low: Duration,
    /// Credential lifetime as a multiple of its rotation interval, so a
    /// missed rotation does not instantly strand the actor.
    pub credential_lifetime_factor: u32,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            max_delegation_depth: 4,
            rotation_overlap: Duration::from_secs(30),
            rotation_interval_high: Duration::from_secs(6 * 3600),
            rotation_interval_standard: Duration::from_secs(24 * 3600),
            rotation_interval_low: Duration::from_secs(72 * 3600),
            credential_lifetime_factor: 2,
        }
    }
}

impl IdentityConfig {
    pub fn rotation_interval(&self, risk: RiskClass) -> Duration {
        match risk {
            RiskClass::High => self.rotation_interval_high,
            RiskClass::Standard => self.rotation_interval_standard,
            RiskClass::Low => self.rotation_interval_low,
        }
    }

    pub fn credential_lifetime(&self, risk: RiskClass) -> Duration {
        self.rotation_interval(risk) * self.credential_lifetime_factor.max(1)
    }
}
