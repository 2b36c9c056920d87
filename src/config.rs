use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use gatehouse_identity_center::IdentityConfig;
use gatehouse_orchestrator::OrchestratorConfig;

/// Engine configuration, loaded from a YAML file with a couple of
/// environment escape hatches. Everything has a default so `gatehouse
/// demo` runs with no file at all.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root for durable state (journal + audit segments). `None` keeps
    /// everything in memory.
    pub data_dir: Option<PathBuf>,
    /// Optional policy overlay file (flat path -> value map).
    pub policy_file: Option<PathBuf>,
    pub register_default_roles: bool,
    pub maintenance_interval_secs: u64,
    pub audit: AuditSettings,
    pub scheduler: SchedulerSettings,
    pub identity: IdentitySettings,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct AuditSettings {
    pub rotate_bytes: u64,
    pub compress_rotated: bool,
    pub ring_capacity: usize,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub tick_ms: u64,
    pub retry_backoff_ms: u64,
    pub memory_top_k: usize,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct IdentitySettings {
    pub max_delegation_depth: u8,
    pub rotation_overlap_secs: u64,
    pub rotation_interval_high_secs: u64,
    pub rotation_interval_standard_secs: u64,
    pub rotation_interval_low_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            policy_file: None,
            register_default_roles: true,
            maintenance_interval_secs: 60,
            audit: AuditSettings::default(),
            scheduler: SchedulerSettings::default(),
            identity: IdentitySettings::default(),
        }
    }
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            rotate_bytes: 64 * 1024 * 1024,
            compress_rotated: false,
            ring_capacity: 4096,
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_ms: 500,
            retry_backoff_ms: 300,
            memory_top_k: 5,
        }
    }
}

impl Default for IdentitySettings {
    fn default() -> Self {
        let defaults = IdentityConfig::default();
        Self {
            max_delegation_depth: defaults.max_delegation_depth,
            rotation_overlap_secs: defaults.rotation_overlap.as_secs(),
            rotation_interval_high_secs: defaults.rotation_interval_high.as_secs(),
            rotation_interval_standard_secs: defaults.rotation_interval_standard.as_secs(),
            rotation_interval_low_secs: defaults.rotation_interval_low.as_secs(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                serde_yaml::from_str(&raw)
                    .with_context(|| format!("parsing config {}", path.display()))?
            }
            None => Self::default(),
        };
        if let Ok(dir) = std::env::var("GATEHOUSE_DATA_DIR") {
            config.data_dir = Some(PathBuf::from(dir));
        }
        if let Ok(file) = std::env::var("GATEHOUSE_POLICY_FILE") {
            config.policy_file = Some(PathBuf::from(file));
        }
        Ok(config)
    }

    pub fn identity_config(&self) -> IdentityConfig {
        IdentityConfig {
            max_delegation_depth: self.identity.max_delegation_depth,
            rotation_overlap: Duration::from_secs(self.identity.rotation_overlap_secs),
            rotation_interval_high: Duration::from_secs(self.identity.rotation_interval_high_secs),
            rotation_interval_standard: Duration::from_secs(
                self.identity.rotation_interval_standard_secs,
            ),
            rotation_interval_low: Duration::from_secs(self.identity.rotation_interval_low_secs),
            ..IdentityConfig::default()
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            tick: Duration::from_millis(self.scheduler.tick_ms.max(10)),
            retry_backoff: Duration::from_millis(self.scheduler.retry_backoff_ms),
            memory_top_k: self.scheduler.memory_top_k,
        }
    }
}
