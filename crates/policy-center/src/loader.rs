use std::collections::BTreeMap;
use std::env;
use std::path::Path;

use serde_json::Value;

use crate::api::apply_override_to_snapshot;
use crate::defaults::default_snapshot;
use crate::errors::PolicyError;
use crate::model::PolicySnapshot;

const ENV_PREFIX: &str = "GATEHOUSE_POLICY__";

/// Build the initial snapshot: built-in tier defaults overlaid by an
/// optional YAML file (flat map of policy path to value) and by
/// `GATEHOUSE_POLICY__…` environment variables.
pub fn load_snapshot(path: Option<&Path>) -> Result<PolicySnapshot, PolicyError> {
    let mut snapshot = default_snapshot();

    if let Some(path) = path {
        if path.exists() {
            for (key, value) in overlays_from_file(path)? {
                apply_override_to_snapshot(&mut snapshot, &key, &value)?;
            }
        }
    }

    for (key, value) in overlays_from_env() {
        apply_override_to_snapshot(&mut snapshot, &key, &value)?;
    }

    Ok(snapshot)
}

fn overlays_from_file(path: &Path) -> Result<Vec<(String, Value)>, PolicyError> {
    let raw = std::fs::read_to_string(path).map_err(|err| PolicyError::Io(err.to_string()))?;
    let parsed: BTreeMap<String, serde_yaml::Value> =
        serde_yaml::from_str(&raw).map_err(|err| PolicyError::InvalidValue(err.to_string()))?;
    parsed
        .into_iter()
        .map(|(key, value)| {
            serde_json::to_value(value)
                .map(|json| (key, json))
                .map_err(|err| PolicyError::InvalidValue(err.to_string()))
        })
        .collect()
}

fn overlays_from_env() -> Vec<(String, Value)> {
    let mut overlays = Vec::new();
    for (key, raw) in env::vars() {
        let Some(suffix) = key.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        let path = suffix.to_ascii_lowercase().replace("__", ".");
        let value = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
        overlays.push((path, value));
    }
    overlays.sort_by(|a, b| a.0.cmp(&b.0));
    overlays
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatehouse_core_types::TierLevel;
    use std::io::Write;

    #[test]
    fn defaults_load_without_overlays() {
        let snapshot = load_snapshot(None).unwrap();
        assert_eq!(snapshot.tiers.len(), 5);
        assert_eq!(snapshot.tier_current(TierLevel::Trial).unwrap().version, 1);
    }

    #[test]
    fn file_overlay_adjusts_tier_quota() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "tier.trial.window_quota: 75").unwrap();
        let snapshot = load_snapshot(Some(file.path())).unwrap();
        assert_eq!(
            snapshot.tier_current(TierLevel::Trial).unwrap().window_quota,
            75
        );
    }

    #[test]
    fn unknown_path_in_file_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "tier.trial.nope: 75").unwrap();
        assert!(matches!(
            load_snapshot(Some(file.path())),
            Err(PolicyError::UnsupportedPath(_))
        ));
    }
}
