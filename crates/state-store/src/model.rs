use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Category of a journaled record. Each owning component serializes its own
/// payload and folds records of its kinds back during replay.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Tenant,
    TierVersion,
    PolicySnapshot,
    Actor,
    Credential,
    Task,
}

/// One line of the journal: a typed envelope around a component-owned
/// payload. Last write wins per entity id inside the payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StateRecord {
    pub seq: u64,
    pub recorded_at: DateTime<Utc>,
    pub kind: RecordKind,
    pub payload: serde_json::Value,
}
