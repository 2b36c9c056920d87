use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use gatehouse_state_store::{RecordKind, StateStore};

use crate::errors::PolicyError;
use crate::model::PolicySnapshot;

/// Durable side of the policy store. The cached center reads through this
/// once at bootstrap and writes through it on every administrative change.
#[async_trait]
pub trait PolicyBackend: Send + Sync {
    async fn load(&self) -> Result<Option<PolicySnapshot>, PolicyError>;
    async fn persist(&self, snapshot: &PolicySnapshot) -> Result<(), PolicyError>;
}

/// Backend over the shared state journal: the latest persisted snapshot
/// wins on load.
pub struct JournalPolicyBackend {
    store: Arc<StateStore>,
}

impl JournalPolicyBackend {
    pub fn new(store: Arc<StateStore>) -> Arc<Self> {
        Arc::new(Self { store })
    }
}

#[async_trait]
impl PolicyBackend for JournalPolicyBackend {
    async fn load(&self) -> Result<Option<PolicySnapshot>, PolicyError> {
        let records = self
            .store
            .replay_kind(RecordKind::PolicySnapshot)
            .map_err(|err| PolicyError::Io(err.to_string()))?;
        match records.last() {
            Some(record) => serde_json::from_value(record.payload.clone())
                .map(Some)
                .map_err(|err| PolicyError::InvalidValue(err.to_string())),
            None => Ok(None),
        }
    }

    async fn persist(&self, snapshot: &PolicySnapshot) -> Result<(), PolicyError> {
        self.store
            .append(RecordKind::PolicySnapshot, snapshot)
            .map(|_| ())
            .map_err(|err| PolicyError::Persist(err.to_string()))
    }
}

/// Test/bring-up backend; `set_failing(true)` simulates an unreachable
/// durable store so the stale-cache and fail-closed paths can be exercised.
#[derive(Default)]
pub struct InMemoryPolicyBackend {
    slot: Mutex<Option<PolicySnapshot>>,
    failing: AtomicBool,
}

impl InMemoryPolicyBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_snapshot(snapshot: PolicySnapshot) -> Arc<Self> {
        let backend = Self::default();
        *backend.slot.lock() = Some(snapshot);
        Arc::new(backend)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), PolicyError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(PolicyError::Unavailable("backend offline".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PolicyBackend for InMemoryPolicyBackend {
    async fn load(&self) -> Result<Option<PolicySnapshot>, PolicyError> {
        self.check()?;
        Ok(self.slot.lock().clone())
    }

    async fn persist(&self, snapshot: &PolicySnapshot) -> Result<(), PolicyError> {
        self.check()?;
        *self.slot.lock() = Some(snapshot.clone());
        Ok(())
    }
}
