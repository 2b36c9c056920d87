use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tokio::time::sleep;
use tracing::warn;

use gatehouse_core_types::{ActionType, TenantId, TierLevel};

use crate::backend::PolicyBackend;
use crate::errors::PolicyError;
use crate::model::{
    PolicyResolution, PolicySnapshot, RuntimeOverrideSpec, Tenant, TenantStatus, TierDraft,
};
use crate::override_store::RuntimeOverrideStore;

/// Read-heavy policy surface. `resolve` serves evaluations from the
/// in-memory cache and never touches the durable backend on the hot path.
#[async_trait]
pub trait PolicyCenter: Send + Sync {
    /// Effective snapshot, or `Unavailable` when no cache exists yet
    /// (fail closed).
    async fn snapshot(&self) -> Result<Arc<PolicySnapshot>, PolicyError>;
    /// Tenant plus the tier version current at this revision.
    async fn resolve(
        &self,
        tenant: &TenantId,
        level: TierLevel,
    ) -> Result<PolicyResolution, PolicyError>;
    fn subscribe(&self) -> watch::Receiver<u64>;
    async fn reload(&self) -> Result<(), PolicyError>;

    // Administrative surface.
    async fn upsert_tenant(&self, tenant: Tenant) -> Result<(), PolicyError>;
    async fn set_tenant_status(
        &self,
        tenant: &TenantId,
        status: TenantStatus,
    ) -> Result<(), PolicyError>;
    async fn publish_tier(&self, draft: TierDraft) -> Result<u64, PolicyError>;
    async fn apply_override(&self, spec: RuntimeOverrideSpec) -> Result<(), PolicyError>;
}

struct CacheEntry {
    snapshot: Arc<PolicySnapshot>,
    stale: bool,
}

struct MutState {
    base: PolicySnapshot,
    overrides: RuntimeOverrideStore,
    rev_counter: u64,
}

impl MutState {
    fn effective(&mut self) -> Result<PolicySnapshot, PolicyError> {
        let mut snapshot = self.base.clone();
        for (path, value) in self.overrides.active_entries() {
            apply_override_to_snapshot(&mut snapshot, &path, &value)?;
        }
        self.rev_counter = self.rev_counter.saturating_add(1);
        snapshot.rev = self.rev_counter;
        Ok(snapshot)
    }
}

struct Inner {
    backend: Arc<dyn PolicyBackend>,
    cache: ArcSwapOption<CacheEntry>,
    state: Mutex<MutState>,
    watch_tx: watch::Sender<u64>,
}

impl Inner {
    async fn refresh_cache(&self) -> Result<(), PolicyError> {
        let mut state = self.state.lock().await;
        let effective = state.effective()?;
        state.base.rev = effective.rev;
        let stale = self
            .cache
            .load()
            .as_ref()
            .map(|entry| entry.stale)
            .unwrap_or(false);
        let rev = effective.rev;
        self.cache.store(Some(Arc::new(CacheEntry {
            snapshot: Arc::new(effective),
            stale,
        })));
        drop(state);
        let _ = self.watch_tx.send(rev);
        Ok(())
    }
}

/// Last-known-good cached policy center over a fallible durable backend.
///
/// Reads come from an `arc-swap`ed snapshot; if the backend is unreachable
/// the cache keeps serving with `stale=true`, and evaluations fail closed
/// only when no snapshot was ever established.
pub struct CachedPolicyCenter {
    inner: Arc<Inner>,
}

impl CachedPolicyCenter {
    /// Load the persisted snapshot if one exists, otherwise seed the
    /// backend with `initial`. A load failure leaves the center without a
    /// cache: administrative state starts from `initial`, but evaluations
    /// deny until a snapshot can be established.
    pub async fn bootstrap(backend: Arc<dyn PolicyBackend>, initial: PolicySnapshot) -> Arc<Self> {
        let (base, cache) = match backend.load().await {
            Ok(Some(snapshot)) => {
                let entry = CacheEntry {
                    snapshot: Arc::new(snapshot.clone()),
                    stale: false,
                };
                (snapshot, Some(Arc::new(entry)))
            }
            Ok(None) => {
                let stale = match backend.persist(&initial).await {
                    Ok(()) => false,
                    Err(err) => {
                        warn!(target: "policy", %err, "seeding policy backend failed");
                        true
                    }
                };
                let entry = CacheEntry {
                    snapshot: Arc::new(initial.clone()),
                    stale,
                };
                (initial.clone(), Some(Arc::new(entry)))
            }
            Err(err) => {
                warn!(target: "policy", %err, "policy backend unreachable at bootstrap; failing closed");
                (initial.clone(), None)
            }
        };
        let rev = base.rev;
        let (watch_tx, _) = watch::channel(rev);
        Arc::new(Self {
            inner: Arc::new(Inner {
                backend,
                cache: ArcSwapOption::from(cache),
                state: Mutex::new(MutState {
                    base,
                    overrides: RuntimeOverrideStore::default(),
                    rev_counter: rev,
                }),
                watch_tx,
            }),
        })
    }

    async fn mutate<R>(
        &self,
        apply: impl FnOnce(&mut PolicySnapshot) -> Result<R, PolicyError>,
    ) -> Result<R, PolicyError> {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        let mut next = state.base.clone();
        let out = apply(&mut next)?;
        state.base = next;
        let effective = state.effective()?;
        state.base.rev = effective.rev;
        let stale = match inner.backend.persist(&state.base).await {
            Ok(()) => false,
            Err(err) => {
                warn!(target: "policy", %err, "policy persist failed; cache marked stale");
                true
            }
        };
        let rev = effective.rev;
        inner.cache.store(Some(Arc::new(CacheEntry {
            snapshot: Arc::new(effective),
            stale,
        })));
        drop(state);
        let _ = inner.watch_tx.send(rev);
        Ok(out)
    }
}

#[async_trait]
impl PolicyCenter for CachedPolicyCenter {
    async fn snapshot(&self) -> Result<Arc<PolicySnapshot>, PolicyError> {
        match self.inner.cache.load_full() {
            Some(entry) => Ok(Arc::clone(&entry.snapshot)),
            None => Err(PolicyError::Unavailable("no policy cache".into())),
        }
    }

    async fn resolve(
        &self,
        tenant: &TenantId,
        level: TierLevel,
    ) -> Result<PolicyResolution, PolicyError> {
        let entry = self
            .inner
            .cache
            .load_full()
            .ok_or_else(|| PolicyError::Unavailable("no policy cache".into()))?;
        let snapshot = &entry.snapshot;
        let tenant = snapshot
            .tenant(tenant)
            .cloned()
            .ok_or_else(|| PolicyError::UnknownTenant(tenant.clone()))?;
        let tier = snapshot
            .tier_current(level)
            .cloned()
            .ok_or(PolicyError::UnknownTier(level))?;
        Ok(PolicyResolution {
            rev: snapshot.rev,
            stale: entry.stale,
            tenant,
            tier,
        })
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.watch_tx.subscribe()
    }

    async fn reload(&self) -> Result<(), PolicyError> {
        let inner = &self.inner;
        match inner.backend.load().await {
            Ok(Some(snapshot)) => {
                {
                    let mut state = inner.state.lock().await;
                    state.rev_counter = state.rev_counter.max(snapshot.rev);
                    state.base = snapshot;
                }
                inner.refresh_cache().await
            }
            Ok(None) => Ok(()),
            Err(err) => {
                if let Some(entry) = inner.cache.load_full() {
                    inner.cache.store(Some(Arc::new(CacheEntry {
                        snapshot: Arc::clone(&entry.snapshot),
                        stale: true,
                    })));
                }
                Err(err)
            }
        }
    }

    async fn upsert_tenant(&self, tenant: Tenant) -> Result<(), PolicyError> {
        self.mutate(move |snapshot| {
            snapshot.tenants.insert(tenant.id.clone(), tenant);
            Ok(())
        })
        .await
    }

    async fn set_tenant_status(
        &self,
        tenant: &TenantId,
        status: TenantStatus,
    ) -> Result<(), PolicyError> {
        let tenant = tenant.clone();
        self.mutate(move |snapshot| {
            let entry = snapshot
                .tenants
                .get_mut(&tenant)
                .ok_or(PolicyError::UnknownTenant(tenant.clone()))?;
            entry.status = status;
            Ok(())
        })
        .await
    }

    async fn publish_tier(&self, draft: TierDraft) -> Result<u64, PolicyError> {
        self.mutate(move |snapshot| {
            let version = snapshot
                .tier_current(draft.level)
                .map(|def| def.version + 1)
                .unwrap_or(1);
            snapshot.push_tier(draft.into_definition(version));
            Ok(version)
        })
        .await
    }

    async fn apply_override(&self, spec: RuntimeOverrideSpec) -> Result<(), PolicyError> {
        let ttl = (spec.ttl_seconds > 0).then(|| Duration::from_secs(spec.ttl_seconds));
        {
            let mut state = self.inner.state.lock().await;
            // Validate against the current base before accepting.
            let mut probe = state.base.clone();
            apply_override_to_snapshot(&mut probe, &spec.path, &spec.value)?;
            state
                .overrides
                .insert(spec.path.clone(), spec.value.clone(), ttl);
        }
        self.inner.refresh_cache().await?;
        if let Some(ttl) = ttl {
            let inner = Arc::clone(&self.inner);
            let path = spec.path;
            tokio::spawn(async move {
                sleep(ttl).await;
                let removed = {
                    let mut state = inner.state.lock().await;
                    state.overrides.remove(&path)
                };
                if removed {
                    if let Err(err) = inner.refresh_cache().await {
                        warn!(target: "policy", %err, "override expiry recompute failed");
                    }
                }
            });
        }
        Ok(())
    }
}

pub(crate) fn apply_override_to_snapshot(
    snapshot: &mut PolicySnapshot,
    path: &str,
    value: &Value,
) -> Result<(), PolicyError> {
    let segments: Vec<&str> = path.split('.').collect();
    match segments.as_slice() {
        ["tier", level, field] => {
            let level = TierLevel::ALL
                .into_iter()
                .find(|candidate| candidate.as_str() == *level)
                .ok_or_else(|| PolicyError::UnsupportedPath(path.to_string()))?;
            let current = snapshot
                .tiers
                .get_mut(&level)
                .and_then(|versions| versions.last_mut())
                .ok_or(PolicyError::UnknownTier(level))?;
            match *field {
                "window_quota" => current.window_quota = to_u32(value)?,
                "burst_quota" => current.burst_quota = to_u32(value)?,
                "worker_concurrency" => current.worker_concurrency = to_u64(value)? as usize,
                "task_timeout_ms" => current.task_timeout_ms = to_u64(value)?,
                "max_attempts" => current.max_attempts = to_u8(value)?,
                "window_secs" => current.window_secs = to_u64(value)?,
                "burst_secs" => current.burst_secs = to_u64(value)?,
                _ => return Err(PolicyError::UnsupportedPath(path.to_string())),
            }
        }
        ["tenant", id, "suspended"] => {
            let id = TenantId(id.to_string());
            let tenant = snapshot
                .tenants
                .get_mut(&id)
                .ok_or(PolicyError::UnknownTenant(id.clone()))?;
            tenant.status = if to_bool(value)? {
                TenantStatus::Suspended
            } else {
                TenantStatus::Active
            };
        }
        ["tenant", id, "action", action, "enabled"] => {
            let id = TenantId(id.to_string());
            let action = ActionType::ALL
                .into_iter()
                .find(|candidate| candidate.as_str() == *action)
                .ok_or_else(|| PolicyError::UnsupportedPath(path.to_string()))?;
            let tenant = snapshot
                .tenants
                .get_mut(&id)
                .ok_or(PolicyError::UnknownTenant(id.clone()))?;
            tenant.overrides.insert(action, to_bool(value)?);
        }
        _ => return Err(PolicyError::UnsupportedPath(path.to_string())),
    }
    Ok(())
}

fn to_u64(value: &Value) -> Result<u64, PolicyError> {
    value
        .as_u64()
        .or_else(|| value.as_i64().map(|v| v as u64))
        .ok_or_else(|| PolicyError::InvalidValue(format!("expected integer, got {value}")))
}

fn to_u32(value: &Value) -> Result<u32, PolicyError> {
    let v = to_u64(value)?;
    u32::try_from(v).map_err(|_| PolicyError::InvalidValue(format!("value {v} exceeds u32")))
}

fn to_u8(value: &Value) -> Result<u8, PolicyError> {
    let v = to_u64(value)?;
    u8::try_from(v).map_err(|_| PolicyError::InvalidValue(format!("value {v} exceeds u8")))
}

fn to_bool(value: &Value) -> Result<bool, PolicyError> {
    value
        .as_bool()
        .ok_or_else(|| PolicyError::InvalidValue(format!("expected bool, got {value}")))
}
