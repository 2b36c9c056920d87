use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{info, warn};

use gatehouse_audit_center::{
    AuditSink, InMemoryAuditCenter, JournalAuditCenter, JournalConfig,
};
use gatehouse_core_types::{ActionType, Clock, SystemClock};
use gatehouse_evaluator::PermissionEvaluator;
use gatehouse_identity_center::IdentityManager;
use gatehouse_orchestrator::{
    MemoryService, MockModelBackend, ModelBackend, ModelWorkerDispatch, InMemoryMemoryService,
    Orchestrator, OrchestratorRuntime,
};
use gatehouse_policy_center::{
    load_snapshot, CachedPolicyCenter, InMemoryPolicyBackend, JournalPolicyBackend, PolicyBackend,
};
use gatehouse_rate_limiter::RateLimiter;
use gatehouse_state_store::StateStore;
use gatehouse_worker_registry::{WorkerRegistry, WorkerRoleSpec};

use crate::config::EngineConfig;

/// The assembled engine: policy, identity, rate limiting, evaluation, and
/// orchestration wired together from one configuration.
pub struct Kernel {
    pub config: EngineConfig,
    pub clock: Arc<dyn Clock>,
    pub audit: Arc<dyn AuditSink>,
    pub audit_ring: Option<Arc<InMemoryAuditCenter>>,
    pub store: Option<Arc<StateStore>>,
    pub policy: Arc<CachedPolicyCenter>,
    pub identity: Arc<IdentityManager>,
    pub limiter: Arc<RateLimiter>,
    pub evaluator: Arc<PermissionEvaluator>,
    pub registry: Arc<WorkerRegistry>,
    pub orchestrator: Arc<Orchestrator<ModelWorkerDispatch>>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl Kernel {
    pub async fn bootstrap(config: EngineConfig) -> anyhow::Result<Arc<Self>> {
        Self::bootstrap_with(
            config,
            Arc::new(SystemClock),
            MockModelBackend::new(),
            InMemoryMemoryService::new(),
        )
        .await
    }

    /// Full wiring with injectable clock, model backend, and memory
    /// service (tests, alternative deployments).
    pub async fn bootstrap_with(
        config: EngineConfig,
        clock: Arc<dyn Clock>,
        backend: Arc<dyn ModelBackend>,
        memory: Arc<dyn MemoryService>,
    ) -> anyhow::Result<Arc<Self>> {
        let store = match &config.data_dir {
            Some(dir) => Some(Arc::new(
                StateStore::open(dir.join("state.jsonl")).context("opening state journal")?,
            )),
            None => None,
        };

        let mut audit_ring = None;
        let audit: Arc<dyn AuditSink> = match &config.data_dir {
            Some(dir) => {
                let mut journal = JournalConfig::new(dir.join("audit"));
                journal.rotate_bytes = config.audit.rotate_bytes;
                journal.compress_rotated = config.audit.compress_rotated;
                JournalAuditCenter::open(journal).context("opening audit journal")?
            }
            None => {
                let ring = InMemoryAuditCenter::new(config.audit.ring_capacity);
                audit_ring = Some(ring.clone());
                ring
            }
        };

        let initial =
            load_snapshot(config.policy_file.as_deref()).context("loading policy snapshot")?;
        let backend_policy: Arc<dyn PolicyBackend> = match &store {
            Some(store) => JournalPolicyBackend::new(Arc::clone(store)),
            None => InMemoryPolicyBackend::new(),
        };
        let policy = CachedPolicyCenter::bootstrap(backend_policy, initial).await;

        let identity = match &store {
            Some(store) => IdentityManager::with_store(
                policy.clone(),
                audit.clone(),
                config.identity_config(),
                clock.clone(),
                Arc::clone(store),
            ),
            None => IdentityManager::new(
                policy.clone(),
                audit.clone(),
                config.identity_config(),
                clock.clone(),
            ),
        };
        identity.recover().context("recovering identities")?;

        let limiter = Arc::new(RateLimiter::new());
        let evaluator = PermissionEvaluator::new(
            identity.clone(),
            policy.clone(),
            Arc::clone(&limiter),
            audit.clone(),
            clock.clone(),
        );

        let registry = WorkerRegistry::new();
        let orchestrator = Arc::new(Orchestrator::new(
            OrchestratorRuntime::new(config.orchestrator_config()),
            Arc::clone(&registry),
            evaluator.clone(),
            policy.clone(),
            ModelWorkerDispatch::new(backend),
            memory,
            audit.clone(),
            store.clone(),
            clock.clone(),
        ));
        let recovered = orchestrator
            .recover()
            .map_err(|err| anyhow::anyhow!("recovering tasks: {err}"))?;
        if recovered > 0 {
            info!(recovered, "requeued in-flight tasks from journal");
        }

        if config.register_default_roles {
            for spec in default_worker_roles() {
                if let Err(err) = registry.register(spec) {
                    warn!(%err, "default role registration skipped");
                }
            }
        }

        Ok(Arc::new(Self {
            config,
            clock,
            audit,
            audit_ring,
            store,
            policy,
            identity,
            limiter,
            evaluator,
            registry,
            orchestrator,
            maintenance: Mutex::new(None),
        }))
    }

    /// Start the scheduling loop and the periodic identity maintenance
    /// sweep (expiry + scheduled rotation).
    pub async fn start(self: &Arc<Self>) {
        self.orchestrator.spawn().await;
        let mut guard = self.maintenance.lock().await;
        if guard.is_some() {
            return;
        }
        let kernel = Arc::clone(self);
        let interval = Duration::from_secs(self.config.maintenance_interval_secs.max(1));
        *guard = Some(tokio::spawn(async move {
            loop {
                sleep(interval).await;
                let now = kernel.clock.now();
                let expired = kernel.identity.expire_sweep(now).await;
                if expired > 0 {
                    info!(expired, "expiry sweep revoked actors");
                }
                let rotated = kernel.identity.rotation_sweep().await;
                if rotated > 0 {
                    info!(rotated, "rotation sweep reissued credentials");
                }
            }
        }));
    }

    pub async fn shutdown(&self) {
        self.orchestrator.shutdown().await;
        if let Some(handle) = self.maintenance.lock().await.take() {
            handle.abort();
        }
    }
}

/// The default worker fleet: seven specialized roles covering the closed
/// action set.
pub fn default_worker_roles() -> Vec<WorkerRoleSpec> {
    vec![
        WorkerRoleSpec::new("concierge", [ActionType::ChatReply], 8),
        WorkerRoleSpec::new(
            "scribe",
            [ActionType::DocumentDraft, ActionType::ReportCompile],
            4,
        ),
        WorkerRoleSpec::new("analyst", [ActionType::DataAnalyze], 4),
        WorkerRoleSpec::new(
            "bookkeeper",
            [ActionType::LedgerSync, ActionType::InvoiceMatch],
            2,
        ),
        WorkerRoleSpec::new("scout", [ActionType::PortalScrape], 2),
        WorkerRoleSpec::new(
            "coordinator",
            [ActionType::CalendarSync, ActionType::MailboxSweep],
            4,
        ),
        WorkerRoleSpec::new("reviewer", [ActionType::CodeReview], 2),
    ]
}
