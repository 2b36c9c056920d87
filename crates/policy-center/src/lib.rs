pub mod api;
pub mod backend;
pub mod defaults;
pub mod errors;
pub mod loader;
pub mod model;
pub mod override_store;

pub use api::{CachedPolicyCenter, PolicyCenter};
pub use backend::{InMemoryPolicyBackend, JournalPolicyBackend, PolicyBackend};
pub use defaults::default_snapshot;
pub use errors::PolicyError;
pub use loader::load_snapshot;
pub use model::{
    PolicyResolution, PolicySnapshot, RuntimeOverrideSpec, Tenant, TenantStatus, TierDefinition,
    TierDraft,
};
