pub mod api;
pub mod errors;
pub mod journal;
pub mod metrics;
pub mod model;

pub use api::{AuditSink, InMemoryAuditCenter, NoopAuditCenter};
pub use errors::AuditError;
pub use journal::{JournalAuditCenter, JournalConfig};
pub use model::{AuditEvent, AuditFilter, AuditKind};
