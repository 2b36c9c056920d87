pub mod backend;
pub mod dispatch;
pub mod errors;
pub mod lanes;
pub mod memory;
pub mod metrics;
pub mod model;
pub mod orchestrator;
pub mod runtime;

pub use backend::{Generation, GenerationRequest, MockModelBackend, ModelBackend};
pub use dispatch::{ModelWorkerDispatch, NoopDispatch, WorkerDispatch};
pub use errors::OrchestratorError;
pub use memory::{InMemoryMemoryService, MemoryService, MemorySnippet, NoopMemoryService};
pub use model::{
    MemoryAttachment, SubmitRequest, TaskEvent, TaskRecord, TaskStatus, WorkAssignment,
};
pub use orchestrator::Orchestrator;
pub use runtime::{OrchestratorConfig, OrchestratorRuntime};

#[cfg(test)]
mod tests;
