pub mod errors;
pub mod journal;
pub mod model;

pub use errors::StateStoreError;
pub use journal::StateStore;
pub use model::{RecordKind, StateRecord};
