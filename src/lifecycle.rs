//! Runtime container lifecycle: engine seam, per-container operation
//! serialization, and the create/delete/inspect/reconfigure operations.

pub mod docker;
pub mod engine;
pub mod operations;
pub mod runtime;

pub use engine::{ContainerEngine, EngineError};
pub use operations::{Operation, OperationGuard, OperationInProgress, OperationTracker};
pub use runtime::{LifecycleError, RuntimeManager};
