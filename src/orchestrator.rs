//! Process supervision: wiring, the main event loop, and ordered shutdown.

pub mod error;
pub mod handlers;
pub mod runner;

pub use error::OrchestratorError;
pub use runner::OrchestratorRunner;
