use crate::config::ConfigError;
use crate::identity::IdentityError;
use crate::lifecycle::EngineError;
use crate::proxy::ProxyError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),
    #[error("container engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("runtime proxy error: {0}")]
    Proxy(#[from] ProxyError),
    #[error("cannot build async runtime: {0}")]
    Runtime(String),
}
