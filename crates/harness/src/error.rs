use retrace_core::CoreError;
use retrace_engine::EngineError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("snapshot encoding failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
}
