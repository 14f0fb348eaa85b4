use retrace_core::{CoreError, ProtocolError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<ProtocolError> for EngineError {
    fn from(err: ProtocolError) -> Self {
        Self::Core(CoreError::Protocol(err))
    }
}

impl EngineError {
    /// The tracking protocol violation behind this error, if any.
    pub fn protocol(&self) -> Option<&ProtocolError> {
        match self {
            Self::Core(err) => err.protocol(),
            Self::InvalidConfig(_) => None,
        }
    }
}
