use thiserror::Error;

use crate::engine::EngineError;

/// Error surfaced by connections and coordinators.
///
/// Variants follow the failure taxonomy of the access layer: data-dependent
/// failures (`OpenFailure`, `PrepareFailure`, `StepFailure`, `BusyTimeout`)
/// carry the engine result code, while `Misuse` marks caller bugs such as
/// reading a closed cursor or completing a transaction scope twice.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("open error {code}: {message}")]
    OpenFailure { code: i32, message: String },

    #[error("prepare error {code}: {message}")]
    PrepareFailure { code: i32, message: String },

    #[error("bind error: {0}")]
    BindFailure(String),

    #[error("database busy after {waited_ms} ms: {message}")]
    BusyTimeout { waited_ms: u64, message: String },

    #[error("step error {code}: {message}")]
    StepFailure { code: i32, message: String },

    #[error("misuse: {0}")]
    Misuse(String),

    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("pool exhausted: {0}")]
    PoolExhausted(String),
}

impl DispatchError {
    pub(crate) fn open(err: EngineError) -> Self {
        DispatchError::OpenFailure {
            code: err.code,
            message: err.message,
        }
    }

    pub(crate) fn prepare(err: EngineError) -> Self {
        DispatchError::PrepareFailure {
            code: err.code,
            message: err.message,
        }
    }

    pub(crate) fn step(err: EngineError) -> Self {
        DispatchError::StepFailure {
            code: err.code,
            message: err.message,
        }
    }

    /// Engine result code for code-bearing variants, if any.
    #[must_use]
    pub fn code(&self) -> Option<i32> {
        match self {
            DispatchError::OpenFailure { code, .. }
            | DispatchError::PrepareFailure { code, .. }
            | DispatchError::StepFailure { code, .. } => Some(*code),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;
