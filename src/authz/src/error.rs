//! Error types for the evaluation engine

use thiserror::Error;

use crate::cel::CelError;
use crate::engine::Reason;

/// Evaluation engine errors
#[derive(Debug, Error)]
pub enum AuthzError {
    /// Target service is not present in the runtime cache
    #[error("Application {0} is not found")]
    ServiceNotFound(String),

    /// Internal engine failure
    #[error("Evaluation engine error: {0}")]
    EvalEngine(String),

    /// Runtime cache is inconsistent with the data set it is synced against
    #[error("Evaluation cache error: {0}")]
    EvalCache(String),

    /// Builtin function was called with bad arguments
    #[error("Builtin function error: {0}")]
    BuiltinFunction(String),

    /// Remote custom function failed
    #[error("Customer function error: {0}")]
    CustomerFunction(String),

    /// Store does not support discover mode
    #[error("Discover error: {0}")]
    Discover(String),

    /// Injected token asserter rejected the subject
    #[error("Token assertion failed: {0}")]
    TokenAssertion(String),

    /// Condition compile or evaluate failure
    #[error("Condition error: {0}")]
    Condition(#[from] CelError),

    /// Policy store failure
    #[error("Store error: {0}")]
    Store(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AuthzError {
    /// Stable platform error code, when the error has one
    pub fn code(&self) -> Option<&'static str> {
        match self {
            Self::ServiceNotFound(_) | Self::EvalEngine(_) => Some("SPDL-2001"),
            Self::EvalCache(_) => Some("SPDL-2002"),
            Self::BuiltinFunction(_) => Some("SPDL-2003"),
            Self::CustomerFunction(_) => Some("SPDL-2004"),
            Self::Discover(_) => Some("SPDL-2005"),
            _ => None,
        }
    }

    /// Reason reported alongside a failed decision
    pub fn reason(&self) -> Reason {
        match self {
            Self::ServiceNotFound(_) => Reason::ServiceNotFound,
            _ => Reason::ErrorInEvaluation,
        }
    }
}

/// Result type for evaluation operations
pub type Result<T> = std::result::Result<T, AuthzError>;
