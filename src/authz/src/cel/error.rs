//! Condition compile and evaluation failures

use thiserror::Error;

/// A condition that could not be compiled or evaluated
#[derive(Error, Debug, Clone)]
pub enum CelError {
    #[error("cannot parse condition `{expression}`: {message}")]
    Parse { expression: String, message: String },

    #[error("cannot evaluate condition `{expression}`: {message}")]
    Evaluation { expression: String, message: String },

    #[error("condition `{expression}` returned {kind}, not a boolean")]
    NonBoolean { expression: String, kind: String },
}

impl CelError {
    /// Source text of the failing condition
    pub fn expression(&self) -> &str {
        match self {
            Self::Parse { expression, .. }
            | Self::Evaluation { expression, .. }
            | Self::NonBoolean { expression, .. } => expression,
        }
    }
}

pub type Result<T> = std::result::Result<T, CelError>;
