//! Domain error model.

use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

/// A deterministic rejection: retrying the same input gives the same error.
///
/// Job payload decoding maps every variant to a permanent job failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A field of a payload or record is out of range or malformed.
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier did not parse.
    #[error("invalid {kind}: {reason}")]
    InvalidId { kind: &'static str, reason: String },

    /// The requested change is not allowed from the current state, e.g. a
    /// project that is being deleted cannot become `working` again.
    #[error("conflict: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(kind: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidId {
            kind,
            reason: reason.into(),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_offending_value() {
        assert_eq!(
            DomainError::invalid_id("ProjectId", "must not be empty").to_string(),
            "invalid ProjectId: must not be empty"
        );
        assert_eq!(
            DomainError::validation("prompt must not be empty").to_string(),
            "validation failed: prompt must not be empty"
        );
    }
}
