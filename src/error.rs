use thiserror::Error;

use crate::store::StoreError;

/// Coarse classification used by the HTTP boundary to pick a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    State,
    SandboxUnavailable,
    Internal,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Code exceeds maximum length of {max} characters (got {len})")]
    CodeTooLong { len: usize, max: usize },

    #[error("Invalid request: {0}")]
    Invalid(String),

    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("Language '{0}' is not allowed for this question")]
    LanguageNotAllowed(String),

    /// Deliberately carries no detail about which lookup failed.
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("Assessment already started or completed")]
    AlreadyStarted,

    #[error("Assessment is not in progress")]
    NotActive,

    #[error("Assessment has expired")]
    Expired,

    #[error("No test cases found for this question")]
    NoTestCases,

    #[error("Sandbox unavailable: {0}")]
    SandboxUnavailable(String),

    #[error("Record store failure: {0}")]
    Store(#[from] StoreError),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Invalid(_)
            | Self::CodeTooLong { .. }
            | Self::UnsupportedLanguage(_)
            | Self::LanguageNotAllowed(_) => ErrorKind::Validation,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::AlreadyStarted | Self::NotActive | Self::Expired | Self::NoTestCases => {
                ErrorKind::State
            }
            Self::SandboxUnavailable(_) => ErrorKind::SandboxUnavailable,
            Self::Store(_) => ErrorKind::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert_eq!(
            EngineError::CodeTooLong { len: 10, max: 5 }.kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            EngineError::LanguageNotAllowed("cpp".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(EngineError::NotFound("Assessment").kind(), ErrorKind::NotFound);
        assert_eq!(EngineError::Expired.kind(), ErrorKind::State);
        assert_eq!(EngineError::NoTestCases.kind(), ErrorKind::State);
        assert_eq!(
            EngineError::SandboxUnavailable("docker".into()).kind(),
            ErrorKind::SandboxUnavailable
        );
    }

    #[test]
    fn test_not_found_message_is_uniform() {
        assert_eq!(
            EngineError::NotFound("Assessment").to_string(),
            "Assessment not found"
        );
    }
}
