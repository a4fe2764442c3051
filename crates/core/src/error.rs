use serde::{Deserialize, Serialize};

/// Error taxonomy shared by every layer. Only `NotFound` is an expected outcome;
/// everything else aborts the workflow.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConvergeError {
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("already_exists: {0}")]
    AlreadyExists(String),
    #[error("fault: {0}")]
    Fault(String),
    #[error("timed_out: {what} did not converge within {after_ms}ms")]
    TimedOut { what: String, after_ms: u64 },
    /// The confirming side went away before the post-condition was observed.
    #[error("abandoned: {0}")]
    Abandoned(String),
    /// A second operation was issued while one is pending for the same identity.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("session: {0}")]
    Session(String),
}

pub type ConvergeResult<T> = Result<T, ConvergeError>;

impl ConvergeError {
    pub fn fault(msg: impl Into<String>) -> Self {
        Self::Fault(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ConvergeError::NotFound(_))
    }

    pub fn is_fatal(&self) -> bool {
        !self.is_not_found()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_not_found_is_recoverable() {
        assert!(!ConvergeError::NotFound("x".into()).is_fatal());
        assert!(ConvergeError::AlreadyExists("x".into()).is_fatal());
        assert!(ConvergeError::TimedOut { what: "x".into(), after_ms: 5 }.is_fatal());
    }

    #[test]
    fn timed_out_renders_duration() {
        let e = ConvergeError::TimedOut { what: "Namespace/demo".into(), after_ms: 250 };
        assert_eq!(e.to_string(), "timed_out: Namespace/demo did not converge within 250ms");
    }
}
