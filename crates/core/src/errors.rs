use thiserror::Error;

use crate::capability::CapabilityError;
use crate::domain::task::Task;

/// Failure channel of a single tool execution. Validation, not-found and
/// ambiguous-match failures are recovered inside the orchestration loop as
/// ordinary conversation turns; upstream failures are retried once and then
/// surfaced as a generic apology.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ToolFailure {
    #[error("invalid tool arguments: {0}")]
    Validation(String),
    #[error("no task matched {selector}")]
    NotFound { selector: String },
    #[error("{} tasks matched", candidates.len())]
    Ambiguous { candidates: Vec<Task> },
    #[error("upstream failure: {0}")]
    Upstream(String),
}

impl From<CapabilityError> for ToolFailure {
    fn from(value: CapabilityError) -> Self {
        match value {
            CapabilityError::NotFound { selector } => Self::NotFound { selector },
            CapabilityError::Ambiguous { candidates } => Self::Ambiguous { candidates },
            CapabilityError::Internal(message) => Self::Upstream(message),
        }
    }
}

/// Failure channel of the conversation store.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("conversation not found")]
    NotFound,
    #[error("conversation belongs to a different user")]
    Forbidden,
    #[error("conversation reached its message ceiling")]
    Full,
    #[error("storage failure: {0}")]
    Database(String),
}

/// Orchestrator boundary errors. Only `RateLimited` crosses the HTTP
/// boundary as a distinct status; everything else the loop can recover from
/// becomes an assistant message before it ever gets here.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ChatError {
    #[error("rate limited, retry in {retry_after_seconds}s")]
    RateLimited { retry_after_seconds: u32 },
    #[error(transparent)]
    Conversation(#[from] StoreError),
    #[error("internal failure: {0}")]
    Internal(String),
}

impl ChatError {
    /// Message safe to show the caller. Never leaks internal error detail.
    pub fn user_message(&self) -> String {
        match self {
            Self::RateLimited { retry_after_seconds } => {
                format!("You're sending messages too quickly. Try again in {retry_after_seconds} seconds.")
            }
            Self::Conversation(StoreError::NotFound) => "That conversation does not exist.".to_string(),
            Self::Conversation(StoreError::Forbidden) => {
                "That conversation belongs to a different account.".to_string()
            }
            Self::Conversation(_) | Self::Internal(_) => {
                "Something went wrong on our side. Please try again.".to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::capability::CapabilityError;

    use super::{ChatError, StoreError, ToolFailure};

    #[test]
    fn capability_errors_map_onto_tool_failures() {
        let failure: ToolFailure =
            CapabilityError::NotFound { selector: "#7".to_string() }.into();
        assert_eq!(failure, ToolFailure::NotFound { selector: "#7".to_string() });

        let failure: ToolFailure = CapabilityError::Internal("db gone".to_string()).into();
        assert!(matches!(failure, ToolFailure::Upstream(_)));
    }

    #[test]
    fn internal_errors_never_leak_detail_to_the_caller() {
        let error = ChatError::Internal("sqlite disk I/O error at offset 4096".to_string());
        assert!(!error.user_message().contains("sqlite"));
    }

    #[test]
    fn rate_limited_message_carries_retry_hint() {
        let error = ChatError::RateLimited { retry_after_seconds: 12 };
        assert!(error.user_message().contains("12 seconds"));
        let forbidden = ChatError::Conversation(StoreError::Forbidden);
        assert!(forbidden.user_message().contains("different account"));
    }
}
