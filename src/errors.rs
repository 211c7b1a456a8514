use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure categories used for retry decisions and recovery routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    RateLimit,
    Network,
    Timeout,
    UserInputRequired,
    Fatal,
    Recoverable,
}

impl ErrorCategory {
    /// Classify an error message by case-insensitive substring, first match
    /// in table order wins; anything unrecognized is recoverable.
    pub fn classify(message: &str) -> Self {
        let lowered = message.to_lowercase();
        const TABLE: &[(ErrorCategory, &[&str])] = &[
            (ErrorCategory::RateLimit, &["rate limit", "429"]),
            (
                ErrorCategory::Network,
                &["network", "econnrefused", "fetch failed"],
            ),
            (ErrorCategory::Timeout, &["timeout", "timed out"]),
            (
                ErrorCategory::UserInputRequired,
                &["captcha", "verification", "login required", "authentication"],
            ),
            (
                ErrorCategory::Fatal,
                &["forbidden", "unauthorized", "invalid session"],
            ),
        ];
        for (category, needles) in TABLE {
            if needles.iter().any(|needle| lowered.contains(needle)) {
                return *category;
            }
        }
        ErrorCategory::Recoverable
    }

    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::RateLimit | Self::Network | Self::Timeout | Self::Recoverable
        )
    }
}

/// Errors emitted by the orchestration engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// LLM transport or provider failure; carries the classified category.
    #[error("llm call failed: {message}")]
    Llm {
        message: String,
        category: ErrorCategory,
    },

    /// The planner reply could not be parsed into a usable output.
    #[error("planner output invalid: {0}")]
    PlannerParse(String),

    /// The planner produced an action outside the configured whitelist.
    #[error("action rejected: {0}")]
    ActionRejected(String),

    /// The session id does not resolve to a live or persisted session.
    #[error("invalid session: {0}")]
    SessionNotFound(String),

    /// The session state does not accept the requested operation.
    #[error("session in state {state} cannot accept {operation}")]
    InvalidTransition { state: String, operation: String },

    /// Durable storage failure.
    #[error("storage failure: {0}")]
    Storage(String),

    /// Anything else.
    #[error("{0}")]
    Other(String),
}

impl EngineError {
    pub fn llm(message: impl Into<String>) -> Self {
        let message = message.into();
        let category = ErrorCategory::classify(&message);
        Self::Llm { message, category }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Llm { category, .. } => *category,
            // Parse failures are recoverable: a retried call may yield
            // well-formed JSON.
            Self::PlannerParse(_) => ErrorCategory::Recoverable,
            Self::ActionRejected(_) => ErrorCategory::Recoverable,
            Self::SessionNotFound(_) => ErrorCategory::Fatal,
            Self::InvalidTransition { .. } => ErrorCategory::Fatal,
            Self::Storage(message) => ErrorCategory::classify(message),
            Self::Other(message) => ErrorCategory::classify(message),
        }
    }
}
