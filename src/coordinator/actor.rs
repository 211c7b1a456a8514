//! Actor role: validate a planner action and decide how it is dispatched.
//!
//! The engine itself never drives a browser. For a `complete` action the
//! actor resolves the task; for everything else it clears the action for
//! queueing toward the client.

use serde_json::Value;

use crate::errors::EngineError;
use crate::session::types::{Action, ActionKind, SessionConfig};

/// Actor decision for one action.
#[derive(Debug, Clone, Default)]
pub struct ActorOutcome {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
    pub needs_retry: bool,
    pub browser_state_changed: bool,
    pub task_complete: bool,
    pub completion_result: Option<String>,
}

/// Validate `action` against the configured whitelist and resolve terminal
/// actions. Whitelist violations are rejected so the planner is re-run.
pub fn evaluate(action: &Action, config: &SessionConfig) -> Result<ActorOutcome, EngineError> {
    if !config.allows(action.kind) {
        return Err(EngineError::ActionRejected(format!(
            "action type {} is not enabled for this session",
            action.kind.as_str()
        )));
    }

    if action.kind == ActionKind::Complete {
        let result = action
            .param_str("result")
            .or_else(|| action.param_str("text"))
            .or_else(|| action.param_str("message"))
            .map(str::to_string);
        return Ok(ActorOutcome {
            success: true,
            task_complete: true,
            completion_result: result,
            ..ActorOutcome::default()
        });
    }

    Ok(ActorOutcome {
        success: true,
        browser_state_changed: action.kind.mutates_page(),
        ..ActorOutcome::default()
    })
}
