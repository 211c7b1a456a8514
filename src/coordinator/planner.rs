//! Planner role: build the planning prompt, call the model, parse the reply.

use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;

use crate::errors::EngineError;
use crate::llm::{extract_json_object, ChatMessage};
use crate::session::types::{
    Action, ActionRecord, BrowserState, PlanRisk, PlannedAction, StrategicPlan,
};

/// Everything the planner needs for one decision, borrowed from the session.
pub struct PlanningContext<'a> {
    pub task: &'a str,
    pub step: u32,
    pub max_steps: u32,
    pub browser_state: Option<&'a BrowserState>,
    pub history: &'a [ActionRecord],
    pub plan: Option<&'a StrategicPlan>,
    /// Set every `planning_interval` steps: demand a full fresh plan.
    pub force_refresh: bool,
    pub vision: bool,
}

/// Typed planner decision, validated from the loose model reply.
#[derive(Debug, Clone)]
pub struct PlannerOutput {
    pub plan: Option<StrategicPlan>,
    pub next_action: Option<Action>,
    pub reasoning: String,
    pub confidence: f64,
    pub needs_revision: bool,
    pub task_complete: bool,
    pub result: Option<String>,
}

/// Permissive intermediate representation of the model reply. Unknown fields
/// are ignored; absent optionals default.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawPlannerReply {
    strategy: Option<String>,
    estimated_steps: Option<u32>,
    confidence: Option<f64>,
    next_action: Option<Value>,
    planned_actions: Vec<PlannedAction>,
    success_criteria: Vec<String>,
    risks: Vec<PlanRisk>,
    task_complete: bool,
    result: Option<String>,
    reasoning: Option<String>,
    needs_revision: bool,
}

impl Default for RawPlannerReply {
    fn default() -> Self {
        Self {
            strategy: None,
            estimated_steps: None,
            confidence: None,
            next_action: None,
            planned_actions: Vec::new(),
            success_criteria: Vec::new(),
            risks: Vec::new(),
            task_complete: false,
            result: None,
            reasoning: None,
            needs_revision: false,
        }
    }
}

/// Parse raw model text into a [`PlannerOutput`].
///
/// Tolerates fenced code blocks and prose around the JSON object. A reply
/// that is neither terminal nor carries a next action is a parse error so
/// the retry layer can re-attempt.
pub fn parse_planner_reply(raw: &str) -> Result<PlannerOutput, EngineError> {
    let json = extract_json_object(raw)
        .ok_or_else(|| EngineError::PlannerParse("reply contains no JSON object".to_string()))?;
    let reply: RawPlannerReply = serde_json::from_str(&json)
        .map_err(|err| EngineError::PlannerParse(format!("malformed planner JSON: {err}")))?;

    let next_action = match reply.next_action {
        Some(Value::Null) | None => None,
        Some(value) => Some(serde_json::from_value::<Action>(value).map_err(|err| {
            EngineError::PlannerParse(format!("nextAction is not a valid action: {err}"))
        })?),
    };

    if !reply.task_complete && next_action.is_none() {
        return Err(EngineError::PlannerParse(
            "reply has neither taskComplete nor nextAction".to_string(),
        ));
    }

    let plan = reply.strategy.map(|strategy| StrategicPlan {
        strategy,
        estimated_steps: reply.estimated_steps.unwrap_or(0),
        confidence: reply.confidence.unwrap_or(0.0).clamp(0.0, 1.0),
        planned_actions: reply.planned_actions,
        success_criteria: reply.success_criteria,
        risks: reply.risks,
        revisions: Vec::new(),
    });

    let reasoning = reply
        .reasoning
        .or_else(|| {
            next_action
                .as_ref()
                .filter(|action| !action.reasoning.is_empty())
                .map(|action| action.reasoning.clone())
        })
        .unwrap_or_default();

    Ok(PlannerOutput {
        plan,
        next_action,
        reasoning,
        confidence: reply.confidence.unwrap_or(0.0).clamp(0.0, 1.0),
        needs_revision: reply.needs_revision,
        task_complete: reply.task_complete,
        result: reply.result,
    })
}

/// Assemble the chat messages for one planning call. `sanitized_dom` is the
/// guardrail-wrapped page content, when a browser state exists.
pub fn planning_messages(
    ctx: &PlanningContext<'_>,
    system_prompt: String,
    sanitized_dom: Option<&str>,
    attach_screenshot: bool,
) -> Vec<ChatMessage> {
    let body = super::prompt::planner_user_message(
        ctx.task,
        ctx.step,
        ctx.max_steps,
        ctx.browser_state,
        sanitized_dom,
        ctx.history,
        ctx.plan,
        ctx.force_refresh,
    );
    let mut user = ChatMessage::user(body);
    if attach_screenshot {
        if let Some(shot) = ctx
            .browser_state
            .and_then(|state| state.screenshot.as_deref())
        {
            user = user.with_image(shot);
        }
    }
    vec![ChatMessage::system(system_prompt), user]
}

/// Install or revise the session plan with a replacement reason.
pub fn revise_plan(
    current: Option<StrategicPlan>,
    mut fresh: StrategicPlan,
    reason: &str,
) -> StrategicPlan {
    if let Some(previous) = current {
        fresh.revisions = previous.revisions;
        fresh.revisions.push(crate::session::types::PlanRevision {
            reason: reason.to_string(),
            revised_at: Utc::now(),
        });
    }
    fresh
}
