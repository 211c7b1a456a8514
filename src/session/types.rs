//! Session data model: tasks, actions, browser state, plans, metrics.
//!
//! Everything here serializes with camelCase field names; the persisted
//! session blob and the wire payloads share these shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use webpilot_content_cache::CachePolicy;
use webpilot_core_types::{ActionId, SessionId, TaskId};
use webpilot_guardrail::{Severity, ThreatCategory};

use crate::retry::RetryStrategy;

/// Per-session lifecycle state machine position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Idle,
    Planning,
    Executing,
    WaitingForBrowser,
    Paused,
    Completed,
    Error,
}

impl LifecycleState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// One natural-language task in the session's ordered task list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub description: String,
    #[serde(default)]
    pub priority: i32,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Task {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            id: TaskId::new(),
            description: description.into(),
            priority: 0,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }
}

/// The fixed action vocabulary the planner may draw from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Navigate,
    Click,
    Type,
    Hover,
    Select,
    ScrollDown,
    ScrollUp,
    ScrollTo,
    TabNew,
    TabClose,
    TabSwitch,
    Wait,
    Screenshot,
    Extract,
    CacheContent,
    KeyPress,
    DropdownSelect,
    SearchGoogle,
    NextPage,
    PreviousPage,
    Complete,
}

impl ActionKind {
    pub const ALL: [ActionKind; 21] = [
        ActionKind::Navigate,
        ActionKind::Click,
        ActionKind::Type,
        ActionKind::Hover,
        ActionKind::Select,
        ActionKind::ScrollDown,
        ActionKind::ScrollUp,
        ActionKind::ScrollTo,
        ActionKind::TabNew,
        ActionKind::TabClose,
        ActionKind::TabSwitch,
        ActionKind::Wait,
        ActionKind::Screenshot,
        ActionKind::Extract,
        ActionKind::CacheContent,
        ActionKind::KeyPress,
        ActionKind::DropdownSelect,
        ActionKind::SearchGoogle,
        ActionKind::NextPage,
        ActionKind::PreviousPage,
        ActionKind::Complete,
    ];

    /// Wire tag for the kind, matching its serde representation.
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Navigate => "navigate",
            ActionKind::Click => "click",
            ActionKind::Type => "type",
            ActionKind::Hover => "hover",
            ActionKind::Select => "select",
            ActionKind::ScrollDown => "scroll_down",
            ActionKind::ScrollUp => "scroll_up",
            ActionKind::ScrollTo => "scroll_to",
            ActionKind::TabNew => "tab_new",
            ActionKind::TabClose => "tab_close",
            ActionKind::TabSwitch => "tab_switch",
            ActionKind::Wait => "wait",
            ActionKind::Screenshot => "screenshot",
            ActionKind::Extract => "extract",
            ActionKind::CacheContent => "cache_content",
            ActionKind::KeyPress => "key_press",
            ActionKind::DropdownSelect => "dropdown_select",
            ActionKind::SearchGoogle => "search_google",
            ActionKind::NextPage => "next_page",
            ActionKind::PreviousPage => "previous_page",
            ActionKind::Complete => "complete",
        }
    }

    /// Whether executing this kind is expected to change the page.
    pub fn mutates_page(self) -> bool {
        !matches!(
            self,
            ActionKind::Wait
                | ActionKind::Screenshot
                | ActionKind::Extract
                | ActionKind::CacheContent
                | ActionKind::Complete
        )
    }
}

/// A single browser directive produced by the planner.
///
/// The parameter bag is schema-per-kind and stays loosely typed; unknown
/// planner fields land here via the flatten.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    #[serde(default = "ActionId::new")]
    pub id: ActionId,
    #[serde(rename = "type")]
    pub kind: ActionKind,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub params: serde_json::Map<String, Value>,
}

impl Action {
    pub fn new(kind: ActionKind) -> Self {
        Self {
            id: ActionId::new(),
            kind,
            reasoning: String::new(),
            created_at: Utc::now(),
            params: serde_json::Map::new(),
        }
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }
}

/// Outcome of one browser-side action execution, reported by the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browser_state: Option<BrowserState>,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub step: u32,
}

/// Immutable snapshot of the remote browser. Updates replace the record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrowserState {
    pub url: String,
    pub title: String,
    pub dom: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
    pub viewport: Viewport,
    pub can_go_back: bool,
    pub can_go_forward: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
    pub scroll_x: i32,
    pub scroll_y: i32,
}

/// One `(action, result)` pair in the session history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRecord {
    pub action: Action,
    pub result: ActionResult,
    pub step: u32,
    pub recorded_at: DateTime<Utc>,
}

/// One planner invocation: what went in, what came out.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannerRecord {
    pub step: u32,
    pub task: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_action: Option<ActionKind>,
    pub task_complete: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// A guardrail hit logged against the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityEvent {
    pub category: ThreatCategory,
    pub severity: Severity,
    pub pattern: String,
    /// Which ingress carried the content (dom, follow-up, extract...).
    pub source: String,
    pub detected_at: DateTime<Utc>,
}

/// Planner roadmap across multiple steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategicPlan {
    pub strategy: String,
    #[serde(default)]
    pub estimated_steps: u32,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub planned_actions: Vec<PlannedAction>,
    #[serde(default)]
    pub success_criteria: Vec<String>,
    #[serde(default)]
    pub risks: Vec<PlanRisk>,
    #[serde(default)]
    pub revisions: Vec<PlanRevision>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedAction {
    pub action: String,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub priority: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanRisk {
    pub description: String,
    #[serde(default)]
    pub likelihood: String,
    #[serde(default)]
    pub impact: String,
    #[serde(default)]
    pub mitigation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanRevision {
    pub reason: String,
    pub revised_at: DateTime<Utc>,
}

/// Recognized session options. Arrives as the `config` object on
/// `create`/`execute` and persists with the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    pub max_steps: u32,
    pub enable_vision: bool,
    pub enable_replay: bool,
    pub strict_security: bool,
    pub retry_strategy: RetryStrategy,
    pub cache_strategy: CachePolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools_enabled: Option<Vec<ActionKind>>,
    pub max_actions_per_step: u32,
    pub max_failures: u32,
    pub planning_interval: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_steps: 50,
            enable_vision: false,
            enable_replay: true,
            strict_security: false,
            retry_strategy: RetryStrategy::default(),
            cache_strategy: CachePolicy::default(),
            tools_enabled: None,
            max_actions_per_step: 3,
            max_failures: 3,
            planning_interval: 5,
        }
    }
}

impl SessionConfig {
    /// Whether the planner may emit this action kind.
    pub fn allows(&self, kind: ActionKind) -> bool {
        match &self.tools_enabled {
            Some(whitelist) => kind == ActionKind::Complete || whitelist.contains(&kind),
            None => true,
        }
    }
}

/// Passive per-session accumulator surfaced on the history endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionMetrics {
    /// Planning cycles run (one per step).
    pub total_steps: u32,
    /// Forced strategic-plan refreshes (every `planning_interval` steps).
    pub plan_refreshes: u32,
    pub successful_actions: u32,
    pub failed_actions: u32,
    pub retried_actions: u32,
    pub total_execution_ms: u64,
    pub llm_calls: u32,
    pub llm_tokens: u64,
    pub cache_hit_rate: f64,
    pub security_threats_detected: u32,
}

/// The full persisted session record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    pub tasks: Vec<Task>,
    pub current_task_index: usize,
    pub step_count: u32,
    pub state: LifecycleState,
    /// The action currently queued for delivery, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queued_action: Option<Action>,
    /// The action delivered to the client whose result is still pending.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_flight_action: Option<Action>,
    pub consecutive_failures: u32,
    pub action_history: Vec<ActionRecord>,
    pub planner_history: Vec<PlannerRecord>,
    pub security_events: Vec<SecurityEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browser_state: Option<BrowserState>,
    /// URL before the most recent navigation, for cache invalidation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<StrategicPlan>,
    pub config: SessionConfig,
    pub metrics: SessionMetrics,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: SessionId, config: SessionConfig) -> Self {
        let now = Utc::now();
        Self {
            id,
            tasks: Vec::new(),
            current_task_index: 0,
            step_count: 0,
            state: LifecycleState::Idle,
            queued_action: None,
            in_flight_action: None,
            consecutive_failures: 0,
            action_history: Vec::new(),
            planner_history: Vec::new(),
            security_events: Vec::new(),
            browser_state: None,
            last_url: None,
            plan: None,
            config,
            metrics: SessionMetrics::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn current_task(&self) -> Option<&Task> {
        self.tasks.get(self.current_task_index)
    }

    pub fn current_task_mut(&mut self) -> Option<&mut Task> {
        self.tasks.get_mut(self.current_task_index)
    }

    /// Index of the next pending task after the current one, if any.
    pub fn next_pending_task(&self) -> Option<usize> {
        self.tasks
            .iter()
            .enumerate()
            .skip(self.current_task_index + 1)
            .find(|(_, task)| task.status == TaskStatus::Pending)
            .map(|(index, _)| index)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
