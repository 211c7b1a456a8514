//! Typed progress events mirrored from the session state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use webpilot_event_bus::SessionBus;
use webpilot_guardrail::Severity;

use crate::session::types::LifecycleState;

/// Which part of the system emitted the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventActor {
    System,
    Planner,
    Actor,
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    TaskStart,
    TaskPause,
    TaskResume,
    TaskCancel,
    TaskComplete,
    TaskError,
    PlanGenerated,
    ActionExecuted,
    StateUpdate,
    SecurityAlert,
}

/// One progress event as delivered to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    #[serde(rename = "type")]
    pub kind: EventType,
    pub actor: EventActor,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
}

impl SessionEvent {
    pub fn new(kind: EventType, actor: EventActor, state: LifecycleState) -> Self {
        let state = serde_json::to_value(state)
            .ok()
            .and_then(|value| value.as_str().map(str::to_string))
            .unwrap_or_default();
        Self {
            kind,
            actor,
            state,
            data: None,
            timestamp: Utc::now(),
            severity: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }
}

/// Fan-out channel for one session's events.
pub type EventBus = Arc<SessionBus<SessionEvent>>;

pub fn new_bus() -> EventBus {
    SessionBus::new(128)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_with_type_tag() {
        let event = SessionEvent::new(
            EventType::PlanGenerated,
            EventActor::Planner,
            LifecycleState::Planning,
        )
        .with_data(serde_json::json!({ "confidence": 0.8 }));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "plan_generated");
        assert_eq!(value["actor"], "planner");
        assert_eq!(value["state"], "planning");
        assert_eq!(value["data"]["confidence"], 0.8);
    }

    #[tokio::test]
    async fn events_reach_bus_subscribers() {
        let bus = new_bus();
        let mut rx = bus.subscribe();
        bus.publish(SessionEvent::new(
            EventType::TaskStart,
            EventActor::System,
            LifecycleState::Planning,
        ));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventType::TaskStart);
    }
}
