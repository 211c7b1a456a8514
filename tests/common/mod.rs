//! Shared harness for the end-to-end suite: in-memory storage, a scripted
//! LLM provider and a router driven through tower's oneshot.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use webpilot::errors::EngineError;
use webpilot::llm::{LlmProvider, MockLlmProvider, MockReply};
use webpilot::server::{build_router, ServeState};
use webpilot::session::{ExecuteSpec, ProviderFactory, SessionService};
use webpilot::storage::MemoryStore;

pub struct MockFactory(pub Arc<MockLlmProvider>);

impl ProviderFactory for MockFactory {
    fn make(&self, _spec: &ExecuteSpec) -> Result<Arc<dyn LlmProvider>, EngineError> {
        Ok(Arc::clone(&self.0) as Arc<dyn LlmProvider>)
    }
}

pub struct Harness {
    pub router: Router,
    pub service: Arc<SessionService>,
    pub provider: Arc<MockLlmProvider>,
    pub store: Arc<MemoryStore>,
}

pub fn harness(replies: Vec<MockReply>) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let provider = Arc::new(MockLlmProvider::new(replies));
    let factory = Arc::new(MockFactory(Arc::clone(&provider)));
    let service = SessionService::new(
        Arc::clone(&store) as Arc<dyn webpilot::storage::KeyValueStore>,
        factory,
    );
    let router = build_router(ServeState::new(Arc::clone(&service)));
    Harness {
        router,
        service,
        provider,
        store,
    }
}

pub async fn call(
    router: &Router,
    method: &str,
    path: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(path);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string())),
        None => builder.body(Body::empty()),
    }
    .expect("request build");
    let response = router.clone().oneshot(request).await.expect("dispatch");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

pub async fn create_session(router: &Router, config: Option<Value>) -> String {
    let body = config.map(|config| json!({ "config": config }));
    let (status, reply) = call(router, "POST", "/sessions/create", body).await;
    assert_eq!(status, StatusCode::OK, "create failed: {reply}");
    reply["sessionId"].as_str().expect("session id").to_string()
}

pub async fn execute_task(router: &Router, id: &str, task: &str) {
    let (status, reply) = call(
        router,
        "POST",
        &format!("/sessions/{id}/execute"),
        Some(json!({ "task": task, "apiKey": "test-key" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "execute failed: {reply}");
    assert_eq!(reply["success"], true);
}

pub async fn history(router: &Router, id: &str) -> Value {
    let (status, reply) = call(router, "GET", &format!("/sessions/{id}/history"), None).await;
    assert_eq!(status, StatusCode::OK);
    reply
}

/// Poll the history endpoint until the predicate holds.
pub async fn wait_for_history<F>(router: &Router, id: &str, what: &str, predicate: F) -> Value
where
    F: Fn(&Value) -> bool,
{
    for _ in 0..200 {
        let snapshot = history(router, id).await;
        if predicate(&snapshot) {
            return snapshot;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Poll next-action until the engine hands one out.
pub async fn wait_for_action(router: &Router, id: &str) -> Value {
    for _ in 0..200 {
        let (status, reply) =
            call(router, "GET", &format!("/sessions/{id}/next-action"), None).await;
        assert_eq!(status, StatusCode::OK);
        if reply["waiting"] != true {
            return reply["action"].clone();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for an action");
}

pub async fn post_action_result(router: &Router, id: &str, body: Value) {
    let (status, reply) = call(
        router,
        "POST",
        &format!("/sessions/{id}/action-result"),
        Some(body),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "action-result failed: {reply}");
}

pub fn navigate_reply(url: &str) -> MockReply {
    MockReply::Text(
        json!({
            "strategy": "open the target page and confirm arrival",
            "estimatedSteps": 2,
            "confidence": 0.9,
            "nextAction": { "type": "navigate", "url": url, "reasoning": "open the page" },
            "plannedActions": [
                { "action": "navigate", "reasoning": "open the page", "priority": 1 }
            ],
            "successCriteria": ["page is loaded"],
            "taskComplete": false
        })
        .to_string(),
    )
}

pub fn cache_content_reply() -> MockReply {
    MockReply::Text(
        json!({
            "nextAction": { "type": "cache_content", "reasoning": "keep the page data" },
            "taskComplete": false
        })
        .to_string(),
    )
}

pub fn complete_reply(result: &str) -> MockReply {
    MockReply::Text(
        json!({
            "taskComplete": true,
            "result": result,
            "confidence": 1.0
        })
        .to_string(),
    )
}
