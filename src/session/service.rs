//! Session registry: creation, lookup, hydration and shutdown.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{info, warn};

use webpilot_core_types::{SessionId, TaskId};

use crate::coordinator::Coordinator;
use crate::errors::EngineError;
use crate::llm::{LlmProvider, OpenAiConfig, OpenAiProvider};
use crate::session::engine::SessionHandle;
use crate::session::types::{LifecycleState, Session, SessionConfig};
use crate::storage::{KeyValueStore, SESSION_KEY};

/// Per-execute provider parameters from the request body.
#[derive(Debug, Clone, Default)]
pub struct ExecuteSpec {
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub vision: bool,
}

/// Builds the LLM capability for an execute request. Tests substitute a
/// factory returning a scripted mock.
pub trait ProviderFactory: Send + Sync {
    fn make(&self, spec: &ExecuteSpec) -> Result<Arc<dyn LlmProvider>, EngineError>;
}

/// Default factory: OpenAI-compatible chat completions.
pub struct OpenAiFactory {
    pub api_base: String,
    pub default_model: String,
    /// Environment variable consulted when the request carries no key.
    pub api_key_env: String,
}

impl Default for OpenAiFactory {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com/v1".to_string(),
            default_model: "gpt-4o-mini".to_string(),
            api_key_env: "WEBPILOT_API_KEY".to_string(),
        }
    }
}

impl ProviderFactory for OpenAiFactory {
    fn make(&self, spec: &ExecuteSpec) -> Result<Arc<dyn LlmProvider>, EngineError> {
        let api_key = spec
            .api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .or_else(|| std::env::var(&self.api_key_env).ok())
            .ok_or_else(|| {
                EngineError::Other(format!(
                    "no LLM API key: pass apiKey or set {}",
                    self.api_key_env
                ))
            })?;
        let mut config = OpenAiConfig::new(
            api_key,
            spec.model.clone().unwrap_or_else(|| self.default_model.clone()),
        );
        config.api_base = self.api_base.clone();
        config.vision = spec.vision;
        Ok(Arc::new(OpenAiProvider::new(config)?))
    }
}

/// Listing entry for the sessions index.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub state: LifecycleState,
    pub task_count: usize,
    pub step_count: u32,
    pub updated_at: DateTime<Utc>,
}

pub struct SessionService {
    handles: DashMap<String, Arc<SessionHandle>>,
    store: Arc<dyn KeyValueStore>,
    factory: Arc<dyn ProviderFactory>,
}

impl SessionService {
    pub fn new(store: Arc<dyn KeyValueStore>, factory: Arc<dyn ProviderFactory>) -> Arc<Self> {
        Arc::new(Self {
            handles: DashMap::new(),
            store,
            factory,
        })
    }

    /// Reload persisted sessions at boot. Coordinators are rebuilt lazily on
    /// the next execute since credentials are never persisted.
    pub async fn hydrate(&self) {
        let scopes = match self.store.scopes().await {
            Ok(scopes) => scopes,
            Err(err) => {
                warn!(error = %err, "session hydration failed to list storage");
                return;
            }
        };
        for scope in scopes {
            match self.store.get(&scope, SESSION_KEY).await {
                Ok(Some(blob)) => match serde_json::from_value::<Session>(blob) {
                    Ok(session) => {
                        let handle = SessionHandle::new(session, Arc::clone(&self.store));
                        self.handles.insert(scope, handle);
                    }
                    Err(err) => {
                        warn!(session = %scope, error = %err, "skipping unreadable session blob");
                    }
                },
                Ok(None) => {}
                Err(err) => {
                    warn!(session = %scope, error = %err, "failed to load session");
                }
            }
        }
        info!(count = self.handles.len(), "sessions hydrated");
    }

    pub async fn create(&self, config: Option<SessionConfig>) -> Result<SessionId, EngineError> {
        let id = SessionId::new();
        let session = Session::new(id.clone(), config.unwrap_or_default());
        let blob = serde_json::to_value(&session)
            .map_err(|err| EngineError::Storage(format!("serializing session: {err}")))?;
        self.store
            .put(&id.0, SESSION_KEY, &blob)
            .await
            .map_err(|err| EngineError::Storage(err.to_string()))?;
        let handle = SessionHandle::new(session, Arc::clone(&self.store));
        self.handles.insert(id.0.clone(), handle);
        info!(session = %id, "session created");
        Ok(id)
    }

    pub fn get(&self, id: &str) -> Result<Arc<SessionHandle>, EngineError> {
        self.handles
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| EngineError::SessionNotFound(id.to_string()))
    }

    pub async fn list(&self) -> Vec<SessionSummary> {
        // Snapshotting awaits the per-session lock; collect the handles
        // first so no map shard guard is held across an await.
        let handles: Vec<Arc<SessionHandle>> = self
            .handles
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let mut summaries = Vec::with_capacity(handles.len());
        for handle in handles {
            let snapshot = handle.snapshot().await;
            summaries.push(SessionSummary {
                session_id: snapshot.id.0.clone(),
                state: snapshot.state,
                task_count: snapshot.tasks.len(),
                step_count: snapshot.step_count,
                updated_at: snapshot.updated_at,
            });
        }
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        summaries
    }

    pub fn session_count(&self) -> usize {
        self.handles.len()
    }

    /// Route an execute request: build the provider, install the
    /// coordinator, start the task.
    pub async fn execute(
        &self,
        id: &str,
        task: String,
        spec: ExecuteSpec,
        config: Option<SessionConfig>,
    ) -> Result<TaskId, EngineError> {
        let handle = self.get(id)?;
        let provider = self.factory.make(&spec)?;
        let coordinator = Arc::new(Coordinator::new(provider));
        handle.execute(task, coordinator, config).await
    }

    /// Cancel background work across all sessions; used at process exit.
    pub fn shutdown(&self) {
        for entry in self.handles.iter() {
            entry.value().shutdown();
        }
    }
}
