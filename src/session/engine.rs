//! Per-session execution engine.
//!
//! One [`SessionHandle`] per live session: the persisted record behind a
//! single-writer async mutex, the action queue toward the browser client,
//! the content cache, the event bus and the lazily installed coordinator.
//! Planning cycles run as detached tasks spawned from `execute` and from
//! `action-result`; a per-session guard keeps at most one cycle in flight
//! and a cancellation token tears it down on cancel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use webpilot_content_cache::{ContentCache, ContentTier};
use webpilot_core_types::{ReplayId, SessionId, TaskId};
use webpilot_guardrail::ThreatHit;

use crate::coordinator::planner::PlanningContext;
use crate::coordinator::{planner, Coordinator};
use crate::errors::EngineError;
use crate::events::{new_bus, EventActor, EventBus, EventType, SessionEvent};
use crate::queue::ActionQueue;
use crate::retry::RecoveryAction;
use crate::session::types::{
    Action, ActionKind, ActionRecord, ActionResult, BrowserState, LifecycleState, PlannerRecord,
    SecurityEvent, Session, SessionConfig, Task, TaskStatus,
};
use crate::storage::{KeyValueStore, SESSION_KEY};

/// `action-result` ingress payload after boundary translation.
#[derive(Debug, Clone, Default)]
pub struct ActionResultIngress {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
    pub screenshot: Option<String>,
    pub browser_state: Option<BrowserState>,
    pub duration_ms: u64,
}

/// Reply to a `next-action` poll.
#[derive(Debug, Clone)]
pub struct NextActionReply {
    pub action: Option<Action>,
    pub waiting: bool,
    pub task_complete: bool,
}

pub struct SessionHandle {
    pub id: SessionId,
    record: AsyncMutex<Session>,
    queue: ActionQueue,
    cache: parking_lot::Mutex<ContentCache>,
    bus: EventBus,
    coordinator: parking_lot::RwLock<Option<Arc<Coordinator>>>,
    planning_active: AtomicBool,
    cancel: parking_lot::Mutex<CancellationToken>,
    store: Arc<dyn KeyValueStore>,
}

impl SessionHandle {
    pub fn new(session: Session, store: Arc<dyn KeyValueStore>) -> Arc<Self> {
        let cache = ContentCache::new(session.config.cache_strategy.clone());
        Arc::new(Self {
            id: session.id.clone(),
            record: AsyncMutex::new(session),
            queue: ActionQueue::new(),
            cache: parking_lot::Mutex::new(cache),
            bus: new_bus(),
            coordinator: parking_lot::RwLock::new(None),
            planning_active: AtomicBool::new(false),
            cancel: parking_lot::Mutex::new(CancellationToken::new()),
            store,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.bus.subscribe()
    }

    pub async fn snapshot(&self) -> Session {
        self.record.lock().await.clone()
    }

    pub fn has_coordinator(&self) -> bool {
        self.coordinator.read().is_some()
    }

    pub fn install_coordinator(&self, coordinator: Arc<Coordinator>) {
        *self.coordinator.write() = Some(coordinator);
    }

    fn coordinator(&self) -> Result<Arc<Coordinator>, EngineError> {
        self.coordinator.read().clone().ok_or_else(|| {
            EngineError::Other(
                "session has no LLM coordinator; submit a task via execute first".to_string(),
            )
        })
    }

    fn cancel_token(&self) -> CancellationToken {
        self.cancel.lock().clone()
    }

    fn emit(&self, event: SessionEvent) {
        self.bus.publish(event);
    }

    async fn persist(&self, record: &Session) -> Result<(), EngineError> {
        let value = serde_json::to_value(record)
            .map_err(|err| EngineError::Storage(format!("serializing session: {err}")))?;
        self.store
            .put(&self.id.0, SESSION_KEY, &value)
            .await
            .map_err(|err| EngineError::Storage(err.to_string()))
    }

    /// Start (or enqueue) a task with a fresh coordinator from `execute`.
    pub async fn execute(
        self: &Arc<Self>,
        description: String,
        coordinator: Arc<Coordinator>,
        config_override: Option<SessionConfig>,
    ) -> Result<TaskId, EngineError> {
        self.install_coordinator(coordinator);
        let task_id = {
            let mut record = self.record.lock().await;
            if let Some(config) = config_override {
                *self.cache.lock() = ContentCache::new(config.cache_strategy.clone());
                record.config = config;
            }
            // Task text is caller-supplied and untrusted like any other input.
            let cleaned = webpilot_guardrail::sanitize(&description, record.config.strict_security);
            self.log_threats(&mut record, &cleaned.threats, "task");
            let task = Task::new(cleaned.text);
            let task_id = task.id.clone();
            record.tasks.push(task);

            if matches!(
                record.state,
                LifecycleState::Idle | LifecycleState::Completed | LifecycleState::Error
            ) {
                // A terminal session is revived for the new task; rotate the
                // cancellation token so the new planning task is killable.
                *self.cancel.lock() = CancellationToken::new();
                record.current_task_index = record.tasks.len() - 1;
                record.consecutive_failures = 0;
                record.state = LifecycleState::Planning;
            }
            record.touch();
            self.persist(&record).await?;
            task_id
        };
        self.spawn_planning();
        Ok(task_id)
    }

    /// Append a follow-up task; it runs when the current task terminates.
    pub async fn follow_up(self: &Arc<Self>, description: String) -> Result<TaskId, EngineError> {
        self.coordinator()?;
        let (task_id, start_now) = {
            let mut record = self.record.lock().await;
            let cleaned = webpilot_guardrail::sanitize(&description, record.config.strict_security);
            self.log_threats(&mut record, &cleaned.threats, "follow-up");
            let task = Task::new(cleaned.text);
            let task_id = task.id.clone();
            record.tasks.push(task);

            let start_now = matches!(
                record.state,
                LifecycleState::Idle | LifecycleState::Completed | LifecycleState::Error
            );
            if start_now {
                *self.cancel.lock() = CancellationToken::new();
                record.current_task_index = record.tasks.len() - 1;
                record.consecutive_failures = 0;
                record.state = LifecycleState::Planning;
            }
            record.touch();
            self.persist(&record).await?;
            (task_id, start_now)
        };
        if start_now {
            self.spawn_planning();
        }
        Ok(task_id)
    }

    /// Deliver the queued action to the polling client, if any.
    pub async fn next_action(&self) -> Result<NextActionReply, EngineError> {
        let mut record = self.record.lock().await;
        if record.state == LifecycleState::WaitingForBrowser {
            if let Some(action) = self.queue.pop() {
                record.queued_action = None;
                record.in_flight_action = Some(action.clone());
                record.state = LifecycleState::Executing;
                record.touch();
                self.persist(&record).await?;
                return Ok(NextActionReply {
                    action: Some(action),
                    waiting: false,
                    task_complete: false,
                });
            }
        }
        Ok(NextActionReply {
            action: None,
            waiting: true,
            task_complete: record.state == LifecycleState::Completed,
        })
    }

    /// Record the browser's outcome for the in-flight action and schedule
    /// the next planning cycle.
    pub async fn action_result(
        self: &Arc<Self>,
        ingress: ActionResultIngress,
    ) -> Result<(), EngineError> {
        let resume_planning = {
            let mut record = self.record.lock().await;
            let Some(action) = record.in_flight_action.take() else {
                if record.state.is_terminal() {
                    // Late result for a cancelled or finished session.
                    return Ok(());
                }
                return Err(EngineError::InvalidTransition {
                    state: state_name(record.state),
                    operation: "action-result".to_string(),
                });
            };

            let step = record.step_count;
            let result = ActionResult {
                success: ingress.success,
                data: ingress.data,
                error: ingress.error,
                screenshot: ingress.screenshot.clone(),
                browser_state: ingress.browser_state.clone(),
                duration_ms: ingress.duration_ms,
                step,
            };

            if let Some(state) = ingress.browser_state {
                self.apply_browser_state(&mut record, state, false, true);
            } else if let Some(shot) = ingress.screenshot {
                if let Some(url) = record.browser_state.as_ref().map(|s| s.url.clone()) {
                    let mut cache = self.cache.lock();
                    if let Err(err) = cache.insert(ContentTier::Screenshot, &url, &shot) {
                        warn!(session = %self.id, error = %err, "screenshot cache insert failed");
                    }
                    record.metrics.cache_hit_rate = cache.stats().hit_rate;
                }
            }

            // API-shaped payloads fetched by the client are reusable across
            // pages; key them on the page that produced them.
            if matches!(action.kind, ActionKind::Extract | ActionKind::CacheContent) {
                if let (Some(data), Some(url)) = (
                    result.data.as_ref(),
                    record.browser_state.as_ref().map(|s| s.url.clone()),
                ) {
                    let payload = data.to_string();
                    let mut cache = self.cache.lock();
                    if let Err(err) = cache.insert(ContentTier::Api, &url, &payload) {
                        warn!(session = %self.id, error = %err, "api cache insert failed");
                    }
                    record.metrics.cache_hit_rate = cache.stats().hit_rate;
                }
            }

            if result.success {
                record.metrics.successful_actions += 1;
                record.consecutive_failures = 0;
            } else {
                record.metrics.failed_actions += 1;
                record.consecutive_failures += 1;
            }
            record.metrics.total_execution_ms += result.duration_ms;

            let event_data = json!({
                "step": step,
                "actionType": action.kind.as_str(),
                "success": result.success,
                "error": result.error,
            });
            record.action_history.push(ActionRecord {
                action,
                result,
                step,
                recorded_at: Utc::now(),
            });
            self.emit(
                SessionEvent::new(EventType::ActionExecuted, EventActor::Actor, record.state)
                    .with_data(event_data),
            );

            if record.consecutive_failures >= record.config.max_failures {
                let message = format!(
                    "task failed after {} consecutive action failures",
                    record.consecutive_failures
                );
                self.fail_current_task(&mut record, &message);
                record.touch();
                self.persist(&record).await?;
                return Ok(());
            }

            let resume_planning = record.state == LifecycleState::Executing;
            if resume_planning {
                record.state = LifecycleState::Planning;
            }
            record.touch();
            self.persist(&record).await?;
            resume_planning
        };

        if resume_planning {
            self.spawn_planning();
        }
        Ok(())
    }

    /// Replace the browser snapshot from the `state` ingress.
    pub async fn update_state(&self, state: BrowserState) -> Result<(), EngineError> {
        let mut record = self.record.lock().await;
        self.apply_browser_state(&mut record, state, true, false);
        record.touch();
        self.persist(&record).await
    }

    pub async fn pause(&self) -> Result<(), EngineError> {
        let mut record = self.record.lock().await;
        if record.state.is_terminal() {
            return Err(EngineError::InvalidTransition {
                state: state_name(record.state),
                operation: "pause".to_string(),
            });
        }
        record.state = LifecycleState::Paused;
        if let Some(task) = record.current_task_mut() {
            if task.status == TaskStatus::Running {
                task.status = TaskStatus::Paused;
            }
        }
        self.emit(SessionEvent::new(
            EventType::TaskPause,
            EventActor::User,
            record.state,
        ));
        record.touch();
        self.persist(&record).await
    }

    pub async fn resume(self: &Arc<Self>) -> Result<(), EngineError> {
        {
            let mut record = self.record.lock().await;
            if record.state != LifecycleState::Paused {
                return Err(EngineError::InvalidTransition {
                    state: state_name(record.state),
                    operation: "resume".to_string(),
                });
            }
            // Resume replans from scratch; any action queued before the pause
            // is stale.
            self.queue.drain();
            record.queued_action = None;
            record.state = LifecycleState::Planning;
            if let Some(task) = record.current_task_mut() {
                if task.status == TaskStatus::Paused {
                    task.status = TaskStatus::Running;
                }
            }
            self.emit(SessionEvent::new(
                EventType::TaskResume,
                EventActor::User,
                record.state,
            ));
            record.touch();
            self.persist(&record).await?;
        }
        self.spawn_planning();
        Ok(())
    }

    pub async fn cancel(&self) -> Result<(), EngineError> {
        let mut record = self.record.lock().await;
        if record.state.is_terminal() {
            return Ok(());
        }
        self.cancel.lock().cancel();
        self.queue.drain();
        record.queued_action = None;
        record.in_flight_action = None;
        if let Some(task) = record.current_task_mut() {
            if !task.status.is_terminal() {
                task.status = TaskStatus::Cancelled;
                task.completed_at = Some(Utc::now());
            }
        }
        record.state = LifecycleState::Completed;
        self.emit(SessionEvent::new(
            EventType::TaskCancel,
            EventActor::User,
            record.state,
        ));
        record.touch();
        info!(session = %self.id, "session cancelled");
        self.persist(&record).await
    }

    /// Export action history, final browser state and metrics.
    pub async fn export_replay(&self) -> Result<String, EngineError> {
        let record = self.record.lock().await;
        if !record.config.enable_replay {
            return Err(EngineError::Other(
                "replay export is disabled for this session".to_string(),
            ));
        }
        let replay_key = ReplayId::storage_key(&self.id);
        let value = json!({
            "sessionId": self.id.0,
            "actionHistory": record.action_history,
            "finalState": record.browser_state,
            "metrics": record.metrics,
            "exportedAt": Utc::now(),
        });
        self.store
            .put(&self.id.0, &replay_key, &value)
            .await
            .map_err(|err| EngineError::Storage(err.to_string()))?;
        Ok(replay_key)
    }

    /// Run the extractor role against caller-supplied content.
    pub async fn extract(
        &self,
        fields: &[String],
        content: &str,
        extraction_prompt: Option<&str>,
    ) -> Result<(serde_json::Map<String, Value>, f64), EngineError> {
        let coordinator = self.coordinator()?;
        let config = self.record.lock().await.config.clone();
        let outcome = coordinator
            .extract(fields, content, extraction_prompt, &config)
            .await
            .map_err(|err| EngineError::llm(err.to_string()))?;

        let mut record = self.record.lock().await;
        record.metrics.llm_calls += outcome.attempts;
        record.metrics.llm_tokens += outcome.usage.total();
        self.log_threats(&mut record, &outcome.threats, "extract");
        record.touch();
        self.persist(&record).await?;
        Ok((outcome.data, outcome.confidence))
    }

    /// Spawn the detached planning cycle unless one is already running.
    fn spawn_planning(self: &Arc<Self>) {
        if self.planning_active.swap(true, Ordering::SeqCst) {
            debug!(session = %self.id, "planning cycle already in flight");
            return;
        }
        let handle = Arc::clone(self);
        let token = self.cancel_token();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(session = %handle.id, "planning cycle cancelled");
                }
                _ = handle.planning_cycle() => {}
            }
            handle.planning_active.store(false, Ordering::SeqCst);
        });
    }

    /// One or more planning steps; loops when a task completes and a pending
    /// follow-up is ready.
    async fn planning_cycle(self: &Arc<Self>) {
        loop {
            let Some(prepared) = self.prepare_planning_step().await else {
                return;
            };
            let coordinator = match self.coordinator() {
                Ok(coordinator) => coordinator,
                Err(err) => {
                    warn!(session = %self.id, error = %err, "planning without coordinator");
                    return;
                }
            };

            let ctx = PlanningContext {
                task: &prepared.task,
                step: prepared.step,
                max_steps: prepared.config.max_steps,
                browser_state: prepared.browser_state.as_ref(),
                history: &prepared.history,
                plan: prepared.plan.as_ref(),
                force_refresh: prepared.force_refresh,
                vision: prepared.config.enable_vision,
            };
            let outcome = coordinator.plan(ctx, &prepared.config).await;

            if !self.apply_planning_outcome(prepared, outcome).await {
                return;
            }
        }
    }

    /// Phase 1 of a planning step: bump counters under the lock and collect
    /// everything the planner needs. Returns `None` when the session is not
    /// in a plannable state.
    async fn prepare_planning_step(&self) -> Option<PreparedStep> {
        let mut record = self.record.lock().await;
        if record.state != LifecycleState::Planning {
            return None;
        }

        if let Some(task) = record.current_task_mut() {
            if task.status == TaskStatus::Pending {
                task.status = TaskStatus::Running;
                task.started_at = Some(Utc::now());
                self.emit(SessionEvent::new(
                    EventType::TaskStart,
                    EventActor::System,
                    record.state,
                ));
            }
        } else {
            warn!(session = %self.id, "planning with no current task");
            return None;
        }

        record.step_count += 1;
        record.metrics.total_steps += 1;

        if record.step_count > record.config.max_steps {
            self.fail_current_task(&mut record, "max_steps_reached");
            record.touch();
            let _ = self.persist(&record).await;
            return None;
        }

        record.metrics.cache_hit_rate = self.cache.lock().stats().hit_rate;

        let interval = record.config.planning_interval;
        let interval_refresh = interval > 0 && record.step_count % interval == 0;
        if interval_refresh {
            record.metrics.plan_refreshes += 1;
        }
        let force_refresh = interval_refresh || record.plan.is_none();

        let task = record
            .current_task()
            .map(|task| task.description.clone())
            .unwrap_or_default();
        let history_tail: Vec<ActionRecord> = {
            let skip = record.action_history.len().saturating_sub(8);
            record.action_history[skip..].to_vec()
        };
        let prepared = PreparedStep {
            task,
            step: record.step_count,
            config: record.config.clone(),
            browser_state: record.browser_state.clone(),
            history: history_tail,
            plan: record.plan.clone(),
            force_refresh,
        };
        record.touch();
        if let Err(err) = self.persist(&record).await {
            warn!(session = %self.id, error = %err, "failed to persist planning step");
        }
        Some(prepared)
    }

    /// Phase 3: fold the planner outcome back into the session. Returns true
    /// when another planning step should run immediately (follow-up task).
    async fn apply_planning_outcome(
        self: &Arc<Self>,
        prepared: PreparedStep,
        outcome: Result<crate::coordinator::PlanningOutcome, crate::retry::CategorizedError>,
    ) -> bool {
        let mut record = self.record.lock().await;
        if record.state != LifecycleState::Planning {
            // Paused or terminated while the model was thinking; account for
            // the call but apply nothing.
            if let Ok(planning) = &outcome {
                record.metrics.llm_calls += planning.attempts;
                record.metrics.llm_tokens += planning.usage.total();
                record.touch();
                let _ = self.persist(&record).await;
            }
            return false;
        }

        let started_at = Utc::now();
        match outcome {
            Ok(planning) => {
                record.metrics.llm_calls += planning.attempts;
                record.metrics.llm_tokens += planning.usage.total();
                if planning.attempts > 1 {
                    record.metrics.retried_actions += planning.attempts - 1;
                }
                self.log_threats(&mut record, &planning.threats, "dom");

                let output = planning.output;
                let current_url = record.browser_state.as_ref().map(|s| s.url.clone());
                record.planner_history.push(PlannerRecord {
                    step: prepared.step,
                    task: prepared.task.clone(),
                    url: current_url,
                    reasoning: (!output.reasoning.is_empty()).then(|| output.reasoning.clone()),
                    next_action: output.next_action.as_ref().map(|action| action.kind),
                    task_complete: output.task_complete,
                    started_at,
                    finished_at: Utc::now(),
                });

                if let Some(fresh) = output.plan {
                    let reason = if prepared.force_refresh {
                        "interval refresh"
                    } else {
                        "planner revision"
                    };
                    record.plan = Some(planner::revise_plan(record.plan.take(), fresh, reason));
                }
                self.emit(
                    SessionEvent::new(EventType::PlanGenerated, EventActor::Planner, record.state)
                        .with_data(json!({
                            "step": prepared.step,
                            "confidence": output.confidence,
                            "taskComplete": output.task_complete,
                        })),
                );

                if output.task_complete {
                    return self
                        .complete_current_task(&mut record, output.result.as_deref())
                        .await;
                }

                let Some(action) = output.next_action else {
                    // Parser guarantees an action for non-terminal replies.
                    self.fail_current_task(&mut record, "planner returned no action");
                    record.touch();
                    let _ = self.persist(&record).await;
                    return false;
                };

                let coordinator = match self.coordinator() {
                    Ok(coordinator) => coordinator,
                    Err(_) => return false,
                };
                match coordinator.act(&action, &record.config) {
                    Ok(actor_outcome) if actor_outcome.task_complete => {
                        return self
                            .complete_current_task(
                                &mut record,
                                actor_outcome.completion_result.as_deref(),
                            )
                            .await;
                    }
                    Ok(_) => {
                        self.queue.enqueue(action.clone());
                        record.queued_action = Some(action);
                        record.state = LifecycleState::WaitingForBrowser;
                        record.touch();
                        if let Err(err) = self.persist(&record).await {
                            warn!(session = %self.id, error = %err, "failed to persist queued action");
                        }
                        false
                    }
                    Err(err) => {
                        warn!(session = %self.id, error = %err, "planner emitted rejected action");
                        self.fail_current_task(&mut record, &err.to_string());
                        record.touch();
                        let _ = self.persist(&record).await;
                        false
                    }
                }
            }
            Err(categorized) => {
                record.metrics.llm_calls += categorized.attempts;
                if categorized.attempts > 1 {
                    record.metrics.retried_actions += categorized.attempts - 1;
                }
                match categorized.recovery() {
                    RecoveryAction::Pause => {
                        record.state = LifecycleState::Paused;
                        if let Some(task) = record.current_task_mut() {
                            task.status = TaskStatus::Paused;
                        }
                        self.emit(
                            SessionEvent::new(
                                EventType::TaskPause,
                                EventActor::System,
                                record.state,
                            )
                            .with_data(json!({
                                "reason": "user input required",
                                "message": categorized.message,
                            })),
                        );
                    }
                    _ => {
                        self.fail_current_task(&mut record, &categorized.message);
                    }
                }
                record.touch();
                let _ = self.persist(&record).await;
                false
            }
        }
    }

    /// Finalize the running task as completed; advance to a pending
    /// follow-up when one exists. Returns true when planning should continue.
    async fn complete_current_task(
        &self,
        record: &mut Session,
        result: Option<&str>,
    ) -> bool {
        if let Some(task) = record.current_task_mut() {
            task.status = TaskStatus::Completed;
            task.completed_at = Some(Utc::now());
            task.result = result.map(str::to_string);
        }
        record.state = LifecycleState::Completed;
        self.emit(
            SessionEvent::new(EventType::TaskComplete, EventActor::Planner, record.state)
                .with_data(json!({ "result": result })),
        );
        info!(session = %self.id, "task completed");

        if let Some(next_index) = record.next_pending_task() {
            record.current_task_index = next_index;
            record.consecutive_failures = 0;
            record.state = LifecycleState::Planning;
            record.touch();
            if let Err(err) = self.persist(record).await {
                warn!(session = %self.id, error = %err, "failed to persist task advance");
                return false;
            }
            return true;
        }

        record.touch();
        let _ = self.persist(record).await;
        false
    }

    /// Mark the running task failed and park the FSM in the error state.
    fn fail_current_task(&self, record: &mut Session, message: &str) {
        if let Some(task) = record.current_task_mut() {
            task.status = TaskStatus::Failed;
            task.completed_at = Some(Utc::now());
            task.error = Some(message.to_string());
        }
        record.state = LifecycleState::Error;
        self.emit(
            SessionEvent::new(EventType::TaskError, EventActor::System, record.state)
                .with_data(json!({ "error": message })),
        );
        warn!(session = %self.id, error = message, "task failed");
    }

    /// Replace the browser snapshot and run navigation invalidation.
    ///
    /// Fresh page content is cached only when `cache_content` is set: the
    /// result-handling cycle caches what the client just fetched, while the
    /// bare `state` ingress only invalidates.
    fn apply_browser_state(
        &self,
        record: &mut Session,
        state: BrowserState,
        announce: bool,
        cache_content: bool,
    ) {
        let old_url = record.browser_state.as_ref().map(|s| s.url.clone());
        let navigated = old_url.as_deref() != Some(state.url.as_str());

        {
            let mut cache = self.cache.lock();
            if navigated {
                cache.invalidate_for_navigation(old_url.as_deref(), &state.url);
            }
            if cache_content {
                if !state.dom.is_empty() {
                    if let Err(err) = cache.insert(ContentTier::Dom, &state.url, &state.dom) {
                        warn!(session = %self.id, error = %err, "dom cache insert failed");
                    }
                }
                if let Some(shot) = &state.screenshot {
                    if let Err(err) = cache.insert(ContentTier::Screenshot, &state.url, shot) {
                        warn!(session = %self.id, error = %err, "screenshot cache insert failed");
                    }
                }
            }
            record.metrics.cache_hit_rate = cache.stats().hit_rate;
        }

        if navigated {
            record.last_url = old_url;
        }
        record.browser_state = Some(state);

        if announce {
            let url = record
                .browser_state
                .as_ref()
                .map(|s| s.url.clone())
                .unwrap_or_default();
            self.emit(
                SessionEvent::new(EventType::StateUpdate, EventActor::User, record.state)
                    .with_data(json!({ "url": url })),
            );
        }
    }

    /// Append guardrail hits to the session log, metrics and event stream.
    fn log_threats(&self, record: &mut Session, threats: &[ThreatHit], source: &str) {
        for threat in threats {
            record.security_events.push(SecurityEvent {
                category: threat.category,
                severity: threat.severity,
                pattern: threat.pattern.clone(),
                source: source.to_string(),
                detected_at: Utc::now(),
            });
            record.metrics.security_threats_detected += 1;
            self.emit(
                SessionEvent::new(EventType::SecurityAlert, EventActor::System, record.state)
                    .with_data(json!({
                        "category": threat.category,
                        "pattern": threat.pattern,
                        "source": source,
                    }))
                    .with_severity(threat.severity),
            );
        }
    }

    /// Cache statistics snapshot for diagnostics.
    pub fn cache_stats(&self) -> webpilot_content_cache::CacheStats {
        self.cache.lock().stats()
    }

    /// Entry count of one cache tier; conformance tests observe
    /// invalidation through this.
    pub fn cache_tier_len(&self, tier: ContentTier) -> usize {
        self.cache.lock().len(tier)
    }

    /// Abort background work; used at service shutdown.
    pub fn shutdown(&self) {
        self.cancel.lock().cancel();
    }
}

/// Inputs gathered for one planning step while the lock was held.
struct PreparedStep {
    task: String,
    step: u32,
    config: SessionConfig,
    browser_state: Option<BrowserState>,
    history: Vec<ActionRecord>,
    plan: Option<crate::session::types::StrategicPlan>,
    force_refresh: bool,
}

fn state_name(state: LifecycleState) -> String {
    serde_json::to_value(state)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| format!("{state:?}"))
}
