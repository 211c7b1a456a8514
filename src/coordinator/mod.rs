//! Multi-agent coordinator: one owner for the Planner, Actor and Extractor
//! roles, all sharing a single LLM chat capability.
//!
//! Every model call goes through the guardrail (untrusted content is
//! sanitized and boundary-wrapped) and the retry executor. Outcomes carry
//! token usage, attempt counts and guardrail hits so the session can fold
//! them into its metrics without handing the coordinator a session
//! reference.

pub mod actor;
pub mod planner;
pub mod prompt;

mod extractor;

pub use actor::ActorOutcome;
pub use planner::{PlannerOutput, PlanningContext};

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::debug;

use webpilot_guardrail::{sanitize, wrap_untrusted, ThreatHit};

use crate::errors::EngineError;
use crate::llm::{ChatMessage, LlmProvider, TokenUsage};
use crate::retry::{execute_with_retry, CategorizedError};
use crate::session::types::{Action, SessionConfig};

/// Sampling temperature for planning calls.
const PLANNER_TEMPERATURE: f32 = 0.2;
/// Extraction is deterministic.
const EXTRACTOR_TEMPERATURE: f32 = 0.0;

/// Result of one planning call, including its side reports.
pub struct PlanningOutcome {
    pub output: PlannerOutput,
    pub usage: TokenUsage,
    /// Chat attempts consumed, including retried failures.
    pub attempts: u32,
    pub threats: Vec<ThreatHit>,
}

/// Result of one extraction call.
pub struct ExtractionOutcome {
    pub data: Map<String, Value>,
    pub confidence: f64,
    pub usage: TokenUsage,
    pub attempts: u32,
    pub threats: Vec<ThreatHit>,
}

pub struct Coordinator {
    provider: Arc<dyn LlmProvider>,
}

impl Coordinator {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> &Arc<dyn LlmProvider> {
        &self.provider
    }

    /// Run one planning decision.
    pub async fn plan(
        &self,
        ctx: PlanningContext<'_>,
        config: &SessionConfig,
    ) -> Result<PlanningOutcome, CategorizedError> {
        let mut threats = Vec::new();
        let sanitized_dom = ctx.browser_state.map(|state| {
            let outcome = sanitize(&state.dom, config.strict_security);
            threats.extend(outcome.threats.iter().cloned());
            wrap_untrusted(&outcome.text)
        });

        let system = prompt::planner_system_prompt(
            config.tools_enabled.as_deref(),
            config.max_actions_per_step,
        );
        let attach_screenshot = ctx.vision && self.provider.supports_vision();
        let messages =
            planner::planning_messages(&ctx, system, sanitized_dom.as_deref(), attach_screenshot);

        let ((output, usage), attempts) = self
            .invoke(&messages, PLANNER_TEMPERATURE, config, "planner", |text| {
                planner::parse_planner_reply(text)
            })
            .await?;

        debug!(
            step = ctx.step,
            attempts,
            task_complete = output.task_complete,
            "planner decision ready"
        );
        Ok(PlanningOutcome {
            output,
            usage,
            attempts,
            threats,
        })
    }

    /// Validate and resolve a single action (Actor role).
    pub fn act(&self, action: &Action, config: &SessionConfig) -> Result<ActorOutcome, EngineError> {
        actor::evaluate(action, config)
    }

    /// Extract named fields from untrusted content (Extractor role).
    pub async fn extract(
        &self,
        fields: &[String],
        content: &str,
        extraction_prompt: Option<&str>,
        config: &SessionConfig,
    ) -> Result<ExtractionOutcome, CategorizedError> {
        let sanitized = sanitize(content, config.strict_security);
        let threats = sanitized.threats.clone();
        let wrapped = wrap_untrusted(&sanitized.text);

        let messages = vec![
            ChatMessage::system(prompt::extractor_system_prompt(fields, extraction_prompt)),
            ChatMessage::user(wrapped),
        ];

        let ((extracted, usage), attempts) = self
            .invoke(
                &messages,
                EXTRACTOR_TEMPERATURE,
                config,
                "extractor",
                |text| extractor::parse_extraction_reply(text, fields),
            )
            .await?;

        Ok(ExtractionOutcome {
            data: extracted.data,
            confidence: extracted.confidence,
            usage,
            attempts,
            threats,
        })
    }

    /// Shared chat-then-parse loop under the retry executor.
    async fn invoke<T, P>(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        config: &SessionConfig,
        context: &str,
        parse: P,
    ) -> Result<((T, TokenUsage), u32), CategorizedError>
    where
        P: Fn(&str) -> Result<T, EngineError>,
    {
        let provider = &self.provider;
        let parse = &parse;
        execute_with_retry(
            move || {
                let provider = Arc::clone(provider);
                let messages = messages.to_vec();
                async move {
                    let outcome = provider.chat(&messages, temperature).await?;
                    let parsed = parse(&outcome.text)?;
                    Ok((parsed, outcome.usage))
                }
            },
            &config.retry_strategy,
            context,
        )
        .await
    }
}
