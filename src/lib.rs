//! Webpilot: a stateful orchestrator for LLM-driven browser-automation
//! sessions.
//!
//! A thin browser client submits a natural-language task and then polls for
//! one low-level action at a time, reporting each outcome back. Per session
//! the engine runs a Plan/Act/Report loop against an LLM provider, guarded
//! by deterministic prompt-injection filtering, bounded retries, a tiered
//! content cache and durable persistence of every state transition.

pub mod cli;
pub mod coordinator;
pub mod errors;
pub mod events;
pub mod llm;
pub mod queue;
pub mod retry;
pub mod server;
pub mod session;
pub mod storage;

pub use errors::{EngineError, ErrorCategory};
pub use server::{build_router, ServeState};
pub use session::{ExecuteSpec, ProviderFactory, SessionService};
