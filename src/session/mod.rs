pub mod engine;
pub mod service;
pub mod types;

pub use engine::{ActionResultIngress, NextActionReply, SessionHandle};
pub use service::{ExecuteSpec, OpenAiFactory, ProviderFactory, SessionService, SessionSummary};
