//! Reasoning round: send the request, interpret the reply.

pub mod client;
pub mod parse;
pub mod types;

pub use client::{ChatCompletionClient, DecisionClient, LlmConfig, RetryingClient, SYSTEM_PROMPT};
pub use parse::parse;
pub use types::{
    DecisionOutcome, HealAction, HealTarget, NoopAction, PatchOp, PatchOperation,
    RemediationProposal, RiskLevel,
};
