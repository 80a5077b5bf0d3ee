//! The tracecheck agent.
//!
//! An [`Agent`] binds an [`LlmClient`](tracecheck_providers::LlmClient) to a
//! tool registry. A [`Conversation`] holds the message history: `submit`
//! queues a user message and `run_to_completion` drives the model through
//! tool calls until it answers.

pub mod agent;
pub mod conversation;

#[cfg(test)]
mod test_helpers;

pub use agent::{Agent, DEFAULT_MAX_ITERATIONS};
pub use conversation::{Conversation, FinishReason, RunOutcome};
