//! Model endpoints for tracecheck.
//!
//! Two wire formats implement `tracecheck_core::Provider`: OpenAI-style chat
//! completions and the Anthropic Messages API. The router picks one from the
//! model id, and [`LlmClient`] wraps the result with tracing and usage
//! accounting.

pub mod anthropic;
pub mod client;
pub mod openai_compat;
pub mod router;
mod wire;

pub use anthropic::AnthropicProvider;
pub use client::{ExporterSelection, LlmClient, LlmClientBuilder, ResponseStream};
pub use openai_compat::OpenAiCompatProvider;
pub use router::{ModelRoute, WireFormat, build_provider, route};
