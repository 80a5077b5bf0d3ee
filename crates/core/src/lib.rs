//! # tracecheck core
//!
//! Domain types, traits, and error definitions shared by every tracecheck
//! crate. Nothing here performs I/O: the `Provider` and `Tool` traits are
//! implemented in `tracecheck-providers` and `tracecheck-tools`, and the
//! harness wires them together.

pub mod error;
pub mod message;
pub mod provider;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use error::{Error, ProviderError, Result, ToolError};
pub use message::{Conversation, ConversationId, Message, MessageToolCall, Role};
pub use provider::{
    ChunkReceiver, Provider, ProviderRequest, ProviderResponse, RequestMetadata, StreamChunk,
    ToolDefinition, Usage,
};
pub use tool::{Tool, ToolCall, ToolRegistry, ToolResult};
