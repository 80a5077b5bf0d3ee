//! Anthropic Messages API provider.
//!
//! Selected by the `anthropic/` model prefix. Z.ai serves the same format
//! under `/api/anthropic`, which is what agent mode talks to by default.
//!
//! Differences from the chat-completions format:
//! - `x-api-key` and `anthropic-version` headers instead of Bearer auth
//! - the system prompt is a top-level field
//! - tool calls and results are `tool_use` / `tool_result` content blocks
//! - streaming uses typed events (`content_block_delta`, `message_stop`)

use crate::wire::{self, SseDecoder};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracecheck_core::error::ProviderError;
use tracecheck_core::message::{Message, MessageToolCall, Role};
use tracecheck_core::provider::*;
use tracing::debug;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Anthropic-format provider.
pub struct AnthropicProvider {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ProviderError::NotConfigured(format!("HTTP client: {e}")))?;

        Ok(Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/messages", self.base_url)
    }

    /// Split system messages out; Anthropic takes them as one top-level field.
    fn extract_system(messages: &[Message]) -> (Option<String>, Vec<&Message>) {
        let (system, rest): (Vec<&Message>, Vec<&Message>) =
            messages.iter().partition(|m| m.role == Role::System);
        let system = (!system.is_empty()).then(|| {
            system
                .iter()
                .map(|m| m.content.as_str())
                .collect::<Vec<_>>()
                .join("\n\n")
        });
        (system, rest)
    }

    fn to_api_messages(messages: &[&Message]) -> Vec<AnthropicMessage> {
        messages
            .iter()
            .filter_map(|msg| match msg.role {
                Role::User => Some(AnthropicMessage {
                    role: "user".into(),
                    content: AnthropicContent::Text(msg.content.clone()),
                }),
                Role::Assistant if msg.tool_calls.is_empty() => Some(AnthropicMessage {
                    role: "assistant".into(),
                    content: AnthropicContent::Text(msg.content.clone()),
                }),
                Role::Assistant => {
                    let mut blocks = Vec::new();
                    if !msg.content.is_empty() {
                        blocks.push(ContentBlock::Text {
                            text: msg.content.clone(),
                        });
                    }
                    for tc in &msg.tool_calls {
                        blocks.push(ContentBlock::ToolUse {
                            id: tc.id.clone(),
                            name: tc.name.clone(),
                            input: serde_json::from_str(&tc.arguments)
                                .unwrap_or_else(|_| serde_json::json!({})),
                        });
                    }
                    Some(AnthropicMessage {
                        role: "assistant".into(),
                        content: AnthropicContent::Blocks(blocks),
                    })
                }
                Role::Tool => Some(AnthropicMessage {
                    role: "user".into(),
                    content: AnthropicContent::Blocks(vec![ContentBlock::ToolResult {
                        tool_use_id: msg.tool_call_id.clone().unwrap_or_default(),
                        content: msg.content.clone(),
                    }]),
                }),
                Role::System => None,
            })
            .collect()
    }

    fn to_api_tools(tools: &[ToolDefinition]) -> Vec<AnthropicTool> {
        tools
            .iter()
            .map(|t| AnthropicTool {
                name: t.name.clone(),
                description: t.description.clone(),
                input_schema: t.parameters.clone(),
            })
            .collect()
    }

    fn request_body(request: &ProviderRequest, stream: bool) -> serde_json::Value {
        let (system, messages) = Self::extract_system(&request.messages);
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": Self::to_api_messages(&messages),
            "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "temperature": request.temperature,
            "stream": stream,
        });
        if let Some(system) = system {
            body["system"] = serde_json::json!(system);
        }
        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(Self::to_api_tools(&request.tools));
        }
        body
    }

    async fn send(
        &self,
        request: &ProviderRequest,
        stream: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        debug!(provider = %self.name, model = %request.model, stream, "Sending messages request");

        let mut builder = self
            .client
            .post(self.endpoint())
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&Self::request_body(request, stream));
        if stream {
            builder = builder.header("Accept", "text/event-stream");
        }

        let response = builder.send().await.map_err(wire::send_error)?;
        wire::check_status(&self.name, response).await
    }

    fn into_provider_response(resp: AnthropicResponse) -> ProviderResponse {
        let mut text = String::new();
        let mut tool_calls = Vec::new();

        for block in resp.content {
            match block {
                ResponseContentBlock::Text { text: t } => {
                    if !text.is_empty() {
                        text.push('\n');
                    }
                    text.push_str(&t);
                }
                ResponseContentBlock::ToolUse { id, name, input } => {
                    tool_calls.push(MessageToolCall {
                        id,
                        name,
                        arguments: input.to_string(),
                    });
                }
                ResponseContentBlock::Other => {}
            }
        }

        let mut message = Message::assistant(text);
        message.tool_calls = tool_calls;

        ProviderResponse {
            message,
            usage: Some(Usage::new(resp.usage.input_tokens, resp.usage.output_tokens)),
            model: resp.model,
        }
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let response = self.send(&request, false).await?;
        let api_resp: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::MalformedResponse(format!("messages body: {e}")))?;
        Ok(Self::into_provider_response(api_resp))
    }

    async fn stream(&self, request: ProviderRequest) -> Result<ChunkReceiver, ProviderError> {
        let response = self.send(&request, true).await?;
        Ok(wire::spawn_sse(
            self.name.clone(),
            response,
            MessagesStreamDecoder::default(),
        ))
    }
}

/// Decodes Messages API stream events.
///
/// Input tokens arrive in `message_start`, output tokens in `message_delta`.
#[derive(Default)]
struct MessagesStreamDecoder {
    input_tokens: u32,
    output_tokens: u32,
    saw_usage: bool,
    current_tool: Option<MessageToolCall>,
    tool_calls: Vec<MessageToolCall>,
}

impl MessagesStreamDecoder {
    fn close_tool(&mut self) {
        if let Some(tool) = self.current_tool.take() {
            self.tool_calls.push(tool);
        }
    }
}

impl SseDecoder for MessagesStreamDecoder {
    fn decode(&mut self, data: &str) -> Result<Vec<StreamChunk>, ProviderError> {
        let event: serde_json::Value = serde_json::from_str(data)
            .map_err(|e| ProviderError::MalformedResponse(format!("stream event: {e}")))?;

        match event["type"].as_str().unwrap_or("") {
            "message_start" => {
                if let Some(n) = event["message"]["usage"]["input_tokens"].as_u64() {
                    self.input_tokens = u32::try_from(n).unwrap_or(u32::MAX);
                    self.saw_usage = true;
                }
            }
            "content_block_start" => {
                let block = &event["content_block"];
                if block["type"] == "tool_use" {
                    self.close_tool();
                    self.current_tool = Some(MessageToolCall {
                        id: block["id"].as_str().unwrap_or_default().to_string(),
                        name: block["name"].as_str().unwrap_or_default().to_string(),
                        arguments: String::new(),
                    });
                }
            }
            "content_block_delta" => {
                let delta = &event["delta"];
                match delta["type"].as_str().unwrap_or("") {
                    "text_delta" => {
                        if let Some(text) = delta["text"].as_str().filter(|t| !t.is_empty()) {
                            return Ok(vec![StreamChunk::text(text)]);
                        }
                    }
                    "input_json_delta" => {
                        if let (Some(tool), Some(partial)) =
                            (self.current_tool.as_mut(), delta["partial_json"].as_str())
                        {
                            tool.arguments.push_str(partial);
                        }
                    }
                    // Thinking and signature deltas are not part of the answer.
                    _ => {}
                }
            }
            "content_block_stop" => self.close_tool(),
            "message_delta" => {
                let usage = &event["usage"];
                if let Some(n) = usage["output_tokens"].as_u64() {
                    self.output_tokens = u32::try_from(n).unwrap_or(u32::MAX);
                    self.saw_usage = true;
                }
                if let Some(n) = usage["input_tokens"].as_u64() {
                    self.input_tokens = u32::try_from(n).unwrap_or(u32::MAX);
                }
            }
            "message_stop" => return Ok(vec![self.finish()]),
            "error" => {
                let error = &event["error"];
                return Err(ProviderError::StreamInterrupted(format!(
                    "{}: {}",
                    error["type"].as_str().unwrap_or("error"),
                    error["message"].as_str().unwrap_or_default()
                )));
            }
            // ping and unknown events
            _ => {}
        }
        Ok(Vec::new())
    }

    fn finish(&mut self) -> StreamChunk {
        self.close_tool();
        let usage = self
            .saw_usage
            .then(|| Usage::new(self.input_tokens, self.output_tokens));
        let mut last = StreamChunk::finished(usage);
        last.tool_calls = std::mem::take(&mut self.tool_calls);
        last
    }
}

// --- Anthropic API types ---

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: AnthropicContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum AnthropicContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

#[derive(Debug, Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    model: String,
    content: Vec<ResponseContentBlock>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    /// Thinking and any block type added later
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}
