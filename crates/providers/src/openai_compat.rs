//! OpenAI-compatible chat-completions provider.
//!
//! Used for Z.ai's `paas/v4` endpoint and any other server exposing
//! `POST {base}/chat/completions` with Bearer auth. Supports aggregate and
//! streaming (SSE) responses and function calling.

use crate::wire::{self, SseDecoder};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tracecheck_core::error::ProviderError;
use tracecheck_core::message::{Message, MessageToolCall, Role};
use tracecheck_core::provider::*;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// An OpenAI-compatible provider.
pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
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
        format!("{}/chat/completions", self.base_url)
    }

    fn to_api_messages(messages: &[Message]) -> Vec<ApiMessage> {
        messages
            .iter()
            .map(|m| ApiMessage {
                role: m.role.as_str().to_string(),
                content: Some(m.content.clone()),
                tool_calls: (!m.tool_calls.is_empty()).then(|| {
                    m.tool_calls
                        .iter()
                        .map(|tc| ApiToolCall {
                            id: tc.id.clone(),
                            r#type: "function".into(),
                            function: ApiFunction {
                                name: tc.name.clone(),
                                arguments: tc.arguments.clone(),
                            },
                        })
                        .collect()
                }),
                tool_call_id: m.tool_call_id.clone(),
            })
            .collect()
    }

    fn to_api_tools(tools: &[ToolDefinition]) -> Vec<ApiToolDefinition> {
        tools
            .iter()
            .map(|t| ApiToolDefinition {
                r#type: "function".into(),
                function: ApiToolFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                },
            })
            .collect()
    }

    fn request_body(request: &ProviderRequest, stream: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": Self::to_api_messages(&request.messages),
            "temperature": request.temperature,
            "stream": stream,
        });
        if stream {
            body["stream_options"] = serde_json::json!({ "include_usage": true });
        }
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
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
        debug!(provider = %self.name, model = %request.model, stream, "Sending chat completion request");

        let mut builder = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&Self::request_body(request, stream));
        if stream {
            builder = builder.header("Accept", "text/event-stream");
        }

        let response = builder.send().await.map_err(wire::send_error)?;
        wire::check_status(&self.name, response).await
    }
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let response = self.send(&request, false).await?;

        let api_response: ApiResponse = response.json().await.map_err(|e| {
            ProviderError::MalformedResponse(format!("chat completion body: {e}"))
        })?;

        let choice = api_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::MalformedResponse("no choices in response".into()))?;

        let mut message = Message::assistant(choice.message.content.unwrap_or_default());
        message.tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| MessageToolCall {
                id: tc.id,
                name: tc.function.name,
                arguments: tc.function.arguments,
            })
            .collect();

        Ok(ProviderResponse {
            message,
            usage: api_response.usage.map(ApiUsage::into_usage),
            model: api_response.model.unwrap_or(request.model),
        })
    }

    async fn stream(&self, request: ProviderRequest) -> Result<ChunkReceiver, ProviderError> {
        let response = self.send(&request, true).await?;
        Ok(wire::spawn_sse(
            self.name.clone(),
            response,
            ChatStreamDecoder::default(),
        ))
    }
}

/// Decodes `chat.completion.chunk` events.
#[derive(Default)]
struct ChatStreamDecoder {
    /// Tool call deltas, keyed by index
    tool_calls: BTreeMap<u32, ToolCallAccumulator>,
    /// Latest usage seen; some servers repeat it on every event
    usage: Option<Usage>,
}

impl ChatStreamDecoder {
    fn take_tool_calls(&mut self) -> Vec<MessageToolCall> {
        std::mem::take(&mut self.tool_calls)
            .into_values()
            .map(ToolCallAccumulator::into_tool_call)
            .collect()
    }
}

impl SseDecoder for ChatStreamDecoder {
    fn decode(&mut self, data: &str) -> Result<Vec<StreamChunk>, ProviderError> {
        if data == "[DONE]" {
            return Ok(vec![self.finish()]);
        }

        let event: StreamResponse = serde_json::from_str(data)
            .map_err(|e| ProviderError::MalformedResponse(format!("stream event: {e}")))?;

        if let Some(error) = event.error {
            return Err(ProviderError::StreamInterrupted(error.to_string()));
        }

        let mut out = Vec::new();
        if let Some(choice) = event.choices.into_iter().next() {
            for delta in choice.delta.tool_calls.unwrap_or_default() {
                let acc = self.tool_calls.entry(delta.index).or_default();
                if let Some(id) = delta.id {
                    acc.id = id;
                }
                if let Some(func) = delta.function {
                    if let Some(name) = func.name {
                        acc.name = name;
                    }
                    if let Some(args) = func.arguments {
                        acc.arguments.push_str(&args);
                    }
                }
            }

            if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
                out.push(StreamChunk::text(content));
            }
        }

        // Usage can arrive on any event, so the stream only ends at
        // `[DONE]` or when the connection closes.
        if let Some(usage) = event.usage {
            self.usage = Some(usage.into_usage());
        }
        Ok(out)
    }

    fn finish(&mut self) -> StreamChunk {
        let mut last = StreamChunk::finished(self.usage.take());
        last.tool_calls = self.take_tool_calls();
        last
    }
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolCall {
    id: String,
    r#type: String,
    function: ApiFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct ApiToolDefinition {
    r#type: String,
    function: ApiToolFunction,
}

#[derive(Debug, Serialize)]
struct ApiToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<ApiChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

impl ApiUsage {
    fn into_usage(self) -> Usage {
        Usage::new(self.prompt_tokens, self.completion_tokens)
    }
}

/// A single SSE `data: {...}` event from a streaming response.
#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
    /// Some servers report mid-stream failures in-band
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCallDelta>>,
}

/// A tool call delta; arrives incrementally across events.
#[derive(Debug, Deserialize)]
struct StreamToolCallDelta {
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Default)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    arguments: String,
}

impl ToolCallAccumulator {
    fn into_tool_call(self) -> MessageToolCall {
        MessageToolCall {
            id: self.id,
            name: self.name,
            arguments: self.arguments,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, http::StatusCode, response::IntoResponse, routing::post};

    fn decode_all(decoder: &mut ChatStreamDecoder, events: &[&str]) -> Vec<StreamChunk> {
        events
            .iter()
            .flat_map(|e| decoder.decode(e).unwrap())
            .collect()
    }

    #[test]
    fn message_conversion() {
        let messages = vec![Message::system("You are helpful"), Message::user("Hello")];
        let api_messages = OpenAiCompatProvider::to_api_messages(&messages);
        assert_eq!(api_messages.len(), 2);
        assert_eq!(api_messages[0].role, "system");
        assert_eq!(api_messages[1].role, "user");
    }

    #[test]
    fn message_conversion_with_tool_calls() {
        let mut msg = Message::assistant("");
        msg.tool_calls = vec![MessageToolCall {
            id: "call_1".into(),
            name: "terminal".into(),
            arguments: r#"{"command":"ls"}"#.into(),
        }];
        let api_msgs = OpenAiCompatProvider::to_api_messages(&[msg, Message::tool_result("call_1", "ok")]);
        let tc = api_msgs[0].tool_calls.as_ref().unwrap();
        assert_eq!(tc[0].function.name, "terminal");
        assert_eq!(api_msgs[1].role, "tool");
        assert_eq!(api_msgs[1].tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn body_includes_usage_option_only_when_streaming() {
        let req = ProviderRequest::new("glm-4.7", vec![Message::user("hi")]);
        let streaming = OpenAiCompatProvider::request_body(&req, true);
        assert_eq!(streaming["stream_options"]["include_usage"], true);
        let aggregate = OpenAiCompatProvider::request_body(&req, false);
        assert!(aggregate.get("stream_options").is_none());
        assert!(aggregate.get("tools").is_none());
    }

    #[test]
    fn decoder_emits_content_then_usage() {
        let mut decoder = ChatStreamDecoder::default();
        let chunks = decode_all(
            &mut decoder,
            &[
                r#"{"choices":[{"delta":{"role":"assistant","content":""}}]}"#,
                r#"{"choices":[{"delta":{"content":"Hello"}}]}"#,
                r#"{"choices":[{"delta":{"content":" world"},"finish_reason":"stop"}]}"#,
                r#"{"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15}}"#,
                "[DONE]",
            ],
        );
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].content.as_deref(), Some("Hello"));
        assert_eq!(chunks[1].content.as_deref(), Some(" world"));
        assert!(chunks[2].done);
        assert_eq!(chunks[2].usage, Some(Usage::new(10, 5)));
    }

    #[test]
    fn usage_on_every_event_does_not_end_the_stream() {
        let mut decoder = ChatStreamDecoder::default();
        let chunks = decode_all(
            &mut decoder,
            &[
                r#"{"choices":[{"delta":{"content":"Hello"}}],"usage":{"prompt_tokens":10,"completion_tokens":1}}"#,
                r#"{"choices":[{"delta":{"content":" world"}}],"usage":{"prompt_tokens":10,"completion_tokens":2}}"#,
            ],
        );
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| !c.done));

        // Connection closed without [DONE]: the latest usage is kept.
        let last = decoder.finish();
        assert!(last.done);
        assert_eq!(last.usage, Some(Usage::new(10, 2)));
    }

    #[test]
    fn decoder_assembles_tool_call_deltas() {
        let mut decoder = ChatStreamDecoder::default();
        let chunks = decode_all(
            &mut decoder,
            &[
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_abc","function":{"name":"terminal","arguments":""}}]}}]}"#,
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"command\""}}]}}]}"#,
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":":\"ls\"}"}}]}}]}"#,
                "[DONE]",
            ],
        );
        assert_eq!(chunks.len(), 1);
        let last = &chunks[0];
        assert!(last.done);
        assert_eq!(last.tool_calls.len(), 1);
        assert_eq!(last.tool_calls[0].id, "call_abc");
        assert_eq!(last.tool_calls[0].arguments, r#"{"command":"ls"}"#);
    }

    #[test]
    fn decoder_rejects_garbage() {
        let mut decoder = ChatStreamDecoder::default();
        let err = decoder.decode("not json").unwrap_err();
        assert!(matches!(err, ProviderError::MalformedResponse(_)));
    }

    #[test]
    fn decoder_surfaces_in_band_errors() {
        let mut decoder = ChatStreamDecoder::default();
        let err = decoder
            .decode(r#"{"error":{"code":"1113","message":"Insufficient balance"}}"#)
            .unwrap_err();
        assert!(matches!(err, ProviderError::StreamInterrupted(m) if m.contains("Insufficient")));
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn stream_over_http() {
        let sse = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"},\"finish_reason\":\"stop\"}]}\n\n",
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":7,\"completion_tokens\":2}}\n\n",
            "data: [DONE]\n\n",
        );
        let app = Router::new().route(
            "/chat/completions",
            post(move || async move { ([("content-type", "text/event-stream")], sse) }),
        );
        let base = serve(app).await;

        let provider = OpenAiCompatProvider::new("zai", &base, "sk-test").unwrap();
        let mut rx = provider
            .stream(ProviderRequest::new("glm-4.7", vec![Message::user("hi")]))
            .await
            .unwrap();

        let mut text = String::new();
        let mut usage = None;
        while let Some(chunk) = rx.recv().await {
            let chunk = chunk.unwrap();
            text.push_str(chunk.content.as_deref().unwrap_or(""));
            if chunk.done {
                usage = chunk.usage;
            }
        }
        assert_eq!(text, "Hello");
        assert_eq!(usage, Some(Usage::new(7, 2)));
    }

    #[tokio::test]
    async fn complete_over_http() {
        let app = Router::new().route(
            "/chat/completions",
            post(|| async {
                Json(serde_json::json!({
                    "model": "glm-4.7",
                    "choices": [{"message": {"role": "assistant", "content": "pong"}}],
                    "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4}
                }))
            }),
        );
        let base = serve(app).await;

        let provider = OpenAiCompatProvider::new("zai", &base, "sk-test").unwrap();
        let resp = provider
            .complete(ProviderRequest::new("glm-4.7", vec![Message::user("ping")]))
            .await
            .unwrap();
        assert_eq!(resp.message.content, "pong");
        assert_eq!(resp.usage, Some(Usage::new(3, 1)));
    }

    #[tokio::test]
    async fn http_status_maps_to_error_kind() {
        let app = Router::new().route(
            "/chat/completions",
            post(|| async { (StatusCode::UNAUTHORIZED, "invalid api key").into_response() }),
        );
        let base = serve(app).await;

        let provider = OpenAiCompatProvider::new("zai", &base, "bad").unwrap();
        let err = provider
            .complete(ProviderRequest::new("glm-4.7", vec![Message::user("ping")]))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::AuthenticationFailed(m) if m.contains("invalid")));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_network_error() {
        let provider = OpenAiCompatProvider::new("zai", "http://127.0.0.1:1", "sk").unwrap();
        let err = provider
            .complete(ProviderRequest::new("glm-4.7", vec![Message::user("ping")]))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Network(_) | ProviderError::Timeout(_)));
    }
}
