//! Shared test helpers for the agent loop tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracecheck_config::{HarnessConfig, Mode, Overrides};
use tracecheck_core::error::ProviderError;
use tracecheck_core::message::{Message, MessageToolCall};
use tracecheck_core::provider::{Provider, ProviderRequest, ProviderResponse, Usage};
use tracecheck_providers::LlmClient;

/// A mock provider that returns a sequence of scripted results.
///
/// Each call to `complete` returns the next result in the queue.
/// Panics if more calls are made than results provided.
pub struct ScriptedProvider {
    responses: Mutex<Vec<Result<ProviderResponse, ProviderError>>>,
    call_count: Mutex<usize>,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<Result<ProviderResponse, ProviderError>>) -> Self {
        Self {
            responses: Mutex::new(responses),
            call_count: Mutex::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        *self.call_count.lock().unwrap()
    }
}

#[async_trait::async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let mut count = self.call_count.lock().unwrap();
        let responses = self.responses.lock().unwrap();
        let result = responses.get(*count).cloned().unwrap_or_else(|| {
            panic!(
                "ScriptedProvider: no more responses (call #{}, have {})",
                *count,
                responses.len()
            )
        });
        *count += 1;
        result
    }
}

pub fn text_response(text: &str) -> ProviderResponse {
    ProviderResponse {
        message: Message::assistant(text),
        usage: Some(Usage::new(10, 5)),
        model: "glm-4.7".into(),
    }
}

pub fn tool_call_response(id: &str, name: &str, arguments: &str) -> ProviderResponse {
    let mut message = Message::assistant("");
    message.tool_calls = vec![MessageToolCall {
        id: id.into(),
        name: name.into(),
        arguments: arguments.into(),
    }];
    ProviderResponse {
        message,
        usage: Some(Usage::new(20, 8)),
        model: "glm-4.7".into(),
    }
}

/// A client for `glm-4.7` talking to `provider`, exporting nowhere.
pub fn client_with(provider: Arc<ScriptedProvider>) -> LlmClient {
    let env: HashMap<&str, &str> = [
        ("ZAI_API_KEY", "sk-test"),
        ("ZAI_BASE_URL", "http://127.0.0.1:9"),
        ("LLM_MODEL", "glm-4.7"),
    ]
    .into_iter()
    .collect();
    let config = HarnessConfig::from_lookup(Mode::Agent, None, Overrides::default(), |k| {
        env.get(k).map(|v| v.to_string())
    })
    .unwrap();
    LlmClient::builder(&config)
        .provider(provider)
        .exporters(Vec::<String>::new())
        .build()
        .unwrap()
}
