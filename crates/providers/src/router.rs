//! Model-prefix routing: picks the wire format a model id asks for and
//! builds the matching provider.
//!
//! `anthropic/<model>` selects the Messages API; `openai/<model>` or a bare
//! model selects chat completions. The routing prefix never reaches the
//! endpoint. Any other `vendor/model` id is sent unchanged over chat
//! completions, since some OpenAI-compatible servers expect it that way.

use crate::anthropic::AnthropicProvider;
use crate::openai_compat::OpenAiCompatProvider;
use std::sync::Arc;
use tracecheck_core::error::ProviderError;
use tracecheck_core::provider::Provider;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    OpenAiChat,
    AnthropicMessages,
}

impl std::fmt::Display for WireFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OpenAiChat => write!(f, "openai-chat"),
            Self::AnthropicMessages => write!(f, "anthropic-messages"),
        }
    }
}

/// Where a model id routes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRoute {
    pub format: WireFormat,
    /// Model name as sent on the wire
    pub wire_model: String,
}

/// Resolve the wire format for a configured model id.
pub fn route(model: &str) -> ModelRoute {
    let model = model.trim();
    if let Some(rest) = model.strip_prefix("anthropic/") {
        return ModelRoute {
            format: WireFormat::AnthropicMessages,
            wire_model: rest.to_string(),
        };
    }
    ModelRoute {
        format: WireFormat::OpenAiChat,
        wire_model: model.strip_prefix("openai/").unwrap_or(model).to_string(),
    }
}

/// Build the provider for `format` against `base_url`.
pub fn build_provider(
    name: &str,
    format: WireFormat,
    base_url: &str,
    api_key: &str,
) -> Result<Arc<dyn Provider>, ProviderError> {
    Ok(match format {
        WireFormat::OpenAiChat => Arc::new(OpenAiCompatProvider::new(name, base_url, api_key)?),
        WireFormat::AnthropicMessages => {
            Arc::new(AnthropicProvider::new(name, base_url, api_key)?)
        }
    })
}
