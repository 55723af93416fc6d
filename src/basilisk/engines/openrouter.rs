//! OpenRouter engine.
//!
//! OpenRouter fronts many upstream models behind an OpenAI-compatible chat
//! surface, so the HTTP work is delegated the same way as Mistral.  The one
//! OpenRouter-specific behaviour is citations: web-search-capable routes
//! return `annotations` on the assistant message, which are carried into the
//! sealed block as an opaque payload.

use async_trait::async_trait;
use serde_json::Value;

use crate::basilisk::account::Account;
use crate::basilisk::conversation::{Conversation, Message, MessageBlock, SystemMessage};
use crate::basilisk::engine::{CompletionHandle, ModelDescriptor, ProviderEngine};
use crate::basilisk::engines::common::{extract_citations, final_content, normalize_linesep};
use crate::basilisk::error::BasiliskError;
use crate::basilisk::provider::{get_provider, Capability};

use super::openai::OpenAiEngine;

const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// Client for OpenRouter's unified chat API.
pub struct OpenRouterEngine {
    delegate: OpenAiEngine,
}

impl OpenRouterEngine {
    pub fn from_account(account: &Account) -> Result<Self, BasiliskError> {
        account.validate()?;
        let api_key = account.api_key.clone().ok_or_else(|| {
            BasiliskError::Credential("OpenRouter API key is required".to_string())
        })?;
        Ok(OpenRouterEngine {
            delegate: OpenAiEngine::with_base_url(
                &api_key,
                account.base_url().unwrap_or(DEFAULT_BASE_URL),
            ),
        })
    }

    pub fn with_api_key(api_key: &str) -> Self {
        OpenRouterEngine {
            delegate: OpenAiEngine::with_base_url(api_key, DEFAULT_BASE_URL),
        }
    }
}

#[async_trait]
impl ProviderEngine for OpenRouterEngine {
    fn provider_id(&self) -> &str {
        "openrouter"
    }

    fn capabilities(&self) -> &'static [Capability] {
        get_provider("openrouter")
            .expect("openrouter in catalogue")
            .capabilities
    }

    fn models(&self) -> Vec<ModelDescriptor> {
        vec![
            ModelDescriptor {
                id: "openai/gpt-4o".to_string(),
                name: "GPT-4o (OpenRouter)".to_string(),
                context_window: 128_000,
                max_output_tokens: 16_384,
                default_temperature: 1.0,
                max_temperature: 2.0,
                vision: true,
                reasoning: false,
                prefer_responses_api: false,
            },
            ModelDescriptor {
                id: "anthropic/claude-sonnet-4".to_string(),
                name: "Claude Sonnet 4 (OpenRouter)".to_string(),
                context_window: 200_000,
                max_output_tokens: 64_000,
                default_temperature: 1.0,
                max_temperature: 1.0,
                vision: true,
                reasoning: true,
                prefer_responses_api: false,
            },
            ModelDescriptor {
                id: "perplexity/sonar".to_string(),
                name: "Perplexity Sonar (OpenRouter)".to_string(),
                context_window: 127_000,
                max_output_tokens: 8_192,
                default_temperature: 0.7,
                max_temperature: 2.0,
                vision: false,
                reasoning: false,
                prefer_responses_api: false,
            },
        ]
    }

    fn prepare_request(
        &self,
        conversation: &Conversation,
        new_block: &MessageBlock,
        system: Option<&SystemMessage>,
        stream: bool,
    ) -> Result<Value, BasiliskError> {
        self.delegate
            .prepare_request(conversation, new_block, system, stream)
    }

    async fn completion(
        &self,
        conversation: &Conversation,
        new_block: &MessageBlock,
        system: Option<&SystemMessage>,
    ) -> Result<CompletionHandle, BasiliskError> {
        self.delegate.completion(conversation, new_block, system).await
    }

    /// Chat extraction plus citation annotations when the route returned any.
    fn extract_final(&self, payload: &Value, mut new_block: MessageBlock) -> MessageBlock {
        let mut response = Message::assistant(normalize_linesep(&final_content(payload)));
        response.citations = extract_citations(payload);
        new_block.response = Some(response);
        new_block
    }
}
