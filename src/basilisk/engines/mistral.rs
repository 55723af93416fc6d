//! MistralAI engine, routed through the OpenAI-compatible surface.
//!
//! Mistral's chat endpoint is wire-compatible with OpenAI chat completions,
//! so this engine delegates the HTTP work to an [`OpenAiEngine`] pointed at
//! the Mistral base URL and only supplies its own identity and model list.

use async_trait::async_trait;
use serde_json::Value;

use crate::basilisk::account::Account;
use crate::basilisk::conversation::{Conversation, MessageBlock, SystemMessage};
use crate::basilisk::engine::{CompletionHandle, ModelDescriptor, ProviderEngine};
use crate::basilisk::error::BasiliskError;
use crate::basilisk::provider::{get_provider, Capability};

use super::openai::OpenAiEngine;

const DEFAULT_BASE_URL: &str = "https://api.mistral.ai/v1";

/// Client for MistralAI's chat API.
pub struct MistralEngine {
    delegate: OpenAiEngine,
}

impl MistralEngine {
    pub fn from_account(account: &Account) -> Result<Self, BasiliskError> {
        account.validate()?;
        let api_key = account.api_key.clone().ok_or_else(|| {
            BasiliskError::Credential("Mistral API key is required".to_string())
        })?;
        Ok(MistralEngine {
            delegate: OpenAiEngine::with_base_url(
                &api_key,
                account.base_url().unwrap_or(DEFAULT_BASE_URL),
            ),
        })
    }

    pub fn with_api_key(api_key: &str) -> Self {
        MistralEngine {
            delegate: OpenAiEngine::with_base_url(api_key, DEFAULT_BASE_URL),
        }
    }
}

#[async_trait]
impl ProviderEngine for MistralEngine {
    fn provider_id(&self) -> &str {
        "mistralai"
    }

    fn capabilities(&self) -> &'static [Capability] {
        get_provider("mistralai")
            .expect("mistralai in catalogue")
            .capabilities
    }

    fn models(&self) -> Vec<ModelDescriptor> {
        vec![
            ModelDescriptor {
                id: "mistral-large-latest".to_string(),
                name: "Mistral Large".to_string(),
                context_window: 128_000,
                max_output_tokens: 8_192,
                default_temperature: 0.7,
                max_temperature: 1.0,
                vision: false,
                reasoning: false,
                prefer_responses_api: false,
            },
            ModelDescriptor {
                id: "mistral-small-latest".to_string(),
                name: "Mistral Small".to_string(),
                context_window: 32_000,
                max_output_tokens: 8_192,
                default_temperature: 0.7,
                max_temperature: 1.0,
                vision: false,
                reasoning: false,
                prefer_responses_api: false,
            },
            ModelDescriptor {
                id: "codestral-latest".to_string(),
                name: "Codestral".to_string(),
                context_window: 256_000,
                max_output_tokens: 8_192,
                default_temperature: 0.3,
                max_temperature: 1.0,
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
        // Mistral model ids never prefer the responses API, so the delegate
        // always produces the chat shape.
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
}
