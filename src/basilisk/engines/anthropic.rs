//! Anthropic engine.
//!
//! Speaks the messages API directly: `x-api-key` / `anthropic-version`
//! headers, the system prompt as a top-level parameter rather than a message,
//! content blocks for attachments, and `content_block_delta` stream events.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::basilisk::account::Account;
use crate::basilisk::conversation::{Conversation, Message, MessageBlock, SystemMessage};
use crate::basilisk::engine::{CompletionHandle, ModelDescriptor, ProviderEngine};
use crate::basilisk::engines::common::{
    check_status, get_shared_http_client, normalize_linesep, split_data_url, sse_text_stream,
    SseEvents,
};
use crate::basilisk::error::BasiliskError;
use crate::basilisk::provider::{get_provider, Capability};
use crate::basilisk::storage::{ImageRequestOptions, RequestSource, StorageRoot};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Max-output fallback when neither the block nor the descriptor supplies
/// one; the messages API requires `max_tokens`.
const DEFAULT_MAX_TOKENS: u32 = 4_096;

/// Client for Anthropic's messages API.
pub struct AnthropicEngine {
    api_key: String,
    base_url: String,
    image_options: ImageRequestOptions,
}

impl AnthropicEngine {
    pub fn from_account(account: &Account) -> Result<Self, BasiliskError> {
        account.validate()?;
        let api_key = account.api_key.clone().ok_or_else(|| {
            BasiliskError::Credential("Anthropic API key is required".to_string())
        })?;
        Ok(AnthropicEngine {
            api_key,
            base_url: account
                .base_url()
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            image_options: ImageRequestOptions::default(),
        })
    }

    pub fn with_api_key(api_key: &str) -> Self {
        AnthropicEngine {
            api_key: api_key.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            image_options: ImageRequestOptions::default(),
        }
    }

    pub fn set_image_options(&mut self, options: ImageRequestOptions) {
        self.image_options = options;
    }

    fn content_blocks(
        &self,
        message: &Message,
        store: &StorageRoot,
    ) -> Result<Value, BasiliskError> {
        if message.attachments.is_empty() {
            return Ok(Value::String(message.content.clone()));
        }
        let mut blocks = Vec::new();
        if !message.content.is_empty() {
            blocks.push(json!({"type": "text", "text": message.content}));
        }
        for attachment in &message.attachments {
            let source = store.resolve_for_request(attachment, &self.image_options)?;
            if attachment.is_image() {
                let block = match &source {
                    RequestSource::Url(url) => json!({
                        "type": "image",
                        "source": {"type": "url", "url": url},
                    }),
                    RequestSource::DataUrl(url) => {
                        let (media_type, data) = split_data_url(url).ok_or_else(|| {
                            BasiliskError::Content("malformed image data URL".to_string())
                        })?;
                        json!({
                            "type": "image",
                            "source": {
                                "type": "base64",
                                "media_type": media_type,
                                "data": data,
                            },
                        })
                    }
                };
                blocks.push(block);
            } else if attachment.mime() == Some("application/pdf") {
                if let RequestSource::DataUrl(url) = &source {
                    let (media_type, data) = split_data_url(url).ok_or_else(|| {
                        BasiliskError::Content("malformed document data URL".to_string())
                    })?;
                    blocks.push(json!({
                        "type": "document",
                        "source": {
                            "type": "base64",
                            "media_type": media_type,
                            "data": data,
                        },
                    }));
                }
            } else {
                let bytes = store.attachment_bytes(attachment)?;
                blocks.push(json!({
                    "type": "text",
                    "text": format!("[{}]\n{}", attachment.name(), String::from_utf8_lossy(&bytes)),
                }));
            }
        }
        Ok(Value::Array(blocks))
    }

    async fn post_messages(&self, body: &Value) -> Result<reqwest::Response, BasiliskError> {
        let url = format!("{}/messages", self.base_url);
        let response = get_shared_http_client()
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(body)
            .send()
            .await?;
        check_status(response).await
    }
}

#[async_trait]
impl ProviderEngine for AnthropicEngine {
    fn provider_id(&self) -> &str {
        "anthropic"
    }

    fn capabilities(&self) -> &'static [Capability] {
        get_provider("anthropic")
            .expect("anthropic in catalogue")
            .capabilities
    }

    fn models(&self) -> Vec<ModelDescriptor> {
        vec![
            ModelDescriptor {
                id: "claude-opus-4-1".to_string(),
                name: "Claude Opus 4.1".to_string(),
                context_window: 200_000,
                max_output_tokens: 32_000,
                default_temperature: 1.0,
                max_temperature: 1.0,
                vision: true,
                reasoning: true,
                prefer_responses_api: false,
            },
            ModelDescriptor {
                id: "claude-sonnet-4-0".to_string(),
                name: "Claude Sonnet 4".to_string(),
                context_window: 200_000,
                max_output_tokens: 64_000,
                default_temperature: 1.0,
                max_temperature: 1.0,
                vision: true,
                reasoning: true,
                prefer_responses_api: false,
            },
            ModelDescriptor {
                id: "claude-3-5-haiku-latest".to_string(),
                name: "Claude Haiku 3.5".to_string(),
                context_window: 200_000,
                max_output_tokens: 8_192,
                default_temperature: 1.0,
                max_temperature: 1.0,
                vision: true,
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
        let store = &conversation.storage_root;
        let mut messages = Vec::new();
        for block in &conversation.messages {
            messages.push(json!({
                "role": "user",
                "content": self.content_blocks(&block.request, store)?,
            }));
            if let Some(response) = &block.response {
                messages.push(json!({"role": "assistant", "content": response.content}));
            }
        }
        messages.push(json!({
            "role": "user",
            "content": self.content_blocks(&new_block.request, store)?,
        }));

        let max_tokens = new_block
            .max_tokens
            .or_else(|| self.model(&new_block.model.model_id).map(|m| m.max_output_tokens))
            .unwrap_or(DEFAULT_MAX_TOKENS);
        let mut payload = json!({
            "model": new_block.model.model_id,
            "messages": messages,
            "max_tokens": max_tokens,
            "stream": stream,
        });
        if let Some(system) = system {
            payload["system"] = json!(system.content);
        }
        if let Some(temperature) = new_block.temperature {
            payload["temperature"] = json!(temperature);
        }
        if let Some(top_p) = new_block.top_p {
            payload["top_p"] = json!(top_p);
        }
        Ok(payload)
    }

    async fn completion(
        &self,
        conversation: &Conversation,
        new_block: &MessageBlock,
        system: Option<&SystemMessage>,
    ) -> Result<CompletionHandle, BasiliskError> {
        let stream = new_block.stream;
        let payload = self.prepare_request(conversation, new_block, system, stream)?;
        let response = self.post_messages(&payload).await?;
        if stream {
            Ok(CompletionHandle::Stream(sse_text_stream(
                SseEvents::new(response),
                |value| {
                    if value["type"].as_str() == Some("content_block_delta") {
                        value["delta"]["text"]
                            .as_str()
                            .filter(|s| !s.is_empty())
                            .map(str::to_string)
                    } else {
                        None
                    }
                },
            )))
        } else {
            let value = response.json::<Value>().await?;
            Ok(CompletionHandle::Full(value))
        }
    }

    /// Messages-API payloads carry content as an array of typed blocks; the
    /// text blocks are concatenated.
    fn extract_final(&self, payload: &Value, mut new_block: MessageBlock) -> MessageBlock {
        let mut text = String::new();
        if let Some(blocks) = payload["content"].as_array() {
            for block in blocks {
                if block["type"].as_str() == Some("text") {
                    if let Some(fragment) = block["text"].as_str() {
                        text.push_str(fragment);
                    }
                }
            }
        }
        new_block.response = Some(Message::assistant(normalize_linesep(&text)));
        new_block
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basilisk::conversation::AiModelRef;

    #[test]
    fn system_is_a_top_level_parameter() {
        let engine = AnthropicEngine::with_api_key("test-key");
        let conversation = Conversation::new();
        let block = MessageBlock::new(
            Message::user("hello"),
            AiModelRef::new("anthropic", "claude-sonnet-4-0"),
        );
        let system = SystemMessage::new("be terse");
        let payload = engine
            .prepare_request(&conversation, &block, Some(&system), false)
            .unwrap();
        assert_eq!(payload["system"], json!("be terse"));
        let roles: Vec<&str> = payload["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["role"].as_str().unwrap())
            .collect();
        assert_eq!(roles, vec!["user"]);
        // max_tokens falls back to the descriptor.
        assert_eq!(payload["max_tokens"], json!(64_000));
    }

    #[test]
    fn extract_final_concatenates_text_blocks() {
        let engine = AnthropicEngine::with_api_key("test-key");
        let block = MessageBlock::new(
            Message::user("hello"),
            AiModelRef::new("anthropic", "claude-sonnet-4-0"),
        );
        let payload = json!({"content": [
            {"type": "text", "text": "Hel"},
            {"type": "text", "text": "lo"},
        ]});
        let sealed = engine.extract_final(&payload, block);
        assert_eq!(sealed.response.unwrap().content, "Hello");
    }
}
