//! OpenAI engine.
//!
//! Speaks both of OpenAI's endpoint families: classic chat completions and
//! the responses API (input items in, typed events out).  Endpoint selection
//! follows the model descriptor's `prefer_responses_api` flag, with one
//! runtime fallback to the chat path when the responses call fails.
//!
//! Beyond text, this engine backs the OCR worker (vision prompt per image,
//! progress per attachment) and audio transcription (multipart upload).

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::basilisk::account::Account;
use crate::basilisk::attachment::Attachment;
use crate::basilisk::conversation::{Conversation, MessageBlock, SystemMessage};
use crate::basilisk::engine::{CompletionHandle, ModelDescriptor, ProviderEngine};
use crate::basilisk::engines::common::{
    chat_completion, chat_final_content, chat_messages, chat_payload, get_shared_http_client,
    message_content, normalize_linesep, post_bearer_json, responses_final_content, sse_text_stream,
    check_status, SseEvents,
};
use crate::basilisk::error::BasiliskError;
use crate::basilisk::provider::{get_provider, Capability};
use crate::basilisk::storage::{ImageRequestOptions, StorageRoot};
use crate::basilisk::worker::{CancelFlag, WorkerSender};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Model used for OCR when the caller does not pick one.
const OCR_MODEL: &str = "gpt-4o-mini";

const OCR_PROMPT: &str = "Extract all text visible in this image. Return only the extracted text, preserving the reading order and line structure. If the image contains no text, return an empty response.";

/// Model used for audio transcription.
const TRANSCRIPTION_MODEL: &str = "whisper-1";

/// Client for OpenAI and OpenAI-compatible deployments.
pub struct OpenAiEngine {
    api_key: String,
    organization: Option<String>,
    base_url: String,
    image_options: ImageRequestOptions,
}

impl OpenAiEngine {
    /// Build an engine from a validated account.
    pub fn from_account(account: &Account) -> Result<Self, BasiliskError> {
        account.validate()?;
        let api_key = account
            .api_key
            .clone()
            .ok_or_else(|| BasiliskError::Credential("OpenAI API key is required".to_string()))?;
        Ok(OpenAiEngine {
            api_key,
            organization: account.active_organization().map(|org| org.key.clone()),
            base_url: account
                .base_url()
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            image_options: ImageRequestOptions::default(),
        })
    }

    /// Build an engine straight from an API key, targeting the public API.
    pub fn with_api_key(api_key: &str) -> Self {
        Self::with_base_url(api_key, DEFAULT_BASE_URL)
    }

    /// Build an engine targeting a custom OpenAI-compatible base URL.
    pub fn with_base_url(api_key: &str, base_url: &str) -> Self {
        OpenAiEngine {
            api_key: api_key.to_string(),
            organization: None,
            base_url: base_url.trim_end_matches('/').to_string(),
            image_options: ImageRequestOptions::default(),
        }
    }

    /// Override the sizing applied to inlined image attachments.
    pub fn set_image_options(&mut self, options: ImageRequestOptions) {
        self.image_options = options;
    }

    /// Whether `model_id` should go through the responses endpoint.
    pub fn should_use_responses_api(&self, model_id: &str) -> bool {
        self.model(model_id)
            .map(|descriptor| descriptor.prefer_responses_api)
            .unwrap_or(false)
    }

    fn chat_request(
        &self,
        conversation: &Conversation,
        new_block: &MessageBlock,
        system: Option<&SystemMessage>,
        stream: bool,
    ) -> Result<Value, BasiliskError> {
        let messages = chat_messages(conversation, new_block, system, &self.image_options, true)?;
        Ok(chat_payload(&new_block.model.model_id, messages, new_block, stream))
    }

    fn responses_request(
        &self,
        conversation: &Conversation,
        new_block: &MessageBlock,
        system: Option<&SystemMessage>,
        stream: bool,
    ) -> Result<Value, BasiliskError> {
        let store = &conversation.storage_root;
        let mut input = Vec::new();
        for block in &conversation.messages {
            input.push(json!({
                "role": "user",
                "content": responses_content(&block.request, store, &self.image_options)?,
            }));
            if let Some(response) = &block.response {
                input.push(json!({"role": "assistant", "content": response.content}));
            }
        }
        input.push(json!({
            "role": "user",
            "content": responses_content(&new_block.request, store, &self.image_options)?,
        }));

        let mut payload = json!({
            "model": new_block.model.model_id,
            "input": input,
            "stream": stream,
        });
        if let Some(system) = system {
            payload["instructions"] = json!(system.content);
        }
        if let Some(temperature) = new_block.temperature {
            payload["temperature"] = json!(temperature);
        }
        if let Some(top_p) = new_block.top_p {
            payload["top_p"] = json!(top_p);
        }
        if let Some(max_tokens) = new_block.max_tokens {
            payload["max_output_tokens"] = json!(max_tokens);
        }
        if self
            .model(&new_block.model.model_id)
            .is_some_and(|descriptor| descriptor.reasoning)
        {
            payload["reasoning"] = json!({"effort": "medium"});
        }
        Ok(payload)
    }

    async fn responses_completion(
        &self,
        payload: &Value,
        stream: bool,
    ) -> Result<CompletionHandle, BasiliskError> {
        let response = post_bearer_json(
            &self.base_url,
            "/responses",
            &self.api_key,
            self.organization.as_deref(),
            payload,
        )
        .await?;
        if stream {
            Ok(CompletionHandle::Stream(sse_text_stream(
                SseEvents::new(response),
                responses_delta_extractor(),
            )))
        } else {
            let value = response.json::<Value>().await?;
            Ok(CompletionHandle::Full(value))
        }
    }
}

/// Stateful extractor for responses-API stream events.
///
/// Accepts `output_text.delta` events, `output_item.added` items whose
/// content parts are `output_text`, and a terminal `completed` event whose
/// `output_text` is only surfaced when no deltas arrived before it.
fn responses_delta_extractor() -> impl FnMut(&Value) -> Option<String> + Send + 'static {
    let mut saw_text = false;
    move |value| {
        let kind = value["type"].as_str().unwrap_or("");
        if kind.ends_with("output_text.delta") {
            let delta = value["delta"].as_str().filter(|s| !s.is_empty())?;
            saw_text = true;
            return Some(delta.to_string());
        }
        if kind.ends_with("output_item.added") {
            let parts = value["item"]["content"].as_array()?;
            let mut text = String::new();
            for part in parts {
                if part["type"].as_str() == Some("output_text") {
                    if let Some(fragment) = part["text"].as_str() {
                        text.push_str(fragment);
                    }
                }
            }
            if text.is_empty() {
                return None;
            }
            saw_text = true;
            return Some(text);
        }
        if kind.ends_with("completed") && !saw_text {
            let response = if value["response"].is_object() {
                &value["response"]
            } else {
                value
            };
            return responses_final_content(response).filter(|s| !s.is_empty());
        }
        None
    }
}

/// Render one message as responses-API input content.
fn responses_content(
    message: &crate::basilisk::conversation::Message,
    store: &StorageRoot,
    options: &ImageRequestOptions,
) -> Result<Value, BasiliskError> {
    if message.attachments.is_empty() {
        return Ok(Value::String(message.content.clone()));
    }
    // Reuse the chat-part builder, then rewrite part types to the
    // responses-API vocabulary.
    let parts = message_content(message, store, options, true)?;
    let Value::Array(parts) = parts else {
        return Ok(parts);
    };
    let rewritten = parts
        .into_iter()
        .map(|part| match part["type"].as_str() {
            Some("text") => json!({"type": "input_text", "text": part["text"]}),
            Some("image_url") => json!({
                "type": "input_image",
                "image_url": part["image_url"]["url"],
            }),
            _ => part,
        })
        .collect();
    Ok(Value::Array(rewritten))
}

#[async_trait]
impl ProviderEngine for OpenAiEngine {
    fn provider_id(&self) -> &str {
        "openai"
    }

    fn capabilities(&self) -> &'static [Capability] {
        get_provider("openai").expect("openai in catalogue").capabilities
    }

    fn models(&self) -> Vec<ModelDescriptor> {
        vec![
            ModelDescriptor {
                id: "gpt-4o".to_string(),
                name: "GPT-4o".to_string(),
                context_window: 128_000,
                max_output_tokens: 16_384,
                default_temperature: 1.0,
                max_temperature: 2.0,
                vision: true,
                reasoning: false,
                prefer_responses_api: false,
            },
            ModelDescriptor {
                id: "gpt-4o-mini".to_string(),
                name: "GPT-4o mini".to_string(),
                context_window: 128_000,
                max_output_tokens: 16_384,
                default_temperature: 1.0,
                max_temperature: 2.0,
                vision: true,
                reasoning: false,
                prefer_responses_api: false,
            },
            ModelDescriptor {
                id: "gpt-4.1".to_string(),
                name: "GPT-4.1".to_string(),
                context_window: 1_047_576,
                max_output_tokens: 32_768,
                default_temperature: 1.0,
                max_temperature: 2.0,
                vision: true,
                reasoning: false,
                prefer_responses_api: false,
            },
            ModelDescriptor {
                id: "gpt-4.1-mini".to_string(),
                name: "GPT-4.1 mini".to_string(),
                context_window: 1_047_576,
                max_output_tokens: 32_768,
                default_temperature: 1.0,
                max_temperature: 2.0,
                vision: true,
                reasoning: false,
                prefer_responses_api: false,
            },
            ModelDescriptor {
                id: "o3".to_string(),
                name: "o3".to_string(),
                context_window: 200_000,
                max_output_tokens: 100_000,
                default_temperature: 1.0,
                max_temperature: 1.0,
                vision: true,
                reasoning: true,
                prefer_responses_api: true,
            },
            ModelDescriptor {
                id: "o4-mini".to_string(),
                name: "o4-mini".to_string(),
                context_window: 200_000,
                max_output_tokens: 100_000,
                default_temperature: 1.0,
                max_temperature: 1.0,
                vision: true,
                reasoning: true,
                prefer_responses_api: true,
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
        if self.should_use_responses_api(&new_block.model.model_id) {
            self.responses_request(conversation, new_block, system, stream)
        } else {
            self.chat_request(conversation, new_block, system, stream)
        }
    }

    async fn completion(
        &self,
        conversation: &Conversation,
        new_block: &MessageBlock,
        system: Option<&SystemMessage>,
    ) -> Result<CompletionHandle, BasiliskError> {
        let stream = new_block.stream;
        if self.should_use_responses_api(&new_block.model.model_id) {
            let payload = self.responses_request(conversation, new_block, system, stream)?;
            match self.responses_completion(&payload, stream).await {
                Ok(handle) => return Ok(handle),
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => {
                    log::warn!(
                        "responses endpoint failed for {}; falling back to chat: {}",
                        new_block.model.model_id,
                        err
                    );
                }
            }
        }
        let payload = self.chat_request(conversation, new_block, system, stream)?;
        chat_completion(
            &self.base_url,
            &self.api_key,
            self.organization.as_deref(),
            &payload,
        )
        .await
    }

    async fn handle_ocr(
        &self,
        attachments: &[Attachment],
        store: &StorageRoot,
        events: WorkerSender,
        cancel: CancelFlag,
    ) -> Result<Vec<String>, BasiliskError> {
        let images: Vec<&Attachment> = attachments.iter().filter(|a| a.is_image()).collect();
        if images.is_empty() {
            return Err(BasiliskError::Content(
                "no image attachments to recognize".to_string(),
            ));
        }
        let total = images.len();
        let mut results = Vec::with_capacity(total);
        for (index, attachment) in images.into_iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(BasiliskError::Cancelled);
            }
            events.message(format!("Recognizing {}", attachment.name()));
            let source = store.resolve_for_request(attachment, &self.image_options)?;
            let payload = json!({
                "model": OCR_MODEL,
                "messages": [{
                    "role": "user",
                    "content": [
                        {"type": "text", "text": OCR_PROMPT},
                        {"type": "image_url", "image_url": {"url": source.as_str()}},
                    ],
                }],
                "stream": false,
            });
            let response = post_bearer_json(
                &self.base_url,
                "/chat/completions",
                &self.api_key,
                self.organization.as_deref(),
                &payload,
            )
            .await?;
            let value = response.json::<Value>().await?;
            let text = chat_final_content(&value).unwrap_or_default();
            results.push(normalize_linesep(&text));
            events.progress((((index + 1) * 100) / total) as u8);
        }
        Ok(results)
    }

    async fn transcribe(
        &self,
        audio_path: &std::path::Path,
        response_format: &str,
    ) -> Result<String, BasiliskError> {
        let bytes = tokio::fs::read(audio_path).await.map_err(|err| {
            BasiliskError::Storage(format!(
                "cannot read audio file '{}': {}",
                audio_path.display(),
                err
            ))
        })?;
        let file_name = audio_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio".to_string());
        let part = reqwest::multipart::Part::bytes(bytes).file_name(file_name);
        let form = reqwest::multipart::Form::new()
            .text("model", TRANSCRIPTION_MODEL)
            .text("response_format", response_format.to_string())
            .part("file", part);
        let url = format!("{}/audio/transcriptions", self.base_url);
        let mut request = get_shared_http_client()
            .post(&url)
            .bearer_auth(&self.api_key)
            .multipart(form);
        if let Some(organization) = self.organization.as_deref() {
            request = request.header("OpenAI-Organization", organization);
        }
        let response = check_status(request.send().await?).await?;
        if response_format == "text" {
            Ok(response.text().await?)
        } else {
            let value = response.json::<Value>().await?;
            Ok(value["text"].as_str().unwrap_or_default().to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basilisk::conversation::{AiModelRef, Message};

    fn engine() -> OpenAiEngine {
        OpenAiEngine::with_api_key("test-key")
    }

    #[test]
    fn responses_flag_follows_descriptor() {
        let engine = engine();
        assert!(engine.should_use_responses_api("o3"));
        assert!(!engine.should_use_responses_api("gpt-4o"));
        assert!(!engine.should_use_responses_api("unknown-model"));
    }

    #[test]
    fn reasoning_models_get_medium_effort() {
        let engine = engine();
        let conversation = Conversation::new();
        let mut block = MessageBlock::new(Message::user("hi"), AiModelRef::new("openai", "o3"));
        block.stream = false;
        let payload = engine
            .prepare_request(&conversation, &block, None, false)
            .unwrap();
        assert_eq!(payload["reasoning"], json!({"effort": "medium"}));
        assert!(payload.get("messages").is_none());
        assert!(payload.get("input").is_some());
    }

    #[test]
    fn chat_models_get_chat_shape() {
        let engine = engine();
        let conversation = Conversation::new();
        let block = MessageBlock::new(Message::user("hi"), AiModelRef::new("openai", "gpt-4o"));
        let payload = engine
            .prepare_request(&conversation, &block, None, true)
            .unwrap();
        assert_eq!(payload["model"], json!("gpt-4o"));
        assert_eq!(payload["stream"], json!(true));
        assert!(payload.get("input").is_none());
    }

    #[test]
    fn responses_extractor_accepts_all_event_kinds() {
        let mut extract = responses_delta_extractor();
        assert_eq!(
            extract(&json!({"type": "response.output_text.delta", "delta": "Hel"})),
            Some("Hel".to_string())
        );
        assert_eq!(
            extract(&json!({"type": "response.output_item.added", "item": {
                "content": [{"type": "output_text", "text": "lo"}],
            }})),
            Some("lo".to_string())
        );
        // Deltas already streamed, so the completed event adds nothing.
        assert_eq!(
            extract(&json!({"type": "response.completed", "response": {"output_text": "Hello"}})),
            None
        );
    }

    #[test]
    fn responses_extractor_uses_completed_when_no_deltas() {
        let mut extract = responses_delta_extractor();
        assert_eq!(
            extract(&json!({"type": "response.completed", "response": {"output_text": "All"}})),
            Some("All".to_string())
        );
    }
}
