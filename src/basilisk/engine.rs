//! Provider-agnostic engine contract.
//!
//! Applications talk to providers through the [`ProviderEngine`] trait and the
//! lightweight data types defined here.  The trait abstracts over concrete
//! vendor adapters while staying **pure with respect to the conversation**: an
//! engine translates a conversation snapshot into its provider's wire format
//! and hands back either a stream of text deltas or a final payload — it never
//! mutates the model.  Appending, sealing, and persistence are the completion
//! orchestrator's job.
//!
//! # Streaming quick start
//!
//! ```rust,no_run
//! use basilisk::conversation::{AiModelRef, Conversation, Message, MessageBlock};
//! use basilisk::engine::{CompletionHandle, ProviderEngine};
//! use basilisk::engines::openai::OpenAiEngine;
//! use futures_util::StreamExt;
//!
//! # async fn demo() -> Result<(), basilisk::error::BasiliskError> {
//! let engine = OpenAiEngine::with_api_key(&std::env::var("OPENAI_API_KEY").unwrap());
//! let conversation = Conversation::new();
//! let mut block = MessageBlock::new(
//!     Message::user("Explain Rust lifetimes in a sentence."),
//!     AiModelRef::new("openai", "gpt-4o-mini"),
//! );
//! block.stream = true;
//!
//! if let CompletionHandle::Stream(mut deltas) =
//!     engine.completion(&conversation, &block, None).await?
//! {
//!     while let Some(delta) = deltas.next().await {
//!         print!("{}", delta?);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::stream::Stream;

use crate::basilisk::attachment::Attachment;
use crate::basilisk::conversation::{Conversation, Message, MessageBlock, SystemMessage};
use crate::basilisk::error::BasiliskError;
use crate::basilisk::provider::Capability;
use crate::basilisk::storage::StorageRoot;
use crate::basilisk::worker::{CancelFlag, WorkerSender};

/// A finite, forward-only sequence of text deltas from a streaming
/// completion.
pub type TextDeltaStream = Pin<Box<dyn Stream<Item = Result<String, BasiliskError>> + Send>>;

/// What a completion call hands back: an async delta stream when the request
/// asked for streaming, otherwise the provider's final response payload.
pub enum CompletionHandle {
    Stream(TextDeltaStream),
    Full(serde_json::Value),
}

/// Description of one model a provider serves.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelDescriptor {
    pub id: String,
    pub name: String,
    pub context_window: u32,
    pub max_output_tokens: u32,
    pub default_temperature: f32,
    pub max_temperature: f32,
    /// Accepts image attachments.
    pub vision: bool,
    /// Reasoning-capable; responses-style payloads get
    /// `reasoning = {"effort": "medium"}`.
    pub reasoning: bool,
    /// Prefer the responses-style endpoint over chat completions when the
    /// provider offers both.
    pub prefer_responses_api: bool,
}

impl ModelDescriptor {
    /// Descriptor with conservative defaults; callers override per model.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        ModelDescriptor {
            id: id.into(),
            name: name.into(),
            context_window: 128_000,
            max_output_tokens: 4_096,
            default_temperature: 1.0,
            max_temperature: 2.0,
            vision: false,
            reasoning: false,
            prefer_responses_api: false,
        }
    }
}

/// Per-provider adapter.
///
/// All implementations must be thread-safe (`Send + Sync`) so one engine
/// instance can be shared between the resolver cache and in-flight
/// completion tasks.
#[async_trait]
pub trait ProviderEngine: Send + Sync {
    /// Id of the provider this engine speaks for (matches the catalogue).
    fn provider_id(&self) -> &str;

    /// Capability flags advertised by this engine.
    fn capabilities(&self) -> &'static [Capability];

    /// Models served by this provider.
    fn models(&self) -> Vec<ModelDescriptor>;

    /// Descriptor for `model_id`, if this engine serves it.
    fn model(&self, model_id: &str) -> Option<ModelDescriptor> {
        self.models().into_iter().find(|m| m.id == model_id)
    }

    fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }

    /// Translate a conversation snapshot plus the pending block into the
    /// provider-native request payload.  Roles are mapped, attachments are
    /// inlined per the attachment-store rules, and per-model parameter
    /// transforms are applied.
    fn prepare_request(
        &self,
        conversation: &Conversation,
        new_block: &MessageBlock,
        system: Option<&SystemMessage>,
        stream: bool,
    ) -> Result<serde_json::Value, BasiliskError>;

    /// Invoke the remote service.  With `new_block.stream` set the handle
    /// wraps an async delta stream; otherwise it carries the final payload.
    async fn completion(
        &self,
        conversation: &Conversation,
        new_block: &MessageBlock,
        system: Option<&SystemMessage>,
    ) -> Result<CompletionHandle, BasiliskError>;

    /// Normalise a final (non-streamed) payload into the sealed block.
    ///
    /// The default tolerates both chat-style
    /// (`choices[0].message.content`) and responses-style (`output_text`,
    /// else flattened `output[*].content[*].text`) shapes.  Empty content is
    /// permitted and seals a zero-length assistant turn.
    fn extract_final(
        &self,
        payload: &serde_json::Value,
        mut new_block: MessageBlock,
    ) -> MessageBlock {
        let content = crate::basilisk::engines::common::final_content(payload);
        new_block.response = Some(Message::assistant(
            crate::basilisk::engines::common::normalize_linesep(&content),
        ));
        new_block
    }

    /// Run OCR over image attachments, reporting progress through the worker
    /// event contract.  Engines without the OCR capability inherit this
    /// rejection.
    async fn handle_ocr(
        &self,
        _attachments: &[Attachment],
        _store: &StorageRoot,
        _events: WorkerSender,
        _cancel: CancelFlag,
    ) -> Result<Vec<String>, BasiliskError> {
        Err(BasiliskError::Capability(format!(
            "{} does not support OCR",
            self.provider_id()
        )))
    }

    /// Transcribe an audio file to text.  Engines without the STT capability
    /// inherit this rejection.
    async fn transcribe(
        &self,
        _audio_path: &std::path::Path,
        _response_format: &str,
    ) -> Result<String, BasiliskError> {
        Err(BasiliskError::Capability(format!(
            "{} does not support transcription",
            self.provider_id()
        )))
    }
}
