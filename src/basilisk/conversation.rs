//! Block-structured conversation model.
//!
//! A conversation is an append-only list of [`MessageBlock`]s — each one a
//! paired user request and optional assistant response — plus a deduplicated
//! list of [`SystemMessage`]s that blocks reference by index.  The model is
//! the single serialisable source of truth: archives (`.bskc`), the local
//! database, and the completion orchestrator all read and write this shape.
//!
//! # Invariants
//!
//! - `messages[*].system_index`, when set, is a valid index into `systems`.
//! - At most one trailing *draft* (a block whose `response` is `None`)
//!   exists; it is the only mutable block.
//! - Serialised form omits default/`None` fields and stores attachments by
//!   relative path inside the archive, never by absolute host path.
//!
//! # Example
//!
//! ```rust
//! use basilisk::conversation::{
//!     AiModelRef, Conversation, Message, MessageBlock, MessageRole, SystemMessage,
//! };
//!
//! let mut conversation = Conversation::new();
//! let request = Message::user("What is a basilisk?");
//! let block = MessageBlock::new(request, AiModelRef::new("openai", "gpt-4o"));
//! conversation.add_block(block, Some(SystemMessage::new("Answer briefly.")));
//! assert_eq!(conversation.systems.len(), 1);
//! assert_eq!(conversation.messages[0].system_index, Some(0));
//! ```

use serde::{Deserialize, Serialize};

use crate::basilisk::attachment::Attachment;
use crate::basilisk::storage::StorageRoot;

/// Current `.bskc` / conversation document version.
pub const BSKC_VERSION: u32 = 2;

/// Hidden prompt used for automatic conversation titling.
pub const PROMPT_TITLE: &str = "Generate a concise, relevant title in the conversation's main language based on the topics and context. Max 70 characters. Do not surround the text with quotation marks.";

/// Role attached to a message on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

/// Reference to the `(provider, model)` pair a block was sent with.
///
/// Unknown provider ids are tolerated on load (the conversation may have been
/// created with a build that knew more providers) and reported as warnings by
/// [`Conversation::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AiModelRef {
    pub provider_id: String,
    pub model_id: String,
}

impl AiModelRef {
    pub fn new(provider_id: impl Into<String>, model_id: impl Into<String>) -> Self {
        AiModelRef {
            provider_id: provider_id.into(),
            model_id: model_id.into(),
        }
    }
}

/// A single user or assistant turn.  Immutable once its block is appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    /// Attachments referenced by this turn.  Omitted from the wire when empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    /// Provider citation payloads, kept opaque; the shape varies per provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub citations: Option<Vec<serde_json::Value>>,
}

impl Message {
    /// Build a plain user message with no attachments.
    pub fn user(content: impl Into<String>) -> Self {
        Message {
            role: MessageRole::User,
            content: content.into(),
            attachments: Vec::new(),
            citations: None,
        }
    }

    /// Build a plain assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Message {
            role: MessageRole::Assistant,
            content: content.into(),
            attachments: Vec::new(),
            citations: None,
        }
    }
}

/// A shared system prompt slot.  Identical content shares one slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMessage {
    pub role: MessageRole,
    pub content: String,
}

impl SystemMessage {
    pub fn new(content: impl Into<String>) -> Self {
        SystemMessage {
            role: MessageRole::System,
            content: content.into(),
        }
    }
}

/// The unit of exchange: one user request and, once completed, one assistant
/// response, together with the sampling parameters the request was sent with.
///
/// A block whose `response` is `None` is a **draft** — the only mutable block
/// in a conversation.  A block is **sealed** the moment completion succeeds or
/// is cancelled with partial content retained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageBlock {
    pub request: Message,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Message>,
    pub model: AiModelRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stream: bool,
    /// Index of the system prompt this block was sent with, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_index: Option<usize>,
}

impl MessageBlock {
    /// Build a draft block for the given request and model.
    pub fn new(request: Message, model: AiModelRef) -> Self {
        MessageBlock {
            request,
            response: None,
            model,
            temperature: None,
            top_p: None,
            max_tokens: None,
            stream: false,
            system_index: None,
        }
    }

    /// True while the block has no response.
    pub fn is_draft(&self) -> bool {
        self.response.is_none()
    }

    /// Seal the block with assistant `content` (possibly empty).
    pub fn seal(&mut self, content: String) {
        self.response = Some(Message::assistant(content));
    }
}

/// A full conversation: shared system prompts, message blocks, and the
/// per-conversation storage root holding local attachment content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub systems: Vec<SystemMessage>,
    #[serde(default)]
    pub messages: Vec<MessageBlock>,
    /// Virtual filesystem backing local attachments.  Not serialised; a fresh
    /// root is attached when a conversation is opened from an archive.
    #[serde(skip, default = "StorageRoot::detached")]
    pub storage_root: StorageRoot,
}

fn default_version() -> u32 {
    BSKC_VERSION
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

impl Conversation {
    /// Create an empty conversation backed by a fresh in-memory storage root.
    pub fn new() -> Self {
        Conversation {
            version: BSKC_VERSION,
            title: None,
            systems: Vec::new(),
            messages: Vec::new(),
            storage_root: StorageRoot::memory(),
        }
    }

    /// Append `block`, registering `system` in the shared list first.
    ///
    /// If an equal system message already exists its slot is reused, so two
    /// blocks added with the same prompt share one `system_index`.
    pub fn add_block(&mut self, mut block: MessageBlock, system: Option<SystemMessage>) {
        if let Some(system) = system {
            let index = match self.systems.iter().position(|s| *s == system) {
                Some(index) => index,
                None => {
                    self.systems.push(system);
                    self.systems.len() - 1
                }
            };
            block.system_index = Some(index);
        }
        self.messages.push(block);
    }

    /// Remove the block at `index`.
    ///
    /// The system it referenced is retained even when orphaned; garbage
    /// collection of unreferenced systems is deferred to save.
    pub fn remove_block(&mut self, index: usize) -> Option<MessageBlock> {
        if index < self.messages.len() {
            Some(self.messages.remove(index))
        } else {
            None
        }
    }

    /// True when the trailing block is a draft awaiting completion.
    pub fn has_draft(&self) -> bool {
        self.messages.last().is_some_and(MessageBlock::is_draft)
    }

    /// Detach a trailing draft for restoration into the prompt area.
    pub fn pop_draft(&mut self) -> Option<MessageBlock> {
        if self.has_draft() {
            self.messages.pop()
        } else {
            None
        }
    }

    /// System message referenced by `block`, if any.
    pub fn system_for(&self, block: &MessageBlock) -> Option<&SystemMessage> {
        block.system_index.and_then(|i| self.systems.get(i))
    }

    /// Check load-time invariants.
    ///
    /// Out-of-range `system_index` values are hard errors; unknown provider
    /// ids are permitted but reported back as warnings so the UI can surface
    /// them without aborting the open.
    pub fn validate(&self, known_provider: impl Fn(&str) -> bool) -> Result<Vec<String>, crate::basilisk::error::BasiliskError> {
        let mut warnings = Vec::new();
        for (position, block) in self.messages.iter().enumerate() {
            if let Some(index) = block.system_index {
                if index >= self.systems.len() {
                    return Err(crate::basilisk::error::BasiliskError::Storage(format!(
                        "message {} references system {} but only {} exist",
                        position,
                        index,
                        self.systems.len()
                    )));
                }
            }
            if !known_provider(&block.model.provider_id) {
                warnings.push(format!(
                    "message {} uses unknown provider '{}'",
                    position, block.model.provider_id
                ));
            }
        }
        Ok(warnings)
    }

    /// All attachments referenced anywhere in the conversation.
    pub fn attachments(&self) -> impl Iterator<Item = &Attachment> {
        self.messages.iter().flat_map(|block| {
            block.request.attachments.iter().chain(
                block
                    .response
                    .iter()
                    .flat_map(|response| response.attachments.iter()),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(content: &str) -> MessageBlock {
        MessageBlock::new(Message::user(content), AiModelRef::new("openai", "gpt-4o"))
    }

    #[test]
    fn equal_systems_share_one_slot() {
        let mut conversation = Conversation::new();
        conversation.add_block(block("a"), Some(SystemMessage::new("S")));
        conversation.add_block(block("b"), Some(SystemMessage::new("S")));
        assert_eq!(conversation.systems.len(), 1);
        assert_eq!(conversation.messages[0].system_index, Some(0));
        assert_eq!(conversation.messages[1].system_index, Some(0));
    }

    #[test]
    fn distinct_systems_get_distinct_slots() {
        let mut conversation = Conversation::new();
        conversation.add_block(block("a"), Some(SystemMessage::new("S1")));
        conversation.add_block(block("b"), Some(SystemMessage::new("S2")));
        assert_eq!(conversation.systems.len(), 2);
        assert_eq!(conversation.messages[1].system_index, Some(1));
    }

    #[test]
    fn pop_draft_only_detaches_trailing_draft() {
        let mut conversation = Conversation::new();
        let mut sealed = block("a");
        sealed.seal("done".to_string());
        conversation.add_block(sealed, None);
        assert!(conversation.pop_draft().is_none());

        conversation.add_block(block("pending"), None);
        let draft = conversation.pop_draft().expect("trailing draft");
        assert!(draft.is_draft());
        assert_eq!(conversation.messages.len(), 1);
    }

    #[test]
    fn remove_block_retains_orphaned_system() {
        let mut conversation = Conversation::new();
        conversation.add_block(block("a"), Some(SystemMessage::new("S")));
        conversation.remove_block(0);
        assert!(conversation.messages.is_empty());
        assert_eq!(conversation.systems.len(), 1);
    }

    #[test]
    fn validate_rejects_out_of_range_system_index() {
        let mut conversation = Conversation::new();
        let mut bad = block("a");
        bad.system_index = Some(3);
        conversation.messages.push(bad);
        assert!(conversation.validate(|_| true).is_err());
    }

    #[test]
    fn validate_warns_on_unknown_provider() {
        let mut conversation = Conversation::new();
        conversation.add_block(
            MessageBlock::new(Message::user("m"), AiModelRef::new("nonesuch", "x")),
            None,
        );
        let warnings = conversation.validate(|id| id == "openai").unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("nonesuch"));
    }

    #[test]
    fn draft_elides_defaults_on_the_wire() {
        let serialized = serde_json::to_value(block("hi")).unwrap();
        let object = serialized.as_object().unwrap();
        assert!(!object.contains_key("response"));
        assert!(!object.contains_key("temperature"));
        assert!(!object.contains_key("system_index"));
        assert_eq!(object["stream"], serde_json::json!(false));
    }
}
