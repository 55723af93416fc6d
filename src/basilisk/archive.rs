//! The `.bskc` conversation archive.
//!
//! A `.bskc` file is a stored (uncompressed) ZIP holding a UTF-8
//! `conversation.json` plus the local attachments under `attachments/`.  The
//! JSON carries a `version` field; older documents are upgraded through an
//! explicit migration chain, dispatched by version number, before the typed
//! model ever sees them — no parsing side effects.
//!
//! Migration chain (each step idempotent under its own input):
//!
//! - **v0 → v1**: insert `version = 1`.  The pre-versioned format already
//!   used the `{messages, systems, title}` top-level keys.
//! - **v1 → v2**: the singular `system` key becomes a `systems` list of
//!   length 0 or 1; when a system was present, the **last** message is
//!   stamped with `system_index = 0`.
//!
//! Documents newer than [`BSKC_VERSION`] are rejected outright.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use serde_json::Value;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::basilisk::attachment::LocationKind;
use crate::basilisk::conversation::{Conversation, MessageBlock, BSKC_VERSION};
use crate::basilisk::error::BasiliskError;
use crate::basilisk::provider::get_provider;
use crate::basilisk::storage::ATTACHMENTS_DIR;

/// Name of the manifest entry inside the archive.
pub const CONVERSATION_ENTRY: &str = "conversation.json";

/// Result of opening an archive: the validated conversation, a trailing
/// draft detached for restoration into the prompt area, and non-fatal load
/// warnings (e.g. unknown provider ids).
pub struct OpenedConversation {
    pub conversation: Conversation,
    pub draft: Option<MessageBlock>,
    pub warnings: Vec<String>,
}

/// Insert `version = 1` into a pre-versioned document.
pub fn migrate_v0_to_v1(mut doc: Value) -> Value {
    if let Some(object) = doc.as_object_mut() {
        if !object.contains_key("version") {
            object.insert("version".to_string(), Value::from(1));
        }
    }
    doc
}

/// Fold the singular `system` key into the `systems` list, stamping the last
/// message's `system_index`.
pub fn migrate_v1_to_v2(mut doc: Value) -> Value {
    let Some(object) = doc.as_object_mut() else {
        return doc;
    };
    object.insert("version".to_string(), Value::from(2));
    let system = object.remove("system").filter(|s| !s.is_null());
    match system {
        Some(system) => {
            object.insert("systems".to_string(), Value::Array(vec![system]));
            if let Some(messages) = object.get_mut("messages").and_then(Value::as_array_mut) {
                if let Some(last) = messages.last_mut().and_then(Value::as_object_mut) {
                    last.insert("system_index".to_string(), Value::from(0));
                }
            }
        }
        None => {
            object
                .entry("systems".to_string())
                .or_insert_with(|| Value::Array(Vec::new()));
        }
    }
    doc
}

fn document_version(doc: &Value) -> u32 {
    doc.get("version").and_then(Value::as_u64).unwrap_or(0) as u32
}

/// Run the migration chain up to [`BSKC_VERSION`].
pub fn migrate(mut doc: Value) -> Result<Value, BasiliskError> {
    let version = document_version(&doc);
    if version > BSKC_VERSION {
        return Err(BasiliskError::Storage(format!(
            "Invalid conversation version: {} (newest supported is {})",
            version, BSKC_VERSION
        )));
    }
    while document_version(&doc) < BSKC_VERSION {
        doc = match document_version(&doc) {
            0 => migrate_v0_to_v1(doc),
            1 => migrate_v1_to_v2(doc),
            other => {
                return Err(BasiliskError::Storage(format!(
                    "no migration from version {}",
                    other
                )))
            }
        };
    }
    Ok(doc)
}

/// Drop systems no block references and remap the surviving indices.
/// Deferred to save so `remove_block` stays cheap.
fn collect_orphan_systems(conversation: &mut Conversation) {
    let mut used: Vec<usize> = conversation
        .messages
        .iter()
        .filter_map(|block| block.system_index)
        .collect();
    used.sort_unstable();
    used.dedup();
    if used.len() == conversation.systems.len() {
        return;
    }
    let remap: std::collections::HashMap<usize, usize> = used
        .iter()
        .enumerate()
        .map(|(new, &old)| (old, new))
        .collect();
    conversation.systems = used
        .iter()
        .filter_map(|&old| conversation.systems.get(old).cloned())
        .collect();
    for block in &mut conversation.messages {
        block.system_index = block.system_index.and_then(|old| remap.get(&old).copied());
    }
}

/// Save a conversation to `path` as a `.bskc` archive.
///
/// Local attachments still referenced by absolute host path are staged into
/// the storage root first, so the manifest only ever carries
/// archive-relative locations.
pub fn save_bskc(conversation: &mut Conversation, path: &Path) -> Result<(), BasiliskError> {
    // Stage stragglers and drop orphaned systems before serialising.
    let root = conversation.storage_root.clone();
    for block in &mut conversation.messages {
        for attachment in block
            .request
            .attachments
            .iter_mut()
            .chain(block.response.iter_mut().flat_map(|r| r.attachments.iter_mut()))
        {
            if attachment.location_kind() == LocationKind::Local && !root.exists(attachment.location())
            {
                *attachment = root.ingest(attachment.clone())?;
            }
        }
    }
    collect_orphan_systems(conversation);
    conversation.version = BSKC_VERSION;

    let json = serde_json::to_vec(conversation)
        .map_err(|err| BasiliskError::Storage(format!("cannot serialise conversation: {}", err)))?;

    let file = File::create(path)?;
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    writer.start_file(CONVERSATION_ENTRY, options)?;
    writer.write_all(&json)?;

    let mut written: Vec<String> = Vec::new();
    for attachment in conversation.attachments() {
        if attachment.location_kind() != LocationKind::Local {
            continue;
        }
        let location = attachment.location().to_string();
        if written.contains(&location) {
            continue;
        }
        let bytes = root.attachment_bytes(attachment)?;
        writer.start_file(location.as_str(), options)?;
        writer.write_all(&bytes)?;
        written.push(location);
    }
    writer.finish()?;
    log::debug!(
        "saved conversation with {} blocks and {} attachments to {}",
        conversation.messages.len(),
        written.len(),
        path.display()
    );
    Ok(())
}

/// Open a `.bskc` archive.
///
/// Detects the ZIP container, reads and migrates the manifest,
/// rematerialises attachments into a fresh in-memory storage root, validates
/// the model, and pops a trailing draft for the UI.
pub fn open_bskc(path: &Path) -> Result<OpenedConversation, BasiliskError> {
    let file = File::open(path)?;
    let mut archive = ZipArchive::new(file)
        .map_err(|_| BasiliskError::Storage("the file is not a bskc archive".to_string()))?;

    let mut text = String::new();
    {
        let mut entry = archive.by_name(CONVERSATION_ENTRY).map_err(|_| {
            BasiliskError::Storage(format!(
                "the archive does not contain a {} entry",
                CONVERSATION_ENTRY
            ))
        })?;
        entry.read_to_string(&mut text)?;
    }
    let doc: Value = serde_json::from_str(&text)
        .map_err(|err| BasiliskError::Storage(format!("malformed conversation.json: {}", err)))?;
    let doc = migrate(doc)?;
    let mut conversation: Conversation = serde_json::from_value(doc)
        .map_err(|err| BasiliskError::Storage(format!("invalid conversation: {}", err)))?;

    // Rematerialise attachment entries into the fresh storage root attached
    // during deserialisation.
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        if !name.starts_with(ATTACHMENTS_DIR) {
            continue;
        }
        let mut bytes = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut bytes)?;
        conversation.storage_root.write(&name, bytes);
    }

    let warnings = conversation.validate(|id| get_provider(id).is_some())?;
    for attachment in conversation.attachments() {
        if attachment.location_kind() == LocationKind::Local
            && !conversation.storage_root.exists(attachment.location())
        {
            return Err(BasiliskError::Storage(format!(
                "attachment '{}' does not resolve inside the archive",
                attachment.location()
            )));
        }
    }

    let draft = conversation.pop_draft();
    Ok(OpenedConversation {
        conversation,
        draft,
        warnings,
    })
}
