/// Tests for saving and restoring `.bskc` conversation archives.
use std::io::{Cursor, Read, Write};

use basilisk::archive::{open_bskc, save_bskc, CONVERSATION_ENTRY};
use basilisk::attachment::classify;
use basilisk::conversation::{
    AiModelRef, Conversation, Message, MessageBlock, SystemMessage, BSKC_VERSION,
};
use basilisk::error::BasiliskError;
use serde_json::json;

fn ai_model() -> AiModelRef {
    AiModelRef::new("openai", "gpt-4o")
}

fn sealed_block(request: &str, response: &str) -> MessageBlock {
    let mut block = MessageBlock::new(Message::user(request), ai_model());
    block.seal(response.to_string());
    block
}

#[test]
fn save_empty_conversation_writes_exact_manifest() {
    basilisk::init_logger();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("empty.bskc");

    let mut conversation = Conversation::new();
    save_bskc(&mut conversation, &path).unwrap();

    let file = std::fs::File::open(&path).unwrap();
    let mut archive = zip::ZipArchive::new(file).unwrap();
    let mut entry = archive.by_name(CONVERSATION_ENTRY).unwrap();
    let mut text = String::new();
    entry.read_to_string(&mut text).unwrap();
    let manifest: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(
        manifest,
        json!({
            "messages": [],
            "systems": [],
            "title": null,
            "version": BSKC_VERSION,
        })
    );
}

#[test]
fn round_trip_preserves_messages_and_title() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("messages.bskc");

    let mut conversation = Conversation::new();
    conversation.title = Some("Test Conversation".to_string());
    conversation.add_block(sealed_block("Test message 1", "Test response 1"), None);
    conversation.add_block(
        MessageBlock::new(Message::user("Test message 2"), ai_model()),
        None,
    );
    save_bskc(&mut conversation, &path).unwrap();

    let opened = open_bskc(&path).unwrap();
    assert_eq!(opened.conversation.title.as_deref(), Some("Test Conversation"));
    // The trailing unresponded block comes back as a detached draft.
    assert_eq!(opened.conversation.messages.len(), 1);
    assert_eq!(
        opened.conversation.messages[0].request.content,
        "Test message 1"
    );
    assert_eq!(
        opened.conversation.messages[0]
            .response
            .as_ref()
            .unwrap()
            .content,
        "Test response 1"
    );
    let draft = opened.draft.unwrap();
    assert_eq!(draft.request.content, "Test message 2");
    assert!(draft.is_draft());
    assert_eq!(draft.model.provider_id, "openai");
}

#[test]
fn shared_system_round_trips_to_one_slot() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared_system.bskc");

    let mut conversation = Conversation::new();
    let system = SystemMessage::new("S");
    conversation.add_block(sealed_block("m1", "r1"), Some(system.clone()));
    conversation.add_block(sealed_block("m2", "r2"), Some(system));
    save_bskc(&mut conversation, &path).unwrap();

    let opened = open_bskc(&path).unwrap();
    assert_eq!(opened.conversation.systems.len(), 1);
    assert_eq!(opened.conversation.systems[0].content, "S");
    assert_eq!(opened.conversation.messages[0].system_index, Some(0));
    assert_eq!(opened.conversation.messages[1].system_index, Some(0));
}

#[test]
fn distinct_systems_round_trip_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("two_systems.bskc");

    let mut conversation = Conversation::new();
    conversation.add_block(
        sealed_block("m1", "r1"),
        Some(SystemMessage::new("System instructions 1")),
    );
    conversation.add_block(
        sealed_block("m2", "r2"),
        Some(SystemMessage::new("System instructions 2")),
    );
    save_bskc(&mut conversation, &path).unwrap();

    let opened = open_bskc(&path).unwrap();
    assert_eq!(opened.conversation.systems.len(), 2);
    assert_eq!(opened.conversation.systems[0].content, "System instructions 1");
    assert_eq!(opened.conversation.systems[1].content, "System instructions 2");
    assert_eq!(opened.conversation.messages[0].system_index, Some(0));
    assert_eq!(opened.conversation.messages[1].system_index, Some(1));
}

#[test]
fn orphaned_systems_are_collected_at_save() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("orphan.bskc");

    let mut conversation = Conversation::new();
    conversation.add_block(sealed_block("m1", "r1"), Some(SystemMessage::new("S1")));
    conversation.add_block(sealed_block("m2", "r2"), Some(SystemMessage::new("S2")));
    conversation.remove_block(0);
    // The orphan survives until save.
    assert_eq!(conversation.systems.len(), 2);
    save_bskc(&mut conversation, &path).unwrap();

    let opened = open_bskc(&path).unwrap();
    assert_eq!(opened.conversation.systems.len(), 1);
    assert_eq!(opened.conversation.systems[0].content, "S2");
    assert_eq!(opened.conversation.messages[0].system_index, Some(0));
}

#[test]
fn attachments_round_trip_by_relative_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("attachments.bskc");

    // A real PNG on disk, attached by absolute path.
    let image_path = dir.path().join("shot.png");
    let mut png = Cursor::new(Vec::new());
    image::DynamicImage::new_rgb8(8, 8)
        .write_to(&mut png, image::ImageFormat::Png)
        .unwrap();
    std::fs::write(&image_path, png.into_inner()).unwrap();

    let mut conversation = Conversation::new();
    let attachment = classify(image_path.to_str().unwrap()).unwrap();
    let mut request = Message::user("what is in this image?");
    request.attachments.push(attachment);
    let mut block = MessageBlock::new(request, ai_model());
    block.seal("a test pattern".to_string());
    conversation.add_block(block, None);
    save_bskc(&mut conversation, &path).unwrap();

    // The manifest must not leak the absolute host path.
    let file = std::fs::File::open(&path).unwrap();
    let mut archive = zip::ZipArchive::new(file).unwrap();
    let mut text = String::new();
    archive
        .by_name(CONVERSATION_ENTRY)
        .unwrap()
        .read_to_string(&mut text)
        .unwrap();
    assert!(!text.contains(image_path.to_str().unwrap()));
    assert!(text.contains("attachments/shot-"));

    let opened = open_bskc(&path).unwrap();
    let restored = &opened.conversation.messages[0].request.attachments[0];
    assert!(restored.location().starts_with("attachments/shot-"));
    assert!(opened.conversation.storage_root.exists(restored.location()));
}

#[test]
fn open_rejects_non_zip_files() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("invalid.bskc");
    std::fs::write(&path, b"This is not a valid zip file").unwrap();

    match open_bskc(&path) {
        Err(BasiliskError::Storage(message)) => assert!(message.contains("not a bskc archive")),
        other => panic!("expected storage error, got {:?}", other.err()),
    }
}

#[test]
fn open_rejects_archive_without_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("no_manifest.bskc");
    let file = std::fs::File::create(&path).unwrap();
    let mut writer = zip::ZipWriter::new(file);
    writer
        .start_file("other.txt", zip::write::SimpleFileOptions::default())
        .unwrap();
    writer.write_all(b"hello").unwrap();
    writer.finish().unwrap();

    assert!(matches!(open_bskc(&path), Err(BasiliskError::Storage(_))));
}

#[test]
fn unknown_provider_surfaces_a_warning_not_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("unknown_provider.bskc");

    let mut conversation = Conversation::new();
    let mut block = MessageBlock::new(
        Message::user("m"),
        AiModelRef::new("futureprovider", "model-x"),
    );
    block.seal("r".to_string());
    conversation.add_block(block, None);
    save_bskc(&mut conversation, &path).unwrap();

    let opened = open_bskc(&path).unwrap();
    assert_eq!(opened.warnings.len(), 1);
    assert!(opened.warnings[0].contains("futureprovider"));
    assert_eq!(opened.conversation.messages.len(), 1);
}
