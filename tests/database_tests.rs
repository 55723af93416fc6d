/// Tests for the local conversation store: upserts, reconstruction, drafts,
/// full-text search, and the privacy rules.
use basilisk::attachment::{Attachment, ImageAttachment};
use basilisk::autosave::DraftPayload;
use basilisk::conversation::{AiModelRef, Conversation, Message, MessageBlock, SystemMessage};
use basilisk::database::ConversationDatabase;
use serde_json::json;

fn db() -> ConversationDatabase {
    ConversationDatabase::in_memory().unwrap()
}

fn conversation_with(title: &str, request: &str, response: &str) -> Conversation {
    let mut conversation = Conversation::new();
    conversation.title = Some(title.to_string());
    let mut block = MessageBlock::new(Message::user(request), AiModelRef::new("openai", "gpt-4o"));
    block.temperature = Some(0.7);
    block.stream = true;
    block.seal(response.to_string());
    conversation.add_block(block, Some(SystemMessage::new("be helpful")));
    conversation
}

#[test]
fn save_and_load_round_trip() {
    let db = db();
    let saved = conversation_with("Rust talk", "what is a borrow?", "a loan of a reference");
    let id = db.save(&saved, None, false).unwrap();

    let loaded = db.load(id).unwrap();
    assert_eq!(loaded.title.as_deref(), Some("Rust talk"));
    assert_eq!(loaded.systems.len(), 1);
    assert_eq!(loaded.systems[0].content, "be helpful");
    assert_eq!(loaded.messages.len(), 1);
    let block = &loaded.messages[0];
    assert_eq!(block.request.content, "what is a borrow?");
    assert_eq!(block.response.as_ref().unwrap().content, "a loan of a reference");
    assert_eq!(block.model.model_id, "gpt-4o");
    assert_eq!(block.temperature, Some(0.7));
    assert!(block.stream);
    assert_eq!(block.system_index, Some(0));
}

#[test]
fn upsert_replaces_rows_under_the_same_id() {
    let db = db();
    let first = conversation_with("v1", "a", "b");
    let id = db.save(&first, None, false).unwrap();

    let mut second = conversation_with("v2", "c", "d");
    second.add_block(
        {
            let mut block =
                MessageBlock::new(Message::user("e"), AiModelRef::new("openai", "gpt-4o"));
            block.seal("f".to_string());
            block
        },
        None,
    );
    let same_id = db.save(&second, Some(id), false).unwrap();
    assert_eq!(same_id, id);

    let loaded = db.load(id).unwrap();
    assert_eq!(loaded.title.as_deref(), Some("v2"));
    assert_eq!(loaded.messages.len(), 2);
    assert_eq!(db.count(None).unwrap(), 1);
}

#[test]
fn attachments_survive_the_database() {
    let db = db();
    let mut conversation = Conversation::new();
    let mut request = Message::user("look at this");
    request.attachments.push(Attachment::Image(ImageAttachment {
        location: "attachments/shot-00aa11bb.png".to_string(),
        dimensions: Some((32, 16)),
        mime: Some("image/png".to_string()),
        size: Some(128),
        name: "shot.png".to_string(),
        description: None,
    }));
    conversation.add_block(
        MessageBlock::new(request, AiModelRef::new("openai", "gpt-4o")),
        None,
    );
    let id = db.save(&conversation, None, false).unwrap();

    let loaded = db.load(id).unwrap();
    let attachment = &loaded.messages[0].request.attachments[0];
    assert!(attachment.is_image());
    assert_eq!(attachment.location(), "attachments/shot-00aa11bb.png");
    assert_eq!(attachment.mime(), Some("image/png"));
    assert_eq!(attachment.size(), Some(128));
    assert_eq!(attachment.name(), "shot.png");
}

#[test]
fn drafts_come_back_as_a_trailing_unresponded_block() {
    let db = db();
    let conversation = conversation_with("draft test", "q", "a");
    let id = db.save(&conversation, None, false).unwrap();

    db.save_draft(&DraftPayload {
        conversation_id: id,
        prompt_text: "half-typed thought".to_string(),
        attachments: vec![],
        params: json!({
            "provider_id": "openai",
            "model_id": "gpt-4o",
            "temperature": 0.5,
            "stream": true,
        }),
    })
    .unwrap();

    let loaded = db.load(id).unwrap();
    assert_eq!(loaded.messages.len(), 2);
    let draft = loaded.messages.last().unwrap();
    assert!(draft.is_draft());
    assert_eq!(draft.request.content, "half-typed thought");
    assert_eq!(draft.model.model_id, "gpt-4o");
    assert_eq!(draft.temperature, Some(0.5));
    assert!(draft.stream);

    db.clear_draft(id).unwrap();
    let reloaded = db.load(id).unwrap();
    assert_eq!(reloaded.messages.len(), 1);
}

#[test]
fn full_text_search_matches_titles_and_contents() {
    let db = db();
    db.save(
        &conversation_with("Rust lifetimes", "explain borrowing", "sure"),
        None,
        false,
    )
    .unwrap();
    db.save(
        &conversation_with("Dinner plans", "what about ramen tonight", "sounds good"),
        None,
        false,
    )
    .unwrap();

    // Title hit.
    let hits = db.list_conversations(Some("lifetimes"), 10, 0).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].title.as_deref(), Some("Rust lifetimes"));

    // Message-content hit.
    let hits = db.list_conversations(Some("ramen"), 10, 0).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].title.as_deref(), Some("Dinner plans"));

    assert_eq!(db.count(Some("ramen")).unwrap(), 1);
    assert_eq!(db.count(None).unwrap(), 2);
    assert!(db.list_conversations(Some("nonexistent"), 10, 0).unwrap().is_empty());
}

#[test]
fn list_conversations_pages() {
    let db = db();
    for index in 0..5 {
        db.save(
            &conversation_with(&format!("conversation {}", index), "q", "a"),
            None,
            false,
        )
        .unwrap();
    }
    let first_page = db.list_conversations(None, 2, 0).unwrap();
    let second_page = db.list_conversations(None, 2, 2).unwrap();
    assert_eq!(first_page.len(), 2);
    assert_eq!(second_page.len(), 2);
    assert_ne!(first_page[0].id, second_page[0].id);
    assert_eq!(db.count(None).unwrap(), 5);
}

#[test]
fn private_conversations_are_not_indexed() {
    let db = db();
    let id = db
        .save(
            &conversation_with("Secret project", "the launch codes are ramen", "noted"),
            None,
            true,
        )
        .unwrap();

    // Saved and loadable, but invisible to search.
    assert!(db.load(id).is_ok());
    assert!(db.list_conversations(Some("Secret"), 10, 0).unwrap().is_empty());
    assert!(db.list_conversations(Some("ramen"), 10, 0).unwrap().is_empty());
    let all = db.list_conversations(None, 10, 0).unwrap();
    assert_eq!(all.len(), 1);
    assert!(all[0].private);
}

#[test]
fn flipping_private_off_reindexes_on_next_save() {
    let db = db();
    let conversation = conversation_with("Now public", "hello there", "hi");
    let id = db.save(&conversation, None, true).unwrap();
    assert!(db.list_conversations(Some("public"), 10, 0).unwrap().is_empty());

    db.save(&conversation, Some(id), false).unwrap();
    assert_eq!(db.list_conversations(Some("public"), 10, 0).unwrap().len(), 1);
}

#[test]
fn delete_removes_conversation_and_index_rows() {
    let db = db();
    let id = db
        .save(&conversation_with("Doomed", "unique needle", "r"), None, false)
        .unwrap();
    db.delete(id).unwrap();

    assert!(db.load(id).is_err());
    assert_eq!(db.count(None).unwrap(), 0);
    assert!(db.list_conversations(Some("needle"), 10, 0).unwrap().is_empty());
}

#[test]
fn update_title_refreshes_the_index() {
    let db = db();
    let id = db
        .save(&conversation_with("Old title", "q", "a"), None, false)
        .unwrap();

    db.update_title(id, Some("Fresh title".to_string())).unwrap();
    let loaded = db.load(id).unwrap();
    assert_eq!(loaded.title.as_deref(), Some("Fresh title"));
    assert!(db.list_conversations(Some("Old"), 10, 0).unwrap().is_empty());
    assert_eq!(db.list_conversations(Some("Fresh"), 10, 0).unwrap().len(), 1);
}
