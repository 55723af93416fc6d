//! Local conversation store.
//!
//! File-backed SQLite (WAL) holding conversations, their messages,
//! attachments, system prompts, and autosaved drafts, with an FTS5 index
//! over conversation titles and message contents.
//!
//! Table schema:
//! ```sql
//! CREATE TABLE conversations (
//!     id         INTEGER PRIMARY KEY,
//!     title      TEXT,
//!     created_at TEXT NOT NULL,
//!     updated_at TEXT NOT NULL,
//!     private    INTEGER NOT NULL DEFAULT 0
//! );
//! CREATE TABLE systems (
//!     id              INTEGER PRIMARY KEY,
//!     conversation_id INTEGER NOT NULL,   -- ON DELETE CASCADE
//!     ordinal         INTEGER NOT NULL,
//!     content         TEXT NOT NULL
//! );
//! CREATE TABLE messages (
//!     id               INTEGER PRIMARY KEY,
//!     conversation_id  INTEGER NOT NULL,  -- ON DELETE CASCADE
//!     ordinal          INTEGER NOT NULL,
//!     role             TEXT NOT NULL,
//!     content          TEXT NOT NULL,
//!     provider_id      TEXT NOT NULL,
//!     model_id         TEXT NOT NULL,
//!     temperature REAL, top_p REAL, max_tokens INTEGER,
//!     stream           INTEGER NOT NULL DEFAULT 0,
//!     system_index     INTEGER,
//!     response_content TEXT
//! );
//! CREATE TABLE attachments (
//!     id           INTEGER PRIMARY KEY,
//!     message_id   INTEGER NOT NULL,      -- ON DELETE CASCADE
//!     kind         TEXT NOT NULL,
//!     location     TEXT NOT NULL,
//!     mime TEXT, bytes INTEGER,
//!     display_name TEXT NOT NULL
//! );
//! CREATE TABLE drafts (
//!     conversation_id  INTEGER PRIMARY KEY,  -- ON DELETE CASCADE
//!     prompt_text      TEXT NOT NULL,
//!     attachments_json TEXT,
//!     params_json      TEXT
//! );
//! ```
//!
//! Concurrency: every operation runs on one background executor thread that
//! owns the connection, so writes are serialised by construction and
//! multi-row saves are transactional.  Failed writes are retried once before
//! the error is surfaced; callers (the autosave path in particular) disable
//! themselves on repeated failure.
//!
//! Privacy: conversations saved with `private = true` are skipped by the
//! full-text index and by auto-save; manual save still works.

use std::path::Path;
use std::sync::mpsc::{self, Sender};

use rusqlite::{params, Connection, OptionalExtension};

use crate::basilisk::attachment::{Attachment, FileAttachment, ImageAttachment};
use crate::basilisk::autosave::DraftPayload;
use crate::basilisk::conversation::{
    AiModelRef, Conversation, Message, MessageBlock, SystemMessage,
};
use crate::basilisk::error::BasiliskError;

/// Default database location: `<user data dir>/basilisk/conversations.db`.
pub fn default_db_path() -> std::path::PathBuf {
    let base = dirs::data_dir().unwrap_or_else(|| std::path::PathBuf::from("."));
    base.join("basilisk").join("conversations.db")
}

/// Row summary returned by [`ConversationDatabase::list_conversations`].
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationSummary {
    pub id: i64,
    pub title: Option<String>,
    pub updated_at: String,
    pub private: bool,
}

type DbTask = Box<dyn FnOnce(&mut Connection) + Send>;

/// Handle to the background database executor.
pub struct ConversationDatabase {
    sender: Sender<DbTask>,
}

impl ConversationDatabase {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, BasiliskError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let connection = Connection::open(path)
            .map_err(|err| BasiliskError::Storage(format!("cannot open database: {}", err)))?;
        Self::start(connection)
    }

    /// In-memory database, used by tests and throwaway sessions.
    pub fn in_memory() -> Result<Self, BasiliskError> {
        let connection = Connection::open_in_memory()
            .map_err(|err| BasiliskError::Storage(format!("cannot open database: {}", err)))?;
        Self::start(connection)
    }

    fn start(mut connection: Connection) -> Result<Self, BasiliskError> {
        init_schema(&mut connection).map_err(storage_error)?;
        let (sender, receiver) = mpsc::channel::<DbTask>();
        std::thread::spawn(move || {
            while let Ok(task) = receiver.recv() {
                task(&mut connection);
            }
        });
        Ok(ConversationDatabase { sender })
    }

    /// Run a read operation on the executor thread.
    fn run<T, F>(&self, op: F) -> Result<T, BasiliskError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, rusqlite::Error> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        self.sender
            .send(Box::new(move |connection| {
                let _ = tx.send(op(connection).map_err(storage_error));
            }))
            .map_err(|_| BasiliskError::Storage("database executor stopped".to_string()))?;
        rx.recv()
            .map_err(|_| BasiliskError::Storage("database executor stopped".to_string()))?
    }

    /// Run a write operation; one retry before the failure surfaces.
    fn run_write<T, F>(&self, op: F) -> Result<T, BasiliskError>
    where
        T: Send + 'static,
        F: Fn(&mut Connection) -> Result<T, rusqlite::Error> + Send + 'static,
    {
        self.run(move |connection| match op(connection) {
            Ok(value) => Ok(value),
            Err(first) => {
                log::warn!("database write failed, retrying once: {}", first);
                op(connection)
            }
        })
    }

    /// Insert or upsert a conversation; returns its row id.
    pub fn save(
        &self,
        conversation: &Conversation,
        existing_id: Option<i64>,
        private: bool,
    ) -> Result<i64, BasiliskError> {
        let conversation = conversation.clone();
        self.run_write(move |connection| {
            let tx = connection.transaction()?;
            let now = chrono::Utc::now().to_rfc3339();
            let id = match existing_id {
                Some(id) => {
                    tx.execute(
                        "UPDATE conversations SET title = ?1, updated_at = ?2, private = ?3 WHERE id = ?4",
                        params![conversation.title, now, private as i64, id],
                    )?;
                    tx.execute("DELETE FROM systems WHERE conversation_id = ?1", params![id])?;
                    tx.execute(
                        "DELETE FROM attachments WHERE message_id IN \
                         (SELECT id FROM messages WHERE conversation_id = ?1)",
                        params![id],
                    )?;
                    tx.execute("DELETE FROM messages WHERE conversation_id = ?1", params![id])?;
                    id
                }
                None => {
                    tx.execute(
                        "INSERT INTO conversations (title, created_at, updated_at, private) \
                         VALUES (?1, ?2, ?3, ?4)",
                        params![conversation.title, now, now, private as i64],
                    )?;
                    tx.last_insert_rowid()
                }
            };

            for (ordinal, system) in conversation.systems.iter().enumerate() {
                tx.execute(
                    "INSERT INTO systems (conversation_id, ordinal, content) VALUES (?1, ?2, ?3)",
                    params![id, ordinal as i64, system.content],
                )?;
            }

            let mut message_ids = Vec::with_capacity(conversation.messages.len());
            for (ordinal, block) in conversation.messages.iter().enumerate() {
                tx.execute(
                    "INSERT INTO messages (conversation_id, ordinal, role, content, provider_id, \
                     model_id, temperature, top_p, max_tokens, stream, system_index, response_content) \
                     VALUES (?1, ?2, 'user', ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    params![
                        id,
                        ordinal as i64,
                        block.request.content,
                        block.model.provider_id,
                        block.model.model_id,
                        block.temperature.map(f64::from),
                        block.top_p.map(f64::from),
                        block.max_tokens,
                        block.stream as i64,
                        block.system_index.map(|i| i as i64),
                        block.response.as_ref().map(|r| r.content.clone()),
                    ],
                )?;
                let message_id = tx.last_insert_rowid();
                message_ids.push(message_id);
                for attachment in &block.request.attachments {
                    let kind = if attachment.is_image() { "image" } else { "file" };
                    tx.execute(
                        "INSERT INTO attachments (message_id, kind, location, mime, bytes, display_name) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        params![
                            message_id,
                            kind,
                            attachment.location(),
                            attachment.mime(),
                            attachment.size().map(|s| s as i64),
                            attachment.name(),
                        ],
                    )?;
                }
            }

            // Rebuild the full-text rows; private conversations stay out of
            // the index entirely.
            tx.execute("DELETE FROM conversations_fts WHERE rowid = ?1", params![id])?;
            tx.execute(
                "DELETE FROM messages_fts WHERE rowid IN \
                 (SELECT id FROM messages WHERE conversation_id = ?1)",
                params![id],
            )?;
            if !private {
                if let Some(title) = &conversation.title {
                    tx.execute(
                        "INSERT INTO conversations_fts (rowid, title) VALUES (?1, ?2)",
                        params![id, title],
                    )?;
                }
                for (block, message_id) in conversation.messages.iter().zip(&message_ids) {
                    let mut text = block.request.content.clone();
                    if let Some(response) = &block.response {
                        text.push('\n');
                        text.push_str(&response.content);
                    }
                    tx.execute(
                        "INSERT INTO messages_fts (rowid, content) VALUES (?1, ?2)",
                        params![message_id, text],
                    )?;
                }
            }

            tx.commit()?;
            Ok(id)
        })
    }

    /// Reconstruct a conversation.  An autosaved draft comes back as a
    /// trailing unresponded block.
    pub fn load(&self, id: i64) -> Result<Conversation, BasiliskError> {
        self.run(move |connection| {
            let title: Option<String> = connection
                .query_row(
                    "SELECT title FROM conversations WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or(rusqlite::Error::QueryReturnedNoRows)?;

            let mut conversation = Conversation::new();
            conversation.title = title;

            let mut statement = connection.prepare(
                "SELECT content FROM systems WHERE conversation_id = ?1 ORDER BY ordinal",
            )?;
            let systems = statement
                .query_map(params![id], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            conversation.systems = systems.into_iter().map(SystemMessage::new).collect();

            let mut statement = connection.prepare(
                "SELECT id, content, provider_id, model_id, temperature, top_p, max_tokens, \
                 stream, system_index, response_content \
                 FROM messages WHERE conversation_id = ?1 ORDER BY ordinal",
            )?;
            let rows = statement
                .query_map(params![id], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<f64>>(4)?,
                        row.get::<_, Option<f64>>(5)?,
                        row.get::<_, Option<u32>>(6)?,
                        row.get::<_, i64>(7)?,
                        row.get::<_, Option<i64>>(8)?,
                        row.get::<_, Option<String>>(9)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            for (
                message_id,
                content,
                provider_id,
                model_id,
                temperature,
                top_p,
                max_tokens,
                stream,
                system_index,
                response_content,
            ) in rows
            {
                let mut request = Message::user(content);
                request.attachments = load_attachments(connection, message_id)?;
                let mut block = MessageBlock::new(request, AiModelRef::new(provider_id, model_id));
                block.temperature = temperature.map(|t| t as f32);
                block.top_p = top_p.map(|t| t as f32);
                block.max_tokens = max_tokens;
                block.stream = stream != 0;
                block.system_index = system_index.map(|i| i as usize);
                block.response = response_content.map(Message::assistant);
                conversation.messages.push(block);
            }

            // Materialise an autosaved draft as a trailing unresponded block.
            let draft: Option<(String, Option<String>, Option<String>)> = connection
                .query_row(
                    "SELECT prompt_text, attachments_json, params_json FROM drafts \
                     WHERE conversation_id = ?1",
                    params![id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;
            if let Some((prompt_text, attachments_json, params_json)) = draft {
                let params: serde_json::Value = params_json
                    .as_deref()
                    .and_then(|j| serde_json::from_str(j).ok())
                    .unwrap_or(serde_json::Value::Null);
                let model = AiModelRef::new(
                    params["provider_id"].as_str().unwrap_or_default(),
                    params["model_id"].as_str().unwrap_or_default(),
                );
                let mut request = Message::user(prompt_text);
                if let Some(json) = attachments_json.as_deref() {
                    request.attachments = serde_json::from_str(json).unwrap_or_default();
                }
                let mut block = MessageBlock::new(request, model);
                block.temperature = params["temperature"].as_f64().map(|t| t as f32);
                block.top_p = params["top_p"].as_f64().map(|t| t as f32);
                block.max_tokens = params["max_tokens"].as_u64().map(|t| t as u32);
                block.stream = params["stream"].as_bool().unwrap_or(false);
                conversation.messages.push(block);
            }

            Ok(conversation)
        })
    }

    /// Page through conversation summaries, newest first, optionally
    /// restricted to a full-text match over titles and message contents.
    pub fn list_conversations(
        &self,
        search: Option<&str>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ConversationSummary>, BasiliskError> {
        let search = search.map(fts_query);
        self.run(move |connection| {
            let map_row = |row: &rusqlite::Row<'_>| {
                Ok(ConversationSummary {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    updated_at: row.get(2)?,
                    private: row.get::<_, i64>(3)? != 0,
                })
            };
            match &search {
                Some(query) => {
                    let mut statement = connection.prepare(
                        "SELECT id, title, updated_at, private FROM conversations \
                         WHERE id IN (SELECT rowid FROM conversations_fts WHERE conversations_fts MATCH ?1) \
                            OR id IN (SELECT m.conversation_id FROM messages m \
                                      JOIN messages_fts f ON f.rowid = m.id \
                                      WHERE messages_fts MATCH ?1) \
                         ORDER BY updated_at DESC, id DESC LIMIT ?2 OFFSET ?3",
                    )?;
                    let rows = statement.query_map(params![query, limit, offset], map_row)?;
                    rows.collect()
                }
                None => {
                    let mut statement = connection.prepare(
                        "SELECT id, title, updated_at, private FROM conversations \
                         ORDER BY updated_at DESC, id DESC LIMIT ?1 OFFSET ?2",
                    )?;
                    let rows = statement.query_map(params![limit, offset], map_row)?;
                    rows.collect()
                }
            }
        })
    }

    /// Number of conversations matching `search` (all of them when `None`).
    pub fn count(&self, search: Option<&str>) -> Result<i64, BasiliskError> {
        let search = search.map(fts_query);
        self.run(move |connection| match &search {
            Some(query) => connection.query_row(
                "SELECT COUNT(*) FROM conversations \
                 WHERE id IN (SELECT rowid FROM conversations_fts WHERE conversations_fts MATCH ?1) \
                    OR id IN (SELECT m.conversation_id FROM messages m \
                              JOIN messages_fts f ON f.rowid = m.id \
                              WHERE messages_fts MATCH ?1)",
                params![query],
                |row| row.get(0),
            ),
            None => connection.query_row("SELECT COUNT(*) FROM conversations", [], |row| row.get(0)),
        })
    }

    pub fn delete(&self, id: i64) -> Result<(), BasiliskError> {
        self.run_write(move |connection| {
            let tx = connection.transaction()?;
            tx.execute("DELETE FROM conversations_fts WHERE rowid = ?1", params![id])?;
            tx.execute(
                "DELETE FROM messages_fts WHERE rowid IN \
                 (SELECT id FROM messages WHERE conversation_id = ?1)",
                params![id],
            )?;
            tx.execute("DELETE FROM conversations WHERE id = ?1", params![id])?;
            tx.commit()?;
            Ok(())
        })
    }

    pub fn update_title(&self, id: i64, title: Option<String>) -> Result<(), BasiliskError> {
        self.run_write(move |connection| {
            let tx = connection.transaction()?;
            let now = chrono::Utc::now().to_rfc3339();
            tx.execute(
                "UPDATE conversations SET title = ?1, updated_at = ?2 WHERE id = ?3",
                params![title, now, id],
            )?;
            tx.execute("DELETE FROM conversations_fts WHERE rowid = ?1", params![id])?;
            let private: i64 = tx.query_row(
                "SELECT private FROM conversations WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )?;
            if private == 0 {
                if let Some(title) = &title {
                    tx.execute(
                        "INSERT INTO conversations_fts (rowid, title) VALUES (?1, ?2)",
                        params![id, title],
                    )?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// Persist the prompt-area draft for a conversation.
    pub fn save_draft(&self, payload: &DraftPayload) -> Result<(), BasiliskError> {
        let conversation_id = payload.conversation_id;
        let prompt_text = payload.prompt_text.clone();
        let attachments_json = serde_json::to_string(&payload.attachments)
            .map_err(|err| BasiliskError::Storage(err.to_string()))?;
        let params_json = payload.params.to_string();
        self.run_write(move |connection| {
            connection.execute(
                "INSERT INTO drafts (conversation_id, prompt_text, attachments_json, params_json) \
                 VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(conversation_id) DO UPDATE SET \
                 prompt_text = excluded.prompt_text, \
                 attachments_json = excluded.attachments_json, \
                 params_json = excluded.params_json",
                params![conversation_id, prompt_text, attachments_json, params_json],
            )?;
            Ok(())
        })
    }

    pub fn clear_draft(&self, conversation_id: i64) -> Result<(), BasiliskError> {
        self.run_write(move |connection| {
            connection.execute(
                "DELETE FROM drafts WHERE conversation_id = ?1",
                params![conversation_id],
            )?;
            Ok(())
        })
    }
}

fn storage_error(err: rusqlite::Error) -> BasiliskError {
    BasiliskError::Storage(err.to_string())
}

/// Quote a user search string for FTS5 MATCH.
fn fts_query(search: &str) -> String {
    format!("\"{}\"", search.replace('"', "\"\""))
}

fn load_attachments(
    connection: &Connection,
    message_id: i64,
) -> Result<Vec<Attachment>, rusqlite::Error> {
    let mut statement = connection.prepare(
        "SELECT kind, location, mime, bytes, display_name FROM attachments \
         WHERE message_id = ?1 ORDER BY id",
    )?;
    let rows = statement.query_map(params![message_id], |row| {
        let kind: String = row.get(0)?;
        let location: String = row.get(1)?;
        let mime: Option<String> = row.get(2)?;
        let bytes: Option<i64> = row.get(3)?;
        let display_name: String = row.get(4)?;
        Ok(if kind == "image" {
            Attachment::Image(ImageAttachment {
                location,
                dimensions: None,
                mime,
                size: bytes.map(|b| b as u64),
                name: display_name,
                description: None,
            })
        } else {
            Attachment::File(FileAttachment {
                location,
                mime,
                size: bytes.map(|b| b as u64),
                name: display_name,
            })
        })
    })?;
    rows.collect()
}

fn init_schema(connection: &mut Connection) -> Result<(), rusqlite::Error> {
    connection.pragma_update(None, "journal_mode", "WAL")?;
    connection.pragma_update(None, "foreign_keys", "ON")?;
    connection.execute_batch(
        "CREATE TABLE IF NOT EXISTS conversations (
             id         INTEGER PRIMARY KEY,
             title      TEXT,
             created_at TEXT NOT NULL,
             updated_at TEXT NOT NULL,
             private    INTEGER NOT NULL DEFAULT 0
         );
         CREATE TABLE IF NOT EXISTS systems (
             id              INTEGER PRIMARY KEY,
             conversation_id INTEGER NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
             ordinal         INTEGER NOT NULL,
             content         TEXT NOT NULL
         );
         CREATE TABLE IF NOT EXISTS messages (
             id               INTEGER PRIMARY KEY,
             conversation_id  INTEGER NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
             ordinal          INTEGER NOT NULL,
             role             TEXT NOT NULL,
             content          TEXT NOT NULL,
             provider_id      TEXT NOT NULL,
             model_id         TEXT NOT NULL,
             temperature      REAL,
             top_p            REAL,
             max_tokens       INTEGER,
             stream           INTEGER NOT NULL DEFAULT 0,
             system_index     INTEGER,
             response_content TEXT
         );
         CREATE TABLE IF NOT EXISTS attachments (
             id           INTEGER PRIMARY KEY,
             message_id   INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
             kind         TEXT NOT NULL,
             location     TEXT NOT NULL,
             mime         TEXT,
             bytes        INTEGER,
             display_name TEXT NOT NULL
         );
         CREATE TABLE IF NOT EXISTS drafts (
             conversation_id  INTEGER PRIMARY KEY REFERENCES conversations(id) ON DELETE CASCADE,
             prompt_text      TEXT NOT NULL,
             attachments_json TEXT,
             params_json      TEXT
         );
         CREATE INDEX IF NOT EXISTS idx_messages_conversation
             ON messages (conversation_id, ordinal);
         CREATE VIRTUAL TABLE IF NOT EXISTS conversations_fts USING fts5(title);
         CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts USING fts5(content);",
    )
}
