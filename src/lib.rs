// src/lib.rs

// Import the top-level `basilisk` module.
pub mod basilisk;

// Re-exporting the component modules at the crate root so external code (and
// the integration tests) can write `basilisk::conversation::...` instead of
// navigating the whole hierarchy.
pub use basilisk::{
    account, archive, attachment, autosave, cli, conversation, database, engine, engines, error,
    init_logger, ocr, orchestrator, profile, provider, resolver, storage, worker,
};
pub use basilisk::{Conversation, Message, MessageBlock, MessageRole, SystemMessage};
