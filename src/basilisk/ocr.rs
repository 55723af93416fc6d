//! OCR and transcription side operations.
//!
//! Both run through a capable engine under the worker contract of
//! [`worker`](crate::basilisk::worker): the caller polls the returned worker
//! for `message` / `progress` events and a final `result`, and cancels via
//! the shared flag.  Capability is checked before any network call.

use std::path::PathBuf;
use std::sync::Arc;

use crate::basilisk::attachment::Attachment;
use crate::basilisk::engine::ProviderEngine;
use crate::basilisk::error::BasiliskError;
use crate::basilisk::provider::Capability;
use crate::basilisk::storage::StorageRoot;
use crate::basilisk::worker::{spawn_thread_worker, ThreadWorker};

/// Start text recognition over `attachments` on a worker thread.
///
/// The worker emits one `message` and one `progress` event per image and
/// finishes with a `result` carrying the recognised texts as a JSON array in
/// attachment order.
pub fn start_ocr(
    engine: Arc<dyn ProviderEngine>,
    attachments: Vec<Attachment>,
    store: StorageRoot,
) -> Result<ThreadWorker, BasiliskError> {
    if !engine.has_capability(Capability::Ocr) {
        return Err(BasiliskError::Capability(format!(
            "{} does not support OCR",
            engine.provider_id()
        )));
    }
    Ok(spawn_thread_worker(move |events, cancel| {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| err.to_string())?;
        match runtime.block_on(engine.handle_ocr(
            &attachments,
            &store,
            events.clone(),
            cancel.clone(),
        )) {
            Ok(texts) => Ok(serde_json::json!(texts)),
            // The runner suppresses results once the flag is set; returning a
            // placeholder avoids a spurious error event.
            Err(BasiliskError::Cancelled) => Ok(serde_json::Value::Null),
            Err(err) => Err(err.to_string()),
        }
    }))
}

/// Start audio transcription on a worker thread.
///
/// Finishes with a `result` carrying the transcript as a JSON string.
pub fn start_transcription(
    engine: Arc<dyn ProviderEngine>,
    audio_path: PathBuf,
    response_format: String,
) -> Result<ThreadWorker, BasiliskError> {
    if !engine.has_capability(Capability::Stt) {
        return Err(BasiliskError::Capability(format!(
            "{} does not support transcription",
            engine.provider_id()
        )));
    }
    Ok(spawn_thread_worker(move |events, _cancel| {
        events.message(format!("Transcribing {}", audio_path.display()));
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| err.to_string())?;
        match runtime.block_on(engine.transcribe(&audio_path, &response_format)) {
            Ok(text) => Ok(serde_json::json!(text)),
            Err(err) => Err(err.to_string()),
        }
    }))
}
