//! Debounced draft autosave.
//!
//! While the prompt field is dirty, the pending user-side block (request
//! only, no response) is flushed to the database after a quiet period.  Every
//! edit restarts the debounce window; only the newest payload is flushed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::basilisk::attachment::Attachment;

/// Minimum debounce window; shorter configured delays are clamped up.
pub const MIN_DELAY: Duration = Duration::from_secs(2);

/// Snapshot of the prompt area flushed to the drafts table.
#[derive(Debug, Clone, PartialEq)]
pub struct DraftPayload {
    pub conversation_id: i64,
    pub prompt_text: String,
    pub attachments: Vec<Attachment>,
    /// Sampling parameters as an opaque JSON object.
    pub params: serde_json::Value,
}

type FlushFn = Arc<dyn Fn(DraftPayload) + Send + Sync>;

/// Debounce timer feeding the drafts table.
pub struct DraftAutosave {
    delay: Duration,
    enabled: bool,
    generation: Arc<AtomicU64>,
    pending: Arc<Mutex<Option<DraftPayload>>>,
    flush: FlushFn,
    runtime: tokio::runtime::Handle,
}

impl DraftAutosave {
    /// `flush` is called with the newest payload once the prompt has been
    /// quiet for `delay` (clamped to at least [`MIN_DELAY`]).
    pub fn new(delay: Duration, flush: FlushFn) -> Self {
        DraftAutosave {
            delay: delay.max(MIN_DELAY),
            enabled: true,
            generation: Arc::new(AtomicU64::new(0)),
            pending: Arc::new(Mutex::new(None)),
            flush,
            runtime: tokio::runtime::Handle::current(),
        }
    }

    /// Toggle autosave, e.g. off for private conversations.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Record an edit.  Restarts the debounce window with the new payload.
    pub fn mark_dirty(&self, payload: DraftPayload) {
        if !self.enabled {
            return;
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.pending.lock().expect("pending lock") = Some(payload);

        let delay = self.delay;
        let generation_counter = Arc::clone(&self.generation);
        let pending = Arc::clone(&self.pending);
        let flush = Arc::clone(&self.flush);
        self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            // A newer edit supersedes this timer.
            if generation_counter.load(Ordering::SeqCst) != generation {
                return;
            }
            let payload = pending.lock().expect("pending lock").take();
            if let Some(payload) = payload {
                flush(payload);
            }
        });
    }

    /// Drop any pending payload without flushing (e.g. after submit).
    pub fn discard(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.pending.lock().expect("pending lock").take();
    }
}
