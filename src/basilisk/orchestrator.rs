//! Completion orchestration.
//!
//! One [`CompletionOrchestrator`] serves one conversation tab.  It owns the
//! state machine below, runs at most one completion at a time, and never
//! touches UI objects: every observable effect is a [`CompletionEvent`]
//! marshalled through the host's [`Scheduler`].
//!
//! ```text
//! IDLE ──submit──▶ SENDING ──first-delta──▶ STREAMING ──end──▶ IDLE
//!        │                        │                  │
//!        │                        └──error──▶ FAILED ─▶ IDLE (partial kept if any)
//!        │                        └──cancel─▶ CANCELLED ─▶ IDLE (partial kept)
//!        └──busy──▶ rejected with `BasiliskError::Busy`
//! ```
//!
//! Cancellation is cooperative: the shared flag is observed at the top of
//! each stream step, and abandoning the stream drops the underlying response
//! — the closest thing to a best-effort `close()` the transport offers.
//! Deltas of a block are applied in arrival order; blocks across a
//! conversation are appended in submission order because only one completion
//! runs at a time.

use std::sync::{Arc, Mutex};

use futures_util::StreamExt;

use crate::basilisk::conversation::{
    AiModelRef, Conversation, Message, MessageBlock, SystemMessage, PROMPT_TITLE,
};
use crate::basilisk::engine::{CompletionHandle, ProviderEngine};
use crate::basilisk::engines::common::normalize_linesep;
use crate::basilisk::error::BasiliskError;
use crate::basilisk::worker::CancelFlag;

/// Marshals closures onto the thread that owns the UI.
///
/// The UI layer provides the only real implementation; headless hosts and
/// tests use [`DirectScheduler`].
pub trait Scheduler: Send + Sync {
    fn post(&self, f: Box<dyn FnOnce() + Send>);
}

/// Runs posted closures immediately on the calling thread.
pub struct DirectScheduler;

impl Scheduler for DirectScheduler {
    fn post(&self, f: Box<dyn FnOnce() + Send>) {
        f();
    }
}

/// Observable per-tab completion state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionState {
    Idle,
    Sending,
    Streaming,
}

/// Events delivered to the tab's handler, in order, via the scheduler.
pub enum CompletionEvent {
    StateChanged(CompletionState),
    /// One streamed text delta, already in arrival order.
    Delta(String),
    /// Completion succeeded; the sealed block is ready to append.
    Finished(MessageBlock),
    /// Completion was cancelled; the block is sealed with whatever partial
    /// text was received (possibly empty).
    Cancelled(MessageBlock),
    /// Completion failed.  `partial` carries a sealed block when some content
    /// had already been received, else the draft is discarded.
    Failed {
        error: BasiliskError,
        partial: Option<MessageBlock>,
    },
}

type EventHandler = Arc<dyn Fn(CompletionEvent) + Send + Sync>;

/// Stateful driver for a single conversation's completions.
pub struct CompletionOrchestrator {
    state: Arc<Mutex<CompletionState>>,
    current_cancel: Arc<Mutex<Option<CancelFlag>>>,
    scheduler: Arc<dyn Scheduler>,
    handler: EventHandler,
    runtime: tokio::runtime::Handle,
}

impl CompletionOrchestrator {
    /// Create an orchestrator bound to the current tokio runtime.
    ///
    /// `handler` receives every [`CompletionEvent`]; it runs on whatever
    /// thread `scheduler.post` dispatches to.
    pub fn new(scheduler: Arc<dyn Scheduler>, handler: EventHandler) -> Self {
        CompletionOrchestrator {
            state: Arc::new(Mutex::new(CompletionState::Idle)),
            current_cancel: Arc::new(Mutex::new(None)),
            scheduler,
            handler,
            runtime: tokio::runtime::Handle::current(),
        }
    }

    /// Current state of this tab.
    pub fn state(&self) -> CompletionState {
        *self.state.lock().expect("state lock")
    }

    /// Submit a completion for `new_block` against a snapshot of the
    /// conversation.
    ///
    /// Rejects with [`BasiliskError::Busy`] while a completion is in flight;
    /// submissions for other conversations (other orchestrators) are
    /// unaffected.
    pub fn submit(
        &self,
        engine: Arc<dyn ProviderEngine>,
        conversation: Conversation,
        new_block: MessageBlock,
        system: Option<SystemMessage>,
    ) -> Result<(), BasiliskError> {
        {
            let mut state = self.state.lock().expect("state lock");
            if *state != CompletionState::Idle {
                return Err(BasiliskError::Busy);
            }
            *state = CompletionState::Sending;
        }
        let cancel = CancelFlag::new();
        *self.current_cancel.lock().expect("cancel lock") = Some(cancel.clone());

        let state = Arc::clone(&self.state);
        let current_cancel = Arc::clone(&self.current_cancel);
        let scheduler = Arc::clone(&self.scheduler);
        let handler = Arc::clone(&self.handler);
        self.runtime.spawn(async move {
            let emitter = Emitter { scheduler, handler };
            emitter.emit(CompletionEvent::StateChanged(CompletionState::Sending));
            run_completion(engine, conversation, new_block, system, cancel, &state, &emitter)
                .await;
            *current_cancel.lock().expect("cancel lock") = None;
            *state.lock().expect("state lock") = CompletionState::Idle;
            emitter.emit(CompletionEvent::StateChanged(CompletionState::Idle));
        });
        Ok(())
    }

    /// Request cancellation of the in-flight completion, if any.
    ///
    /// Returns immediately; within one stream step the worker stops
    /// appending deltas and the draft is sealed with the partial content.
    pub fn cancel(&self) -> bool {
        match self.current_cancel.lock().expect("cancel lock").as_ref() {
            Some(flag) => {
                flag.cancel();
                true
            }
            None => false,
        }
    }
}

struct Emitter {
    scheduler: Arc<dyn Scheduler>,
    handler: EventHandler,
}

impl Emitter {
    fn emit(&self, event: CompletionEvent) {
        let handler = Arc::clone(&self.handler);
        self.scheduler.post(Box::new(move || handler(event)));
    }
}

async fn run_completion(
    engine: Arc<dyn ProviderEngine>,
    conversation: Conversation,
    mut new_block: MessageBlock,
    system: Option<SystemMessage>,
    cancel: CancelFlag,
    state: &Arc<Mutex<CompletionState>>,
    emitter: &Emitter,
) {
    let handle = match engine
        .completion(&conversation, &new_block, system.as_ref())
        .await
    {
        Ok(handle) => handle,
        Err(error) => {
            if !error.is_cancelled() && log::log_enabled!(log::Level::Error) {
                log::error!("completion failed before any content: {}", error);
            }
            emitter.emit(CompletionEvent::Failed {
                error,
                partial: None,
            });
            return;
        }
    };

    match handle {
        CompletionHandle::Full(payload) => {
            let sealed = engine.extract_final(&payload, new_block);
            emitter.emit(CompletionEvent::Finished(sealed));
        }
        CompletionHandle::Stream(mut deltas) => {
            let mut accumulated = String::new();
            let mut streaming = false;
            loop {
                // Cancellation is observed at the top of each stream step.
                if cancel.is_cancelled() {
                    drop(deltas);
                    new_block.seal(normalize_linesep(&accumulated));
                    emitter.emit(CompletionEvent::Cancelled(new_block));
                    return;
                }
                let step = deltas.next().await;
                // A cancel raised while the step was in flight abandons the
                // stream before the delta is applied.
                if cancel.is_cancelled() {
                    drop(deltas);
                    new_block.seal(normalize_linesep(&accumulated));
                    emitter.emit(CompletionEvent::Cancelled(new_block));
                    return;
                }
                match step {
                    Some(Ok(delta)) => {
                        if !streaming {
                            streaming = true;
                            *state.lock().expect("state lock") = CompletionState::Streaming;
                            emitter.emit(CompletionEvent::StateChanged(CompletionState::Streaming));
                        }
                        accumulated.push_str(&delta);
                        emitter.emit(CompletionEvent::Delta(delta));
                    }
                    Some(Err(error)) => {
                        drop(deltas);
                        let partial = if accumulated.is_empty() {
                            None
                        } else {
                            new_block.seal(normalize_linesep(&accumulated));
                            Some(new_block)
                        };
                        if log::log_enabled!(log::Level::Error) {
                            log::error!("stream failed after {} chars: {}", accumulated.len(), error);
                        }
                        emitter.emit(CompletionEvent::Failed { error, partial });
                        return;
                    }
                    None => {
                        new_block.seal(normalize_linesep(&accumulated));
                        emitter.emit(CompletionEvent::Finished(new_block));
                        return;
                    }
                }
            }
        }
    }
}

/// Generate a conversation title through the same engine pathway.
///
/// Sends [`PROMPT_TITLE`] as a fresh, non-streamed block that is never
/// appended to the conversation; the returned text is trimmed of quotes and
/// newlines and is ready to assign as the title.
pub async fn generate_title(
    engine: &dyn ProviderEngine,
    conversation: &Conversation,
) -> Result<String, BasiliskError> {
    let model = conversation
        .messages
        .last()
        .map(|block| block.model.clone())
        .or_else(|| {
            engine
                .models()
                .first()
                .map(|descriptor| AiModelRef::new(engine.provider_id(), descriptor.id.clone()))
        })
        .ok_or_else(|| BasiliskError::Config("engine serves no models".to_string()))?;
    let block = MessageBlock::new(Message::user(PROMPT_TITLE), model);

    let handle = engine.completion(conversation, &block, None).await?;
    let sealed = match handle {
        CompletionHandle::Full(payload) => engine.extract_final(&payload, block),
        CompletionHandle::Stream(mut deltas) => {
            let mut accumulated = String::new();
            while let Some(delta) = deltas.next().await {
                accumulated.push_str(&delta?);
            }
            let mut block = block;
            block.seal(normalize_linesep(&accumulated));
            block
        }
    };
    let raw = sealed.response.map(|m| m.content).unwrap_or_default();
    Ok(clean_title(&raw))
}

/// Strip newlines and surrounding quotes from a model-proposed title.
fn clean_title(raw: &str) -> String {
    let flattened = raw.replace(['\r', '\n'], " ");
    flattened
        .trim()
        .trim_matches(['"', '\'', '\u{201c}', '\u{201d}'])
        .trim()
        .to_string()
}
