/// Tests for the completion orchestrator state machine: streaming,
/// cancellation, busy rejection, error surfacing, and title generation.
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use basilisk::conversation::{AiModelRef, Conversation, Message, MessageBlock, SystemMessage};
use basilisk::engine::{CompletionHandle, ModelDescriptor, ProviderEngine};
use basilisk::error::BasiliskError;
use basilisk::orchestrator::{
    generate_title, CompletionEvent, CompletionOrchestrator, CompletionState, DirectScheduler,
};
use basilisk::provider::Capability;
use serde_json::json;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

const MOCK_CAPABILITIES: &[Capability] = &[Capability::Text];

type DeltaResult = Result<String, BasiliskError>;

enum MockBehavior {
    /// Streamed deltas fed by the test through a channel.
    Stream(Mutex<Option<UnboundedReceiver<DeltaResult>>>),
    /// Immediate non-streaming payload.
    Full(serde_json::Value),
    /// Fail before any content.
    Fail(BasiliskError),
}

struct MockEngine {
    behavior: MockBehavior,
}

impl MockEngine {
    fn streaming() -> (Arc<Self>, UnboundedSender<DeltaResult>) {
        let (sender, receiver) = unbounded_channel();
        (
            Arc::new(MockEngine {
                behavior: MockBehavior::Stream(Mutex::new(Some(receiver))),
            }),
            sender,
        )
    }

    fn full(payload: serde_json::Value) -> Arc<Self> {
        Arc::new(MockEngine {
            behavior: MockBehavior::Full(payload),
        })
    }

    fn failing(error: BasiliskError) -> Arc<Self> {
        Arc::new(MockEngine {
            behavior: MockBehavior::Fail(error),
        })
    }
}

#[async_trait]
impl ProviderEngine for MockEngine {
    fn provider_id(&self) -> &str {
        "openai"
    }

    fn capabilities(&self) -> &'static [Capability] {
        MOCK_CAPABILITIES
    }

    fn models(&self) -> Vec<ModelDescriptor> {
        vec![ModelDescriptor::new("mock-model", "Mock Model")]
    }

    fn prepare_request(
        &self,
        _conversation: &Conversation,
        _new_block: &MessageBlock,
        _system: Option<&SystemMessage>,
        _stream: bool,
    ) -> Result<serde_json::Value, BasiliskError> {
        Ok(json!({}))
    }

    async fn completion(
        &self,
        _conversation: &Conversation,
        _new_block: &MessageBlock,
        _system: Option<&SystemMessage>,
    ) -> Result<CompletionHandle, BasiliskError> {
        match &self.behavior {
            MockBehavior::Stream(receiver) => {
                let receiver = receiver
                    .lock()
                    .unwrap()
                    .take()
                    .expect("mock stream consumed twice");
                Ok(CompletionHandle::Stream(Box::pin(
                    futures_util::stream::unfold(receiver, |mut receiver| async move {
                        receiver.recv().await.map(|item| (item, receiver))
                    }),
                )))
            }
            MockBehavior::Full(payload) => Ok(CompletionHandle::Full(payload.clone())),
            MockBehavior::Fail(error) => Err(error.clone()),
        }
    }
}

type EventLog = Arc<Mutex<Vec<CompletionEvent>>>;

fn orchestrator() -> (CompletionOrchestrator, EventLog) {
    let events: EventLog = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let orchestrator = CompletionOrchestrator::new(
        Arc::new(DirectScheduler),
        Arc::new(move |event| sink.lock().unwrap().push(event)),
    );
    (orchestrator, events)
}

fn streaming_block() -> MessageBlock {
    let mut block = MessageBlock::new(
        Message::user("hello"),
        AiModelRef::new("openai", "mock-model"),
    );
    block.stream = true;
    block
}

fn delta_count(events: &EventLog) -> usize {
    events
        .lock()
        .unwrap()
        .iter()
        .filter(|event| matches!(event, CompletionEvent::Delta(_)))
        .count()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..600 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met within 3s");
}

#[tokio::test]
async fn stream_cancel_seals_partial_and_returns_to_idle() {
    basilisk::init_logger();
    let (engine, sender) = MockEngine::streaming();
    let (orchestrator, events) = orchestrator();

    orchestrator
        .submit(engine, Conversation::new(), streaming_block(), None)
        .unwrap();

    sender.send(Ok("Hel".to_string())).unwrap();
    sender.send(Ok("lo".to_string())).unwrap();
    wait_until(|| delta_count(&events) == 2).await;

    assert!(orchestrator.cancel());
    // Wake the stream so the abandoned step is observed; this delta must not
    // be applied.
    sender.send(Ok("!!".to_string())).unwrap();

    wait_until(|| orchestrator.state() == CompletionState::Idle).await;
    let events = events.lock().unwrap();
    let sealed = events
        .iter()
        .find_map(|event| match event {
            CompletionEvent::Cancelled(block) => Some(block.clone()),
            _ => None,
        })
        .expect("cancelled event");
    assert_eq!(sealed.response.as_ref().unwrap().content, "Hello");
    assert_eq!(
        events
            .iter()
            .filter(|event| matches!(event, CompletionEvent::Delta(_)))
            .count(),
        2
    );
}

#[tokio::test]
async fn concurrent_submission_is_rejected_busy() {
    let (engine, sender) = MockEngine::streaming();
    let (orchestrator, events) = orchestrator();

    orchestrator
        .submit(
            Arc::clone(&engine) as Arc<dyn ProviderEngine>,
            Conversation::new(),
            streaming_block(),
            None,
        )
        .unwrap();
    wait_until(|| orchestrator.state() != CompletionState::Idle).await;

    let rejected = orchestrator.submit(engine, Conversation::new(), streaming_block(), None);
    assert!(matches!(rejected, Err(BasiliskError::Busy)));

    orchestrator.cancel();
    sender.send(Ok(String::new())).unwrap();
    wait_until(|| orchestrator.state() == CompletionState::Idle).await;
    // Cancelling with no received content seals an empty response.
    let events = events.lock().unwrap();
    assert!(events.iter().any(|event| matches!(
        event,
        CompletionEvent::Cancelled(block) if block.response.as_ref().unwrap().content.is_empty()
    )));
}

#[tokio::test]
async fn finished_stream_seals_accumulated_content() {
    let (engine, sender) = MockEngine::streaming();
    let (orchestrator, events) = orchestrator();
    let mut conversation = Conversation::new();
    conversation.title = Some("t".to_string());

    orchestrator
        .submit(engine, conversation, streaming_block(), None)
        .unwrap();
    sender.send(Ok("Hi ".to_string())).unwrap();
    sender.send(Ok("there".to_string())).unwrap();
    drop(sender);

    wait_until(|| {
        events
            .lock()
            .unwrap()
            .iter()
            .any(|event| matches!(event, CompletionEvent::Finished(_)))
    })
    .await;

    let events = events.lock().unwrap();
    let sealed = events
        .iter()
        .find_map(|event| match event {
            CompletionEvent::Finished(block) => Some(block.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(sealed.response.as_ref().unwrap().content, "Hi there");
    // Sending → Streaming → Idle is observable in order.
    let states: Vec<CompletionState> = events
        .iter()
        .filter_map(|event| match event {
            CompletionEvent::StateChanged(state) => Some(*state),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            CompletionState::Sending,
            CompletionState::Streaming,
            CompletionState::Idle,
        ]
    );
}

#[tokio::test]
async fn stream_error_after_content_keeps_partial() {
    let (engine, sender) = MockEngine::streaming();
    let (orchestrator, events) = orchestrator();

    orchestrator
        .submit(engine, Conversation::new(), streaming_block(), None)
        .unwrap();
    sender.send(Ok("part".to_string())).unwrap();
    sender
        .send(Err(BasiliskError::transport("connection reset")))
        .unwrap();

    wait_until(|| {
        events
            .lock()
            .unwrap()
            .iter()
            .any(|event| matches!(event, CompletionEvent::Failed { .. }))
    })
    .await;

    let events = events.lock().unwrap();
    match events
        .iter()
        .find(|event| matches!(event, CompletionEvent::Failed { .. }))
        .unwrap()
    {
        CompletionEvent::Failed { error, partial } => {
            assert!(matches!(error, BasiliskError::Transport { .. }));
            assert_eq!(
                partial.as_ref().unwrap().response.as_ref().unwrap().content,
                "part"
            );
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn failure_before_content_discards_the_draft() {
    let engine = MockEngine::failing(BasiliskError::Credential("bad key".to_string()));
    let (orchestrator, events) = orchestrator();

    orchestrator
        .submit(engine, Conversation::new(), streaming_block(), None)
        .unwrap();
    wait_until(|| orchestrator.state() == CompletionState::Idle).await;

    let events = events.lock().unwrap();
    match events
        .iter()
        .find(|event| matches!(event, CompletionEvent::Failed { .. }))
        .unwrap()
    {
        CompletionEvent::Failed { error, partial } => {
            assert!(matches!(error, BasiliskError::Credential(_)));
            assert!(partial.is_none());
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn non_streaming_completion_is_extracted_and_finished() {
    let engine = MockEngine::full(json!({
        "choices": [{"message": {"content": "final answer"}}],
    }));
    let (orchestrator, events) = orchestrator();
    let block = MessageBlock::new(
        Message::user("question"),
        AiModelRef::new("openai", "mock-model"),
    );

    orchestrator
        .submit(engine, Conversation::new(), block, None)
        .unwrap();
    wait_until(|| orchestrator.state() == CompletionState::Idle).await;

    let events = events.lock().unwrap();
    let sealed = events
        .iter()
        .find_map(|event| match event {
            CompletionEvent::Finished(block) => Some(block.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(sealed.response.as_ref().unwrap().content, "final answer");
}

#[tokio::test]
async fn generate_title_trims_quotes_and_newlines() {
    let engine = MockEngine::full(json!({
        "choices": [{"message": {"content": "\"Rust Lifetimes Explained\"\n"}}],
    }));
    let conversation = Conversation::new();
    let title = generate_title(engine.as_ref(), &conversation).await.unwrap();
    assert_eq!(title, "Rust Lifetimes Explained");
}

#[tokio::test]
async fn sealed_blocks_keep_the_single_draft_invariant() {
    // Drive a full cycle and append the sealed block the way a tab does;
    // at no point may the model hold more than one unresponded block.
    let (engine, sender) = MockEngine::streaming();
    let conversation = Arc::new(Mutex::new(Conversation::new()));
    let model = Arc::clone(&conversation);
    let orchestrator = CompletionOrchestrator::new(
        Arc::new(DirectScheduler),
        Arc::new(move |event| {
            if let CompletionEvent::Finished(block) = event {
                let mut conversation = model.lock().unwrap();
                conversation.add_block(block, None);
                assert!(
                    conversation
                        .messages
                        .iter()
                        .filter(|b| b.is_draft())
                        .count()
                        <= 1
                );
            }
        }),
    );

    orchestrator
        .submit(
            engine,
            conversation.lock().unwrap().clone(),
            streaming_block(),
            None,
        )
        .unwrap();
    sender.send(Ok("done".to_string())).unwrap();
    drop(sender);
    wait_until(|| orchestrator.state() == CompletionState::Idle).await;
    wait_until(|| !conversation.lock().unwrap().messages.is_empty()).await;

    let conversation = conversation.lock().unwrap();
    assert_eq!(conversation.messages.len(), 1);
    assert!(!conversation.messages[0].is_draft());
}
