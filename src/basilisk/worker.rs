//! Long-running side-operation workers.
//!
//! OCR and transcription run away from the UI event loop and report back
//! through a single contract: a queue of tagged [`WorkerEvent`]s plus a shared
//! [`CancelFlag`].  The parent polls the queue on a fixed cadence
//! ([`POLL_INTERVAL`]), draining everything pending on each tick, updating its
//! progress view, and checking liveness and the cancel flag.
//!
//! Two runners honour the contract:
//!
//! - [`spawn_process_worker`] drives an external command in its own OS
//!   process; the child emits one JSON event per stdout line.  Cancellation
//!   escalates: kill, wait up to one second, then force-reap.
//! - [`spawn_thread_worker`] runs a closure on a plain thread, used for
//!   engine-backed OCR (plain HTTP work) and in tests.  Cancellation is
//!   cooperative only: the task is expected to observe the flag at safe
//!   points.

use std::io::BufRead;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Cadence at which the parent drains worker events.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long a cancelled process worker is given to exit before force-reaping.
pub const CANCEL_GRACE: Duration = Duration::from_secs(1);

/// Tagged event emitted by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "value", rename_all = "lowercase")]
pub enum WorkerEvent {
    /// Free-form status line for display.
    Message(String),
    /// Completion percentage, `0..=100`.
    Progress(u8),
    /// Final result; at most one per run.
    Result(serde_json::Value),
    /// Terminal failure description.
    Error(String),
}

/// Shared cooperative cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Sending half of the worker queue.  Send failures are ignored: a parent
/// that has gone away has no further use for events.
#[derive(Clone)]
pub struct WorkerSender(Sender<WorkerEvent>);

impl WorkerSender {
    pub fn message(&self, text: impl Into<String>) {
        let _ = self.0.send(WorkerEvent::Message(text.into()));
    }

    pub fn progress(&self, percent: u8) {
        let _ = self.0.send(WorkerEvent::Progress(percent.min(100)));
    }

    pub fn result(&self, value: serde_json::Value) {
        let _ = self.0.send(WorkerEvent::Result(value));
    }

    pub fn error(&self, text: impl Into<String>) {
        let _ = self.0.send(WorkerEvent::Error(text.into()));
    }
}

/// Terminal state of a worker run.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerOutcome {
    Finished(serde_json::Value),
    Failed(String),
    Cancelled,
}

/// Snapshot returned by one poll tick.
#[derive(Debug, Default)]
pub struct WorkerStatus {
    /// Status lines received this tick, in arrival order.
    pub messages: Vec<String>,
    /// Most recent progress value seen this tick, if any.
    pub progress: Option<u8>,
    /// Present once the worker has reached a terminal state.
    pub outcome: Option<WorkerOutcome>,
}

/// Drains the event queue and tracks the terminal state; shared by both
/// runner flavours.
struct EventPump {
    receiver: Receiver<WorkerEvent>,
    outcome: Option<WorkerOutcome>,
}

impl EventPump {
    fn new(receiver: Receiver<WorkerEvent>) -> Self {
        EventPump {
            receiver,
            outcome: None,
        }
    }

    fn drain(&mut self, cancel: &CancelFlag) -> WorkerStatus {
        let mut status = WorkerStatus::default();
        loop {
            match self.receiver.try_recv() {
                Ok(WorkerEvent::Message(text)) => status.messages.push(text),
                Ok(WorkerEvent::Progress(percent)) => status.progress = Some(percent),
                Ok(WorkerEvent::Result(value)) => {
                    self.outcome.get_or_insert(WorkerOutcome::Finished(value));
                }
                Ok(WorkerEvent::Error(text)) => {
                    self.outcome.get_or_insert(WorkerOutcome::Failed(text));
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if self.outcome.is_none() {
                        self.outcome = Some(if cancel.is_cancelled() {
                            WorkerOutcome::Cancelled
                        } else {
                            WorkerOutcome::Failed("worker terminated without a result".to_string())
                        });
                    }
                    break;
                }
            }
        }
        status.outcome = self.outcome.clone();
        status
    }
}

/// Worker running a closure on a dedicated thread.
pub struct ThreadWorker {
    pump: EventPump,
    cancel: CancelFlag,
    handle: Option<std::thread::JoinHandle<()>>,
}

/// Run `task` on its own thread under the worker contract.
///
/// The task receives the sending half of the queue and the cancel flag; its
/// return value is forwarded as a `result` event (suppressed when the flag is
/// already set), and an `Err` becomes an `error` event.
pub fn spawn_thread_worker<F>(task: F) -> ThreadWorker
where
    F: FnOnce(&WorkerSender, &CancelFlag) -> Result<serde_json::Value, String> + Send + 'static,
{
    let (sender, receiver) = std::sync::mpsc::channel();
    let cancel = CancelFlag::new();
    let worker_cancel = cancel.clone();
    let handle = std::thread::spawn(move || {
        let sender = WorkerSender(sender);
        match task(&sender, &worker_cancel) {
            Ok(value) => {
                if !worker_cancel.is_cancelled() {
                    sender.result(value);
                }
            }
            Err(text) => sender.error(text),
        }
    });
    ThreadWorker {
        pump: EventPump::new(receiver),
        cancel,
        handle: Some(handle),
    }
}

impl ThreadWorker {
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Request cooperative cancellation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// One poll tick: drain pending events and report state.
    pub fn poll(&mut self) -> WorkerStatus {
        self.pump.drain(&self.cancel)
    }

    /// Block until the worker thread exits and return the terminal outcome.
    pub fn join(mut self) -> WorkerOutcome {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.pump
            .drain(&self.cancel)
            .outcome
            .unwrap_or(WorkerOutcome::Cancelled)
    }
}

/// Worker running an external command in its own OS process.
///
/// The child is expected to print one serialised [`WorkerEvent`] per stdout
/// line; anything that does not parse is forwarded as a `message` event.
pub struct ProcessWorker {
    pump: EventPump,
    cancel: CancelFlag,
    child: Child,
}

/// Spawn `command` under the worker contract.
pub fn spawn_process_worker(mut command: Command) -> std::io::Result<ProcessWorker> {
    command.stdout(Stdio::piped()).stderr(Stdio::null());
    let mut child = command.spawn()?;
    let stdout = child.stdout.take().expect("piped stdout");
    let (sender, receiver) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let reader = std::io::BufReader::new(stdout);
        for line in reader.lines() {
            let Ok(line) = line else { break };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let event = serde_json::from_str::<WorkerEvent>(line)
                .unwrap_or_else(|_| WorkerEvent::Message(line.to_string()));
            if sender.send(event).is_err() {
                break;
            }
        }
    });
    Ok(ProcessWorker {
        pump: EventPump::new(receiver),
        cancel: CancelFlag::new(),
        child,
    })
}

impl ProcessWorker {
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// True while the child process has not been reaped.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// One poll tick: drain pending events and report state.
    pub fn poll(&mut self) -> WorkerStatus {
        self.pump.drain(&self.cancel)
    }

    /// Cancel the run: set the flag, terminate the child, wait up to
    /// [`CANCEL_GRACE`], then force-reap if it is still alive.
    pub fn cancel(&mut self) {
        self.cancel.cancel();
        let _ = self.child.kill();
        let deadline = Instant::now() + CANCEL_GRACE;
        while Instant::now() < deadline {
            match self.child.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) => std::thread::sleep(POLL_INTERVAL),
                Err(_) => return,
            }
        }
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for ProcessWorker {
    fn drop(&mut self) {
        if self.is_alive() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_worker_reports_progress_and_result() {
        let mut worker = spawn_thread_worker(|events, _cancel| {
            events.message("starting");
            events.progress(50);
            Ok(serde_json::json!({"ok": true}))
        });
        let outcome = loop {
            let status = worker.poll();
            if let Some(outcome) = status.outcome {
                break outcome;
            }
            std::thread::sleep(Duration::from_millis(5));
        };
        assert_eq!(outcome, WorkerOutcome::Finished(serde_json::json!({"ok": true})));
    }

    #[test]
    fn cancelled_thread_worker_suppresses_result() {
        let mut worker = spawn_thread_worker(|events, cancel| {
            events.progress(10);
            while !cancel.is_cancelled() {
                std::thread::sleep(Duration::from_millis(5));
            }
            Ok(serde_json::json!("late"))
        });
        // Wait for the first progress event, then cancel.
        loop {
            if worker.poll().progress == Some(10) {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        worker.cancel();
        assert_eq!(worker.join(), WorkerOutcome::Cancelled);
    }

    #[test]
    fn worker_event_wire_shape() {
        let event = WorkerEvent::Progress(42);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value, serde_json::json!({"event": "progress", "value": 42}));
        let back: WorkerEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn error_event_wins_over_missing_result() {
        let mut worker = spawn_thread_worker(|_, _| Err("boom".to_string()));
        let outcome = loop {
            if let Some(outcome) = worker.poll().outcome {
                break outcome;
            }
            std::thread::sleep(Duration::from_millis(5));
        };
        assert_eq!(outcome, WorkerOutcome::Failed("boom".to_string()));
    }
}
