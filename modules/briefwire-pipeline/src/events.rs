//! Stage-event emission. The emitter normalizes pipeline progress into typed
//! events and pushes them over a channel; the server end turns them into SSE
//! frames. Emission after the receiver is gone is a silent no-op.

use chrono::Utc;
use tokio::sync::mpsc;

use briefwire_common::{Stage, StageEvent, StageStatus};

/// Everything that can go down one run's SSE stream.
#[derive(Debug, Clone)]
pub enum OutboundEvent {
    /// Framed as `event: stage-event`.
    Stage(StageEvent),
    /// Diagnostic events with their own event names (`fatal`,
    /// `retrieval-result`, `outline-result`, `targeted-research-result`).
    Named {
        event: String,
        data: serde_json::Value,
    },
}

#[derive(Clone)]
pub struct StageEmitter {
    run_id: String,
    tx: mpsc::UnboundedSender<OutboundEvent>,
}

impl StageEmitter {
    pub fn new(run_id: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<OutboundEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                run_id: run_id.into(),
                tx,
            },
            rx,
        )
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    fn emit_stage(
        &self,
        stage: Stage,
        status: StageStatus,
        message: Option<String>,
        data: Option<serde_json::Value>,
    ) {
        let event = StageEvent {
            run_id: self.run_id.clone(),
            stage,
            status,
            message,
            data,
            ts: Utc::now(),
        };
        // A closed channel means the stream was torn down; drop silently.
        let _ = self.tx.send(OutboundEvent::Stage(event));
    }

    pub fn start(&self, stage: Stage, message: impl Into<String>) {
        self.emit_stage(stage, StageStatus::Start, Some(message.into()), None);
    }

    pub fn progress(&self, stage: Stage, message: impl Into<String>, data: Option<serde_json::Value>) {
        self.emit_stage(stage, StageStatus::Progress, Some(message.into()), data);
    }

    pub fn success(&self, stage: Stage, data: Option<serde_json::Value>) {
        self.emit_stage(stage, StageStatus::Success, None, data);
    }

    pub fn failure(&self, stage: Stage, message: impl Into<String>) {
        self.emit_stage(stage, StageStatus::Failure, Some(message.into()), None);
    }

    /// Diagnostic event with its own SSE event name.
    pub fn named(&self, event: impl Into<String>, data: serde_json::Value) {
        let _ = self.tx.send(OutboundEvent::Named {
            event: event.into(),
            data,
        });
    }

    pub fn fatal(&self, error: impl std::fmt::Display) {
        self.named("fatal", serde_json::json!({ "error": error.to_string() }));
    }
}
