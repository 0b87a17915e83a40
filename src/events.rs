//! Events published to the host.
//!
//! Every logical operation produces zero or more progress/phase events and
//! then exactly one terminal event. Sinks are called with the operation's
//! state locked, so they queue and return.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::EngineError;
use crate::models::{ErrorCode, OperationCategory, Phase, ProgressSnapshot, RemediationAction};

/// Engine -> host events. Hosts subscribe through an [`EventSink`] and
/// switch on `event`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum EngineEvent {
    Progress {
        operation_id: Uuid,
        category: OperationCategory,
        progress: ProgressSnapshot,
    },
    PhaseChanged {
        operation_id: Uuid,
        category: OperationCategory,
        phase: Phase,
    },
    Completed {
        operation_id: Uuid,
        category: OperationCategory,
        path: String,
    },
    Failed {
        operation_id: Uuid,
        category: OperationCategory,
        error_code: ErrorCode,
        user_message: String,
        actions: Vec<RemediationAction>,
    },
    Cancelled {
        operation_id: Uuid,
        category: OperationCategory,
    },
}

impl EngineEvent {
    pub fn failed(operation_id: Uuid, category: OperationCategory, error: &EngineError) -> Self {
        let error_code = error.error_code();
        EngineEvent::Failed {
            operation_id,
            category,
            error_code,
            user_message: error.user_message(),
            actions: error_code.actions(),
        }
    }

    pub fn operation_id(&self) -> Uuid {
        match self {
            EngineEvent::Progress { operation_id, .. }
            | EngineEvent::PhaseChanged { operation_id, .. }
            | EngineEvent::Completed { operation_id, .. }
            | EngineEvent::Failed { operation_id, .. }
            | EngineEvent::Cancelled { operation_id, .. } => *operation_id,
        }
    }

    pub fn category(&self) -> OperationCategory {
        match self {
            EngineEvent::Progress { category, .. }
            | EngineEvent::PhaseChanged { category, .. }
            | EngineEvent::Completed { category, .. }
            | EngineEvent::Failed { category, .. }
            | EngineEvent::Cancelled { category, .. } => *category,
        }
    }

    /// Completed, failed or cancelled.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EngineEvent::Completed { .. } | EngineEvent::Failed { .. } | EngineEvent::Cancelled { .. }
        )
    }

    /// Flat event name, e.g. `download-progress` or `conversion-error`.
    pub fn name(&self) -> String {
        let suffix = match self {
            EngineEvent::Progress { .. } => "progress",
            EngineEvent::PhaseChanged { .. } => "phase",
            EngineEvent::Completed { .. } => "complete",
            EngineEvent::Failed { .. } => "error",
            EngineEvent::Cancelled { .. } => "cancelled",
        };
        format!("{}-{}", self.category().as_str(), suffix)
    }
}

/// Receives every event the engine publishes. Implementations must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &EngineEvent) -> Result<()>;
}

pub type SharedSink = Arc<dyn EventSink>;

/// Forwards events into an unbounded channel.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: &EngineEvent) -> Result<()> {
        self.tx
            .send(event.clone())
            .map_err(|_| anyhow::anyhow!("event receiver dropped"))
    }
}

/// Writes one JSON object per line. `emit` only queues; a writer task does
/// the serialising and the I/O.
pub struct JsonLinesSink {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl JsonLinesSink {
    /// Start the writer task on `out`. The task hands `out` back once the
    /// sink is dropped and the queue is drained.
    pub fn spawn<W>(out: W) -> (Self, JoinHandle<W>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<EngineEvent>();
        let writer = tokio::spawn(async move {
            let mut out = out;
            while let Some(event) = rx.recv().await {
                if let Err(e) = write_line(&mut out, &event).await {
                    log::warn!("Failed to write {}: {:#}", event.name(), e);
                }
            }
            out
        });
        (Self { tx }, writer)
    }
}

async fn write_line<W: AsyncWrite + Unpin>(out: &mut W, event: &EngineEvent) -> Result<()> {
    let mut line = serde_json::to_string(event)?;
    line.push('\n');
    out.write_all(line.as_bytes()).await?;
    out.flush().await?;
    Ok(())
}

impl EventSink for JsonLinesSink {
    fn emit(&self, event: &EngineEvent) -> Result<()> {
        self.tx
            .send(event.clone())
            .map_err(|_| anyhow::anyhow!("event writer stopped"))
    }
}

/// Keeps every event in memory. Handy for hosts that poll, and for tests.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<EngineEvent>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn terminal_events(&self) -> Vec<EngineEvent> {
        self.events()
            .into_iter()
            .filter(EngineEvent::is_terminal)
            .collect()
    }

    pub fn progress_percents(&self) -> Vec<u8> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                EngineEvent::Progress { progress, .. } => Some(progress.percent),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: &EngineEvent) -> Result<()> {
        let mut events = self
            .events
            .lock()
            .map_err(|_| anyhow::anyhow!("recording sink poisoned"))?;
        events.push(event.clone());
        Ok(())
    }
}
