//! Progress reconciliation and the once-only terminal event guard.

use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::EngineError;
use crate::events::{EngineEvent, SharedSink};
use crate::models::{OperationCategory, Phase, ProgressSnapshot};
use crate::parser::{ParseEvent, RawProgress, RuleKind};

/// A raw value below this after a published maximum above
/// [`RESTART_FROM_ABOVE`] means the tool started the next item.
const RESTART_BELOW: f64 = 1.0;
const RESTART_FROM_ABOVE: f64 = 90.0;

/// Keeps published percentages monotonic and de-duplicated.
#[derive(Debug)]
pub struct ProgressReconciler {
    high_water: f64,
    published: Option<u8>,
    phase: Phase,
}

impl ProgressReconciler {
    pub fn new(phase: Phase) -> Self {
        Self {
            high_water: 0.0,
            published: None,
            phase,
        }
    }

    pub fn published(&self) -> Option<u8> {
        self.published
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Returns true if the phase actually changed.
    pub fn set_phase(&mut self, phase: Phase) -> bool {
        if self.phase == phase {
            return false;
        }
        self.phase = phase;
        true
    }

    /// Fold a raw reading in. Returns the snapshot to publish, if any.
    pub fn reconcile(&mut self, raw: &RawProgress) -> Option<ProgressSnapshot> {
        let mut current = if raw.percent.is_finite() {
            raw.percent.clamp(0.0, 100.0)
        } else {
            return None;
        };
        if raw.rule == RuleKind::CompletionHeuristic {
            current = 100.0;
        }

        if current < RESTART_BELOW && self.high_water > RESTART_FROM_ABOVE {
            log::debug!(
                "Progress restarted ({:.1}% -> {:.1}%), treating as next item",
                self.high_water,
                current
            );
            self.high_water = 0.0;
            self.published = None;
            if matches!(self.phase, Phase::Extracting | Phase::Converting) {
                self.phase = Phase::Downloading;
            }
        }

        if current > self.high_water {
            self.high_water = current;
        }

        let percent = self.high_water.floor() as u8;
        if self.published == Some(percent) {
            return None;
        }
        self.published = Some(percent);

        Some(ProgressSnapshot {
            percent,
            size: raw.size.clone(),
            speed: raw.speed.clone(),
            eta: raw.eta.clone(),
            phase: self.phase,
        })
    }

    /// The closing 100% snapshot, unless 100 was already published.
    pub fn finish(&mut self) -> Option<ProgressSnapshot> {
        self.phase = Phase::Complete;
        if self.published == Some(100) {
            return None;
        }
        self.high_water = 100.0;
        self.published = Some(100);
        Some(ProgressSnapshot::finished())
    }
}

/// How the operation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalOutcome {
    Completed(PathBuf),
    Failed(String),
    Cancelled,
}

#[derive(Debug)]
struct TrackerState {
    reconciler: ProgressReconciler,
    destination: Option<PathBuf>,
    terminal: Option<TerminalOutcome>,
}

/// Per logical operation book-keeping shared by the stream readers, the
/// runner and `cancel`. Whoever claims the terminal slot first wins; every
/// later completion, failure or cancellation is dropped.
pub struct OperationTracker {
    id: Uuid,
    category: OperationCategory,
    sink: SharedSink,
    state: Mutex<TrackerState>,
}

impl OperationTracker {
    pub fn new(category: OperationCategory, sink: SharedSink) -> Self {
        let phase = match category {
            OperationCategory::Download => Phase::Downloading,
            OperationCategory::Conversion => Phase::Converting,
        };
        Self {
            id: Uuid::new_v4(),
            category,
            sink,
            state: Mutex::new(TrackerState {
                reconciler: ProgressReconciler::new(phase),
                destination: None,
                terminal: None,
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn category(&self) -> OperationCategory {
        self.category
    }

    /// Called with `state` held so the terminal event is always last. Sinks
    /// only queue.
    fn emit(&self, event: EngineEvent) {
        if let Err(e) = self.sink.emit(&event) {
            log::warn!("Failed to deliver {} for {}: {}", event.name(), self.id, e);
        }
    }

    /// Publish parser output. No-op once a terminal event went out.
    pub async fn publish(&self, event: ParseEvent) {
        let mut state = self.state.lock().await;
        if state.terminal.is_some() {
            return;
        }
        match event {
            ParseEvent::Progress(raw) => {
                if let Some(snapshot) = state.reconciler.reconcile(&raw) {
                    self.emit(EngineEvent::Progress {
                        operation_id: self.id,
                        category: self.category,
                        progress: snapshot,
                    });
                }
            }
            ParseEvent::Phase(phase) => {
                if state.reconciler.set_phase(phase) {
                    log::info!("{} {} entered phase {:?}", self.category, self.id, phase);
                    self.emit(EngineEvent::PhaseChanged {
                        operation_id: self.id,
                        category: self.category,
                        phase,
                    });
                }
            }
            ParseEvent::Destination(path) => {
                log::info!("{} {} writing {}", self.category, self.id, path.display());
                state.destination = Some(path);
            }
        }
    }

    /// Last file the tool reported writing.
    pub async fn destination(&self) -> Option<PathBuf> {
        self.state.lock().await.destination.clone()
    }

    pub async fn outcome(&self) -> Option<TerminalOutcome> {
        self.state.lock().await.terminal.clone()
    }

    pub async fn is_finished(&self) -> bool {
        self.state.lock().await.terminal.is_some()
    }

    /// Emit the closing snapshot and `Completed`. Returns false if another
    /// terminal event already won.
    pub async fn complete(&self, path: &Path) -> bool {
        let mut state = self.state.lock().await;
        if state.terminal.is_some() {
            return false;
        }
        state.terminal = Some(TerminalOutcome::Completed(path.to_path_buf()));
        if let Some(snapshot) = state.reconciler.finish() {
            self.emit(EngineEvent::Progress {
                operation_id: self.id,
                category: self.category,
                progress: snapshot,
            });
        }
        self.emit(EngineEvent::Completed {
            operation_id: self.id,
            category: self.category,
            path: path.to_string_lossy().into_owned(),
        });
        true
    }

    pub async fn fail(&self, error: &EngineError) -> bool {
        let mut state = self.state.lock().await;
        if state.terminal.is_some() {
            return false;
        }
        state.terminal = Some(TerminalOutcome::Failed(error.user_message()));
        self.emit(EngineEvent::failed(self.id, self.category, error));
        true
    }

    pub async fn cancel(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.terminal.is_some() {
            return false;
        }
        state.terminal = Some(TerminalOutcome::Cancelled);
        self.emit(EngineEvent::Cancelled {
            operation_id: self.id,
            category: self.category,
        });
        true
    }
}
