//! Process Supervisor
//!
//! Owns the single-flight slot of one operation category. The slot holds the
//! running attempt's cancellation tokens and the tracker that must receive
//! the `cancelled` terminal event.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

#[cfg(windows)]
use std::os::windows::process::CommandExt;

use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[cfg(windows)]
use crate::tool_manager::CREATE_NO_WINDOW;

use crate::error::EngineError;
use crate::models::OperationCategory;
use crate::progress::OperationTracker;

struct ActiveOperation {
    operation_id: Uuid,
    attempt: usize,
    pid: Option<u32>,
    /// Shared by every attempt of the logical operation.
    cancel: CancellationToken,
    tracker: Arc<OperationTracker>,
}

/// A spawned attempt. Dropping it kills the process.
pub struct ProcessHandle {
    operation_id: Uuid,
    attempt: usize,
    child: Child,
    kill: CancellationToken,
}

impl ProcessHandle {
    pub fn operation_id(&self) -> Uuid {
        self.operation_id
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Token that kills this attempt only. Cancelling the operation also
    /// trips it.
    pub fn kill_switch(&self) -> CancellationToken {
        self.kill.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitResult {
    Exited { code: Option<i32>, success: bool },
    /// Terminated through the kill switch.
    Killed,
}

pub struct ProcessSupervisor {
    category: OperationCategory,
    slot: Mutex<Option<ActiveOperation>>,
}

impl ProcessSupervisor {
    pub fn new(category: OperationCategory) -> Self {
        Self {
            category,
            slot: Mutex::new(None),
        }
    }

    pub fn category(&self) -> OperationCategory {
        self.category
    }

    pub async fn is_active(&self) -> bool {
        self.slot.lock().await.is_some()
    }

    pub async fn active_operation(&self) -> Option<Uuid> {
        self.slot.lock().await.as_ref().map(|a| a.operation_id)
    }

    /// Spawn an attempt and install it in the slot, replacing an earlier
    /// attempt of the same operation. The cancellation check and the
    /// install happen under one lock, so a concurrent `cancel` either sees
    /// the new attempt or makes this call fail.
    pub async fn start(
        &self,
        tracker: Arc<OperationTracker>,
        cancel: &CancellationToken,
        attempt: usize,
        program: &Path,
        args: &[String],
    ) -> Result<ProcessHandle, EngineError> {
        let mut slot = self.slot.lock().await;

        if cancel.is_cancelled() {
            return Err(EngineError::CancelledByUser);
        }
        if let Some(active) = slot.as_ref() {
            if active.operation_id != tracker.id() {
                return Err(EngineError::invalid(format!(
                    "a {} is already running",
                    self.category
                )));
            }
            log::info!(
                "Replacing {} attempt {} (pid {:?}) with attempt {}",
                self.category,
                active.attempt,
                active.pid,
                attempt
            );
        }

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Hide console window on Windows
        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);

        let child = cmd.spawn().map_err(|e| {
            log::error!("Failed to start {}: {}", program.display(), e);
            EngineError::ProcessStartFailure {
                tool: program.display().to_string(),
                source: e,
            }
        })?;
        let pid = child.id();

        log::info!(
            "Started {} {} attempt {} (pid {:?}): {} {:?}",
            self.category,
            tracker.id(),
            attempt,
            pid,
            program.display(),
            args
        );

        *slot = Some(ActiveOperation {
            operation_id: tracker.id(),
            attempt,
            pid,
            cancel: cancel.clone(),
            tracker: tracker.clone(),
        });

        Ok(ProcessHandle {
            operation_id: tracker.id(),
            attempt,
            child,
            kill: cancel.child_token(),
        })
    }

    /// Wait for the attempt to exit, or kill it once its kill switch trips.
    /// Holds no lock while waiting.
    pub async fn wait(&self, handle: &mut ProcessHandle) -> std::io::Result<ExitResult> {
        tokio::select! {
            status = handle.child.wait() => {
                let status = status?;
                Ok(ExitResult::Exited {
                    code: status.code(),
                    success: status.success(),
                })
            }
            _ = handle.kill.cancelled() => {
                log::info!(
                    "Killing {} {} attempt {} (pid {:?})",
                    self.category,
                    handle.operation_id,
                    handle.attempt,
                    handle.child.id()
                );
                if let Err(e) = handle.child.kill().await {
                    // Already gone.
                    log::debug!("Kill failed: {}", e);
                }
                Ok(ExitResult::Killed)
            }
        }
    }

    /// Clear the slot if it still belongs to this attempt.
    pub async fn release(&self, operation_id: Uuid, attempt: usize) -> bool {
        let mut slot = self.slot.lock().await;
        match slot.as_ref() {
            Some(a) if a.operation_id == operation_id && a.attempt == attempt => {
                *slot = None;
                log::debug!("Released {} slot for {}", self.category, operation_id);
                true
            }
            _ => false,
        }
    }

    /// Cancel the active operation: trip its token (which kills the running
    /// attempt), clear the slot and emit `cancelled`.
    pub async fn cancel(&self) -> Result<Uuid, EngineError> {
        let active = {
            let mut slot = self.slot.lock().await;
            let active = slot
                .take()
                .ok_or(EngineError::NoActiveOperation(self.category))?;
            active.cancel.cancel();
            active
        };

        log::info!(
            "Cancelled {} {} (attempt {}, pid {:?})",
            self.category,
            active.operation_id,
            active.attempt,
            active.pid
        );
        active.tracker.cancel().await;
        Ok(active.operation_id)
    }
}
