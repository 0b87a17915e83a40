//! Download Manager
//!
//! Runs one logical operation per category: spawns attempts through the
//! [`ProcessSupervisor`], streams their output into the parser and the
//! progress tracker, walks the retry plan on failure, and gates `completed`
//! on the completion check.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::command_builder::{build_args, OperationRequest, TaskKind};
use crate::error::{tail_of, EngineError, FailureContext, STDERR_TAIL_LIMIT};
use crate::error_log::ErrorLog;
use crate::events::SharedSink;
use crate::models::OperationCategory;
use crate::parser::{FfmpegProgressParser, OutputParser, ParseEvent, YtDlpProgressParser};
use crate::progress::{OperationTracker, TerminalOutcome};
use crate::retry::{
    classify_exit, detect_signal, FailureSignal, RetryController, RetryDecision,
};
use crate::supervisor::{ExitResult, ProcessHandle, ProcessSupervisor};
use crate::verifier::{CompletionVerifier, Verification};

const READ_BUFFER: usize = 4096;

type SharedParser = Arc<Mutex<Box<dyn OutputParser>>>;

/// What has to be true on disk before `completed` goes out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// Run the completion verifier. Without a base name, the file yt-dlp
    /// reported writing is used.
    Verify { base: Option<String>, dir: PathBuf },
    /// Playlist downloads: the directory itself is the result.
    Directory(PathBuf),
    /// Conversions: this exact file must exist.
    File(PathBuf),
}

impl Completion {
    /// Derive the check from a yt-dlp output template. Only a literal
    /// `<name>.%(ext)s` gives a usable base name.
    pub fn for_output_template(template: &str, default_dir: &Path) -> Self {
        let path = Path::new(template);
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => default_dir.to_path_buf(),
        };
        let base = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_suffix(".%(ext)s"))
            .filter(|b| !b.is_empty() && !b.contains("%("))
            .map(str::to_string);
        Completion::Verify { base, dir }
    }
}

/// `Clip.f137.mp4` -> `Clip`.
fn base_name_of(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    let base = match stem.rsplit_once('.') {
        Some((head, tail))
            if tail.len() > 1
                && tail.starts_with('f')
                && tail[1..].chars().all(|c| c.is_ascii_digit()) =>
        {
            head
        }
        _ => stem,
    };
    Some(base.to_string())
}

fn parser_for(task: &TaskKind) -> Box<dyn OutputParser> {
    match task {
        TaskKind::Convert => Box::new(FfmpegProgressParser::new()),
        _ => Box::new(YtDlpProgressParser::new()),
    }
}

fn feed_parser(parser: &SharedParser, chunk: &[u8]) -> Vec<ParseEvent> {
    parser
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .feed(chunk)
}

fn finish_parser(parser: &SharedParser) -> Vec<ParseEvent> {
    parser
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .finish()
}

/// Handle to a launched operation.
#[derive(Debug)]
pub struct OperationHandle {
    id: Uuid,
    category: OperationCategory,
    join: JoinHandle<TerminalOutcome>,
}

impl OperationHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn category(&self) -> OperationCategory {
        self.category
    }

    /// Wait for the terminal event and return what it was.
    pub async fn wait(self) -> TerminalOutcome {
        match self.join.await {
            Ok(outcome) => outcome,
            Err(e) => {
                log::error!("{} {} task ended abnormally: {}", self.category, self.id, e);
                TerminalOutcome::Failed("operation task ended abnormally".to_string())
            }
        }
    }
}

/// How one attempt ended.
enum AttemptOutcome {
    Succeeded,
    Cancelled,
    Failed {
        signal: FailureSignal,
        exit_code: Option<i32>,
        stderr_tail: String,
    },
    Error(EngineError),
}

/// One reader task's job.
struct StreamJob {
    tracker: Arc<OperationTracker>,
    parser: Option<SharedParser>,
    /// Failure scanning, stderr only.
    scan: Option<FailureScan>,
}

#[derive(Clone)]
struct FailureScan {
    tail: Arc<Mutex<String>>,
    /// Signals the retry plan can still act on; only these preempt.
    recoverable: Vec<FailureSignal>,
    preempted: Arc<Mutex<Option<FailureSignal>>>,
    kill: CancellationToken,
}

impl FailureScan {
    fn observe(&self, chunk: &[u8]) {
        let mut tail = self.tail.lock().unwrap_or_else(PoisonError::into_inner);
        tail.push_str(&String::from_utf8_lossy(chunk));
        if tail.len() > STDERR_TAIL_LIMIT * 2 {
            *tail = tail_of(&tail, STDERR_TAIL_LIMIT).to_string();
        }

        if self.recoverable.is_empty() || self.kill.is_cancelled() {
            return;
        }
        if let Some(signal) = detect_signal(&tail) {
            if self.recoverable.contains(&signal) {
                let mut preempted = self.preempted.lock().unwrap_or_else(PoisonError::into_inner);
                if preempted.is_none() {
                    log::info!("Detected {} in live output, stopping attempt early", signal);
                    *preempted = Some(signal);
                    self.kill.cancel();
                }
            }
        }
    }

    fn tail(&self) -> String {
        let tail = self.tail.lock().unwrap_or_else(PoisonError::into_inner);
        tail_of(&tail, STDERR_TAIL_LIMIT).to_string()
    }

    fn preempted(&self) -> Option<FailureSignal> {
        *self.preempted.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn pump<R>(mut reader: R, job: StreamJob)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; READ_BUFFER];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                log::debug!("Stream read error: {}", e);
                break;
            }
        };
        let chunk = &buf[..n];

        if let Some(ref scan) = job.scan {
            scan.observe(chunk);
        }
        if let Some(ref parser) = job.parser {
            for event in feed_parser(parser, chunk) {
                job.tracker.publish(event).await;
            }
        }
    }

    if let Some(ref parser) = job.parser {
        for event in finish_parser(parser) {
            job.tracker.publish(event).await;
        }
    }
}

/// Runs operations for one category.
#[derive(Clone)]
pub struct DownloadManager {
    supervisor: Arc<ProcessSupervisor>,
    sink: SharedSink,
    verifier: CompletionVerifier,
    error_log: Option<ErrorLog>,
    drain_timeout: Duration,
}

impl DownloadManager {
    pub fn new(
        category: OperationCategory,
        sink: SharedSink,
        verifier: CompletionVerifier,
        error_log: Option<ErrorLog>,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            supervisor: Arc::new(ProcessSupervisor::new(category)),
            sink,
            verifier,
            error_log,
            drain_timeout,
        }
    }

    pub fn category(&self) -> OperationCategory {
        self.supervisor.category()
    }

    pub async fn is_active(&self) -> bool {
        self.supervisor.is_active().await
    }

    /// Cancel the running operation. Emits `cancelled` exactly once.
    pub async fn cancel(&self) -> Result<Uuid, EngineError> {
        self.supervisor.cancel().await
    }

    /// Start the first attempt now and run the rest in the background.
    ///
    /// Bad requests and a busy category are rejected without any event. A
    /// first attempt that can't be spawned emits `failed` and is also
    /// returned as an error.
    pub async fn launch(
        &self,
        program: &Path,
        request: OperationRequest,
        completion: Completion,
    ) -> Result<OperationHandle, EngineError> {
        let args = build_args(&request)?;
        if self.supervisor.is_active().await {
            return Err(EngineError::invalid(format!(
                "a {} is already running",
                self.category()
            )));
        }

        let tracker = Arc::new(OperationTracker::new(self.category(), self.sink.clone()));
        let cancel = CancellationToken::new();
        let controller = RetryController::for_request(request.clone());
        let attempt = controller.attempts() as usize;

        let handle = match self
            .supervisor
            .start(tracker.clone(), &cancel, attempt, program, &args)
            .await
        {
            Ok(handle) => handle,
            Err(e @ EngineError::InvalidRequest(_)) => return Err(e),
            Err(e) => {
                if tracker.fail(&e).await {
                    self.record_failure(&request, &e);
                }
                return Err(e);
            }
        };

        let id = tracker.id();
        let category = self.category();
        let run = Run {
            manager: self.clone(),
            program: program.to_path_buf(),
            original: request,
            tracker,
            cancel,
            controller,
            completion,
        };
        let join = tokio::spawn(run.execute(handle));

        Ok(OperationHandle { id, category, join })
    }

    fn record_failure(&self, request: &OperationRequest, error: &EngineError) {
        if let Some(ref log_file) = self.error_log {
            log_file.record(
                request.task.name(),
                &request.target,
                request.selector.as_deref(),
                error,
            );
        }
    }
}

/// State of one logical operation across its attempts.
struct Run {
    manager: DownloadManager,
    program: PathBuf,
    original: OperationRequest,
    tracker: Arc<OperationTracker>,
    cancel: CancellationToken,
    controller: RetryController,
    completion: Completion,
}

impl Run {
    async fn execute(mut self, first: ProcessHandle) -> TerminalOutcome {
        let parser: SharedParser = Arc::new(Mutex::new(parser_for(&self.original.task)));
        let mut attempt = first.attempt();
        let mut handle = first;

        let result: Result<PathBuf, EngineError> = loop {
            let variant = self.controller.current_variant();
            let outcome = self.run_attempt(&parser, &mut handle).await;
            match outcome {
                AttemptOutcome::Succeeded => {
                    self.controller.on_success();
                    break self.resolve_completion().await;
                }
                AttemptOutcome::Cancelled => break Err(EngineError::CancelledByUser),
                AttemptOutcome::Error(e) => break Err(e),
                AttemptOutcome::Failed {
                    signal,
                    exit_code,
                    stderr_tail,
                } => match self.controller.on_failure(signal) {
                    RetryDecision::Retry { variant: next, .. } => {
                        log::warn!(
                            "{} {} attempt {} ({}) failed with {}, retrying as {}",
                            self.tracker.category(),
                            self.tracker.id(),
                            attempt,
                            variant.name(),
                            signal,
                            next.name()
                        );
                        let args = match build_args(self.controller.request()) {
                            Ok(args) => args,
                            Err(e) => break Err(e),
                        };
                        let next_attempt = self.controller.attempts() as usize;
                        // The slot keeps the previous attempt until the spawn succeeds.
                        match self
                            .manager
                            .supervisor
                            .start(
                                self.tracker.clone(),
                                &self.cancel,
                                next_attempt,
                                &self.program,
                                &args,
                            )
                            .await
                        {
                            Ok(next_handle) => {
                                attempt = next_attempt;
                                handle = next_handle;
                            }
                            Err(e) => break Err(e),
                        }
                    }
                    RetryDecision::Exhausted => {
                        let context = FailureContext {
                            category: self.tracker.category(),
                            target: self.original.target.clone(),
                            variant: variant.name(),
                            exit_code,
                            stderr_tail,
                        };
                        log::error!(
                            "{} {} failed after {} attempt(s): {}",
                            self.tracker.category(),
                            self.tracker.id(),
                            self.controller.attempts(),
                            context
                        );
                        break Err(EngineError::process_failure(signal, context));
                    }
                },
            }
        };

        self.manager
            .supervisor
            .release(self.tracker.id(), attempt)
            .await;
        self.finish(result).await
    }

    /// One process run: readers plus exit wait.
    async fn run_attempt(&self, parser: &SharedParser, handle: &mut ProcessHandle) -> AttemptOutcome {
        parser
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reset_stream();

        let progress_on_stderr = self.original.task == TaskKind::Convert;
        let recoverable: Vec<FailureSignal> =
            [FailureSignal::AuthRequired, FailureSignal::FormatUnavailable]
                .into_iter()
                .filter(|s| self.controller.can_recover(*s))
                .collect();
        let scan = FailureScan {
            tail: Arc::new(Mutex::new(String::new())),
            recoverable,
            preempted: Arc::new(Mutex::new(None)),
            kill: handle.kill_switch(),
        };

        let mut readers: Vec<JoinHandle<()>> = Vec::with_capacity(2);
        if let Some(stdout) = handle.take_stdout() {
            let job = StreamJob {
                tracker: self.tracker.clone(),
                parser: (!progress_on_stderr).then(|| parser.clone()),
                scan: None,
            };
            readers.push(tokio::spawn(pump(stdout, job)));
        }
        if let Some(stderr) = handle.take_stderr() {
            let job = StreamJob {
                tracker: self.tracker.clone(),
                parser: progress_on_stderr.then(|| parser.clone()),
                scan: Some(scan.clone()),
            };
            readers.push(tokio::spawn(pump(stderr, job)));
        }

        let exit = self.manager.supervisor.wait(handle).await;

        match exit {
            Ok(ExitResult::Exited { success: true, code }) => {
                // The process is gone; free the slot before the readers and
                // the completion check catch up.
                self.manager
                    .supervisor
                    .release(handle.operation_id(), handle.attempt())
                    .await;
                self.drain(readers).await;
                log::info!(
                    "{} {} attempt {} exited with {:?}",
                    self.tracker.category(),
                    self.tracker.id(),
                    handle.attempt(),
                    code
                );
                if self.cancel.is_cancelled() {
                    AttemptOutcome::Cancelled
                } else {
                    AttemptOutcome::Succeeded
                }
            }
            Ok(ExitResult::Exited { success: false, code }) => {
                self.drain(readers).await;
                if self.cancel.is_cancelled() {
                    return AttemptOutcome::Cancelled;
                }
                let stderr_tail = scan.tail();
                let signal = scan.preempted().unwrap_or_else(|| classify_exit(&stderr_tail));
                AttemptOutcome::Failed {
                    signal,
                    exit_code: code,
                    stderr_tail,
                }
            }
            Ok(ExitResult::Killed) => {
                self.drain(readers).await;
                if self.cancel.is_cancelled() {
                    return AttemptOutcome::Cancelled;
                }
                let stderr_tail = scan.tail();
                AttemptOutcome::Failed {
                    signal: scan.preempted().unwrap_or(FailureSignal::Unrecognized),
                    exit_code: None,
                    stderr_tail,
                }
            }
            Err(e) => {
                for reader in &readers {
                    reader.abort();
                }
                log::error!("Waiting for {} failed: {}", self.tracker.id(), e);
                AttemptOutcome::Error(EngineError::Io(e))
            }
        }
    }

    /// Let readers flush trailing output, but not forever: a grandchild can
    /// keep the pipes open after the tool itself exited.
    async fn drain(&self, readers: Vec<JoinHandle<()>>) {
        let deadline = tokio::time::Instant::now() + self.manager.drain_timeout;
        for mut reader in readers {
            if tokio::time::timeout_at(deadline, &mut reader).await.is_err() {
                log::warn!("Output reader for {} did not finish, aborting", self.tracker.id());
                reader.abort();
            }
        }
    }

    async fn resolve_completion(&self) -> Result<PathBuf, EngineError> {
        match &self.completion {
            Completion::Directory(dir) => Ok(dir.clone()),
            Completion::File(path) => {
                if path.is_file() {
                    Ok(path.clone())
                } else {
                    Err(EngineError::IncompleteOutput {
                        reason: format!("{} was not created", path.display()),
                    })
                }
            }
            Completion::Verify { base, dir } => {
                let base = match base {
                    Some(base) => base.clone(),
                    None => self
                        .tracker
                        .destination()
                        .await
                        .as_deref()
                        .and_then(base_name_of)
                        .ok_or_else(|| EngineError::IncompleteOutput {
                            reason: "the output file name is unknown".to_string(),
                        })?,
                };
                match self.manager.verifier.verify(&base, dir).await {
                    Verification::Complete { path, size } => {
                        log::info!(
                            "{} {} verified {} ({} bytes)",
                            self.tracker.category(),
                            self.tracker.id(),
                            path.display(),
                            size
                        );
                        Ok(path)
                    }
                    Verification::Incomplete { reason } => {
                        Err(EngineError::IncompleteOutput { reason })
                    }
                    Verification::Missing => Err(EngineError::IncompleteOutput {
                        reason: format!("no output file found for {}", base),
                    }),
                }
            }
        }
    }

    async fn finish(self, result: Result<PathBuf, EngineError>) -> TerminalOutcome {
        if self.cancel.is_cancelled() {
            self.tracker.cancel().await;
        } else {
            match result {
                Ok(path) => {
                    if !self.tracker.complete(&path).await {
                        log::info!("Completion of {} superseded", self.tracker.id());
                    }
                }
                Err(EngineError::CancelledByUser) => {
                    self.tracker.cancel().await;
                }
                Err(e) => {
                    log::error!("{} {} failed: {}", self.tracker.category(), self.tracker.id(), e);
                    if self.tracker.fail(&e).await {
                        self.manager.record_failure(&self.original, &e);
                    }
                }
            }
        }

        self.tracker
            .outcome()
            .await
            .unwrap_or(TerminalOutcome::Cancelled)
    }
}
