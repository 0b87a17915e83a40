//! Error taxonomy for the orchestration core.
//!
//! Only [`EngineError::user_message`] is meant for end users; the
//! [`FailureContext`] attached to process failures is for logs.

use std::fmt;

use thiserror::Error;

use crate::models::{ErrorCode, OperationCategory};
use crate::retry::FailureSignal;

/// Keep at most this many bytes of stderr in a failure report.
pub const STDERR_TAIL_LIMIT: usize = 4096;

/// Diagnostic details of a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureContext {
    pub category: OperationCategory,
    pub target: String,
    pub variant: &'static str,
    pub exit_code: Option<i32>,
    pub stderr_tail: String,
}

impl FailureContext {
    /// The last non-empty stderr line, which is where yt-dlp and ffmpeg put
    /// their `ERROR:` summary.
    pub fn last_error_line(&self) -> Option<&str> {
        self.stderr_tail
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
    }
}

impl fmt::Display for FailureContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.exit_code {
            Some(code) => write!(f, "{} exited with code {}", self.variant, code)?,
            None => write!(f, "{} was terminated", self.variant)?,
        }
        if let Some(line) = self.last_error_line() {
            write!(f, ": {}", line)?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    /// Caller error, surfaced before any process starts.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("failed to start {tool}: {source}")]
    ProcessStartFailure {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    /// A recognized failure that every applicable fallback variant also hit.
    #[error("{signal} ({context})")]
    RecognizedTransientFailure {
        signal: FailureSignal,
        context: FailureContext,
    },

    #[error("process failed ({context})")]
    UnrecognizedProcessFailure { context: FailureContext },

    #[error("output incomplete: {reason}")]
    IncompleteOutput { reason: String },

    #[error("cancelled by user")]
    CancelledByUser,

    #[error("no active {0} to cancel")]
    NoActiveOperation(OperationCategory),

    #[error("metadata query timed out after {0}s")]
    Timeout(u64),

    #[error("unexpected tool output: {0}")]
    MalformedOutput(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn invalid(message: impl Into<String>) -> Self {
        EngineError::InvalidRequest(message.into())
    }

    /// Final error once the retry plan gave up on `signal`.
    pub fn process_failure(signal: FailureSignal, context: FailureContext) -> Self {
        match signal {
            FailureSignal::Unrecognized => EngineError::UnrecognizedProcessFailure { context },
            signal => EngineError::RecognizedTransientFailure { signal, context },
        }
    }

    pub fn context(&self) -> Option<&FailureContext> {
        match self {
            EngineError::RecognizedTransientFailure { context, .. }
            | EngineError::UnrecognizedProcessFailure { context } => Some(context),
            _ => None,
        }
    }

    pub fn error_code(&self) -> ErrorCode {
        match self {
            EngineError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            EngineError::ProcessStartFailure { .. } => ErrorCode::ToolMissing,
            EngineError::RecognizedTransientFailure { signal, .. } => match signal {
                FailureSignal::AuthRequired => ErrorCode::LoginRequired,
                FailureSignal::FormatUnavailable => ErrorCode::FormatUnavailable,
                FailureSignal::Unrecognized => ErrorCode::Unknown,
            },
            EngineError::UnrecognizedProcessFailure { context } => {
                crate::retry::classify_error(&context.stderr_tail)
            }
            EngineError::IncompleteOutput { .. } => ErrorCode::IncompleteOutput,
            EngineError::CancelledByUser => ErrorCode::Canceled,
            EngineError::Timeout(_) => ErrorCode::Network,
            EngineError::NoActiveOperation(_)
            | EngineError::MalformedOutput(_)
            | EngineError::Io(_) => ErrorCode::Unknown,
        }
    }

    /// Short, actionable text for the sink. Details belong in logs.
    pub fn user_message(&self) -> String {
        match self {
            EngineError::InvalidRequest(msg) => msg.clone(),
            EngineError::ProcessStartFailure { tool, .. } => {
                format!("Could not start {}. Check that it is installed.", tool)
            }
            EngineError::RecognizedTransientFailure { signal, .. } => match signal {
                FailureSignal::AuthRequired => {
                    "This content requires sign-in. Import cookies from your browser and retry."
                        .to_string()
                }
                FailureSignal::FormatUnavailable => {
                    "The requested format is not available for this content.".to_string()
                }
                FailureSignal::Unrecognized => "The operation failed.".to_string(),
            },
            EngineError::UnrecognizedProcessFailure { context } => {
                match context.last_error_line() {
                    Some(line) => truncate_message(line, 200),
                    None => match context.exit_code {
                        Some(code) => format!("The tool exited with code {}.", code),
                        None => "The tool was terminated.".to_string(),
                    },
                }
            }
            EngineError::IncompleteOutput { reason } => {
                format!("The output file is incomplete: {}", reason)
            }
            EngineError::CancelledByUser => "Cancelled.".to_string(),
            EngineError::NoActiveOperation(category) => {
                format!("No active {} to cancel.", category)
            }
            EngineError::Timeout(secs) => {
                format!("The request timed out after {} seconds.", secs)
            }
            EngineError::MalformedOutput(_) => {
                "The tool returned output that could not be read.".to_string()
            }
            EngineError::Io(e) => format!("File system error: {}", e),
        }
    }
}

fn truncate_message(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max_chars).collect();
    out.push('…');
    out
}

/// Keep only the last `limit` bytes of `s`, cut on a char boundary.
pub fn tail_of(s: &str, limit: usize) -> &str {
    if s.len() <= limit {
        return s;
    }
    let mut start = s.len() - limit;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}
