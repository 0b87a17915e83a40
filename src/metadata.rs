//! Metadata queries: single-item info and flat playlist listings.
//!
//! These run yt-dlp in simulate mode, bounded by a timeout, and walk the
//! same fallback chain as downloads. They don't occupy a category slot and
//! can't be cancelled.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

#[cfg(windows)]
use std::os::windows::process::CommandExt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::process::Command;

#[cfg(windows)]
use crate::tool_manager::CREATE_NO_WINDOW;

use crate::command_builder::{build_args, OperationRequest};
use crate::error::{tail_of, EngineError, FailureContext, STDERR_TAIL_LIMIT};
use crate::models::OperationCategory;
use crate::retry::{classify_exit, RetryController, RetryDecision};
use crate::utils::format_file_size_human;

/// One downloadable format as reported by yt-dlp.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Format {
    pub format_id: Option<String>,
    pub format_note: Option<String>,
    pub ext: Option<String>,
    pub resolution: Option<String>,
    pub filesize: Option<Value>,
    pub filesize_approx: Option<Value>,
    /// Filled in from `filesize`, else `filesize_approx`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filesize_human: Option<String>,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoInfo {
    pub id: Option<String>,
    pub title: Option<String>,
    pub duration: Option<f64>,
    pub thumbnail: Option<String>,
    pub formats: Vec<Format>,
    pub webpage_url: Option<String>,
    pub description: Option<String>,
    pub uploader: Option<String>,
    /// Integer or null depending on the extractor.
    pub view_count: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaylistEntry {
    pub id: Option<String>,
    pub title: Option<String>,
    pub thumbnail: Option<String>,
    pub url: Option<String>,
    pub duration: Option<f64>,
    #[serde(skip_serializing)]
    pub webpage_url: Option<String>,
}

/// Byte count from a JSON number or numeric string.
fn size_from_value(value: &Value) -> Option<f64> {
    let bytes = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    bytes.filter(|v| *v > 0.0)
}

impl Format {
    fn fill_human_size(&mut self) {
        let bytes = self
            .filesize
            .as_ref()
            .and_then(size_from_value)
            .or_else(|| self.filesize_approx.as_ref().and_then(size_from_value));
        if let Some(bytes) = bytes {
            self.filesize_human = Some(format_file_size_human(bytes));
        }
    }
}

/// Parse `--print-json` output. Playlist URLs print one object per item;
/// the first one wins.
pub fn parse_video_info(stdout: &str) -> Result<VideoInfo, EngineError> {
    let line = stdout
        .lines()
        .map(str::trim)
        .find(|l| l.starts_with('{'))
        .ok_or_else(|| EngineError::MalformedOutput("no JSON object in output".to_string()))?;

    let mut info: VideoInfo = serde_json::from_str(line)
        .map_err(|e| EngineError::MalformedOutput(format!("invalid video info JSON: {}", e)))?;
    for format in &mut info.formats {
        format.fill_human_size();
    }
    Ok(info)
}

/// Parse `--flat-playlist --dump-json` output, skipping lines that don't
/// parse.
pub fn parse_playlist_entries(stdout: &str) -> Vec<PlaylistEntry> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter_map(|line| match serde_json::from_str::<PlaylistEntry>(line) {
            Ok(mut entry) => {
                if entry.url.is_none() {
                    entry.url = entry.webpage_url.clone().or_else(|| entry.id.clone());
                }
                Some(entry)
            }
            Err(e) => {
                log::debug!("Skipping playlist line: {}", e);
                None
            }
        })
        .collect()
}

struct Captured {
    stdout: String,
    stderr: String,
    code: Option<i32>,
    success: bool,
}

#[derive(Debug, Clone)]
pub struct MetadataClient {
    yt_dlp: PathBuf,
    timeout: Duration,
}

impl MetadataClient {
    pub fn new(yt_dlp: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            yt_dlp: yt_dlp.into(),
            timeout,
        }
    }

    pub fn yt_dlp_path(&self) -> &Path {
        &self.yt_dlp
    }

    pub async fn analyze(&self, request: OperationRequest) -> Result<VideoInfo, EngineError> {
        let stdout = self.run_with_fallbacks(request).await?;
        parse_video_info(&stdout)
    }

    pub async fn playlist_entries(
        &self,
        request: OperationRequest,
    ) -> Result<Vec<PlaylistEntry>, EngineError> {
        let stdout = self.run_with_fallbacks(request).await?;
        let entries = parse_playlist_entries(&stdout);
        log::info!("Playlist listing returned {} entries", entries.len());
        Ok(entries)
    }

    /// Run the request, moving down its retry plan on recognized failures.
    async fn run_with_fallbacks(&self, request: OperationRequest) -> Result<String, EngineError> {
        let task_name = request.task.name();
        let mut controller = RetryController::for_request(request);

        loop {
            let args = build_args(controller.request())?;
            let variant = controller.current_variant();
            log::info!(
                "{} attempt {} ({}) for {}",
                task_name,
                controller.attempts(),
                variant.name(),
                controller.request().target
            );

            let captured = self.exec(&args).await?;
            if captured.success {
                controller.on_success();
                return Ok(captured.stdout);
            }

            let signal = classify_exit(&captured.stderr);
            log::info!(
                "{} attempt failed ({}), stderr: {}",
                task_name,
                signal,
                tail_of(&captured.stderr, 512)
            );

            match controller.on_failure(signal) {
                RetryDecision::Retry { variant, .. } => {
                    log::info!("{} retrying as {}", task_name, variant.name());
                }
                RetryDecision::Exhausted => {
                    let context = FailureContext {
                        category: OperationCategory::Download,
                        target: controller.request().target.clone(),
                        variant: variant.name(),
                        exit_code: captured.code,
                        stderr_tail: tail_of(&captured.stderr, STDERR_TAIL_LIMIT).to_string(),
                    };
                    return Err(EngineError::process_failure(signal, context));
                }
            }
        }
    }

    async fn exec(&self, args: &[String]) -> Result<Captured, EngineError> {
        let mut cmd = Command::new(&self.yt_dlp);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Hide console window on Windows
        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(EngineError::ProcessStartFailure {
                    tool: self.yt_dlp.display().to_string(),
                    source: e,
                })
            }
            Err(_) => {
                log::warn!("Metadata query timed out after {:?}", self.timeout);
                return Err(EngineError::Timeout(self.timeout.as_secs()));
            }
        };

        Ok(Captured {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            code: output.status.code(),
            success: output.status.success(),
        })
    }
}
