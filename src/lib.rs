//! Process orchestration and live progress core for yt-dlp and ffmpeg
//! front-ends.
//!
//! [`Engine`] is the entry point. It owns one single-flight slot per
//! [`OperationCategory`], hands each operation an immutable settings
//! snapshot, and reports everything through an [`EventSink`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

pub mod command_builder;
pub mod download_manager;
pub mod error;
pub mod error_log;
pub mod events;
pub mod metadata;
pub mod models;
pub mod parser;
pub mod progress;
pub mod retry;
pub mod settings;
pub mod supervisor;
pub mod tool_manager;
pub mod utils;
pub mod verifier;

pub use command_builder::OperationRequest;
pub use download_manager::{Completion, DownloadManager, OperationHandle};
pub use error::EngineError;
pub use events::{EngineEvent, EventSink, SharedSink};
pub use metadata::{PlaylistEntry, VideoInfo};
pub use models::{OperationCategory, Phase, ProgressSnapshot};
pub use progress::TerminalOutcome;
pub use settings::{SettingsStore, UserSettings};
pub use tool_manager::{EngineConfig, Tool, ToolStatus};

use error_log::ErrorLog;
use metadata::MetadataClient;
use settings::ConfigSnapshot;
use verifier::{CompletionVerifier, Verification};

/// Default output template when the caller doesn't pass one.
const DEFAULT_TEMPLATE: &str = "%(title)s.%(ext)s";

const VERSION_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Engine {
    config: EngineConfig,
    settings: RwLock<UserSettings>,
    metadata: MetadataClient,
    downloads: DownloadManager,
    conversions: DownloadManager,
    /// `download_path_for` results, per title.
    download_paths: Mutex<HashMap<String, PathBuf>>,
}

impl Engine {
    pub fn new(config: EngineConfig, settings: UserSettings, sink: SharedSink) -> Self {
        let verifier = CompletionVerifier::new(config.settle_delay, config.repoll_delay);
        let error_log = config.error_log.clone().map(ErrorLog::new);
        let manager = |category| {
            DownloadManager::new(
                category,
                sink.clone(),
                verifier.clone(),
                error_log.clone(),
                config.drain_timeout,
            )
        };
        let downloads = manager(OperationCategory::Download);
        let conversions = manager(OperationCategory::Conversion);

        Self {
            metadata: MetadataClient::new(config.yt_dlp.clone(), config.metadata_timeout),
            downloads,
            conversions,
            settings: RwLock::new(settings),
            download_paths: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn settings(&self) -> UserSettings {
        self.settings.read().await.clone()
    }

    /// Applies to operations started from now on.
    pub async fn update_settings(&self, settings: UserSettings) {
        *self.settings.write().await = settings;
        self.download_paths.lock().await.clear();
    }

    pub async fn download_dir(&self) -> PathBuf {
        self.settings.read().await.effective_download_dir()
    }

    pub async fn set_download_dir(&self, dir: impl Into<PathBuf>) -> Result<(), EngineError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        self.settings.write().await.download_dir = dir;
        self.download_paths.lock().await.clear();
        Ok(())
    }

    async fn snapshot(&self) -> ConfigSnapshot {
        self.settings.read().await.snapshot(self.config.js_runtime())
    }

    async fn ensure_download_dir(&self) -> Result<PathBuf, EngineError> {
        let dir = self.download_dir().await;
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    fn manager(&self, category: OperationCategory) -> &DownloadManager {
        match category {
            OperationCategory::Download => &self.downloads,
            OperationCategory::Conversion => &self.conversions,
        }
    }

    fn record_failure(&self, request: &OperationRequest, error: &EngineError) {
        if let Some(ref path) = self.config.error_log {
            ErrorLog::new(path).record(
                request.task.name(),
                &request.target,
                request.selector.as_deref(),
                error,
            );
        }
    }

    /// Info and formats for a single URL.
    pub async fn analyze(&self, url: &str) -> Result<VideoInfo, EngineError> {
        let request = OperationRequest::metadata(url.trim(), self.snapshot().await);
        let result = self.metadata.analyze(request.clone()).await;
        if let Err(ref e) = result {
            log::error!("Analyze failed for {}: {}", url, e);
            self.record_failure(&request, e);
        }
        result
    }

    /// Flat entry list of a playlist URL.
    pub async fn playlist_items(&self, url: &str) -> Result<Vec<PlaylistEntry>, EngineError> {
        let request = OperationRequest::playlist_entries(url.trim(), self.snapshot().await);
        let result = self.metadata.playlist_entries(request.clone()).await;
        if let Err(ref e) = result {
            log::error!("Playlist listing failed for {}: {}", url, e);
            self.record_failure(&request, e);
        }
        result
    }

    /// Download one item. `output` is a yt-dlp output template, by default
    /// `%(title)s.%(ext)s` in the download dir.
    pub async fn download(
        &self,
        url: &str,
        format_id: &str,
        output: Option<&str>,
    ) -> Result<OperationHandle, EngineError> {
        let dir = self.ensure_download_dir().await?;
        let output = match output.map(str::trim).filter(|o| !o.is_empty()) {
            Some(o) => o.to_string(),
            None => dir.join(DEFAULT_TEMPLATE).to_string_lossy().into_owned(),
        };
        let completion = Completion::for_output_template(&output, &dir);
        if let Completion::Verify { dir: ref target_dir, .. } = completion {
            std::fs::create_dir_all(target_dir)?;
        }

        let request = OperationRequest::download(url.trim(), format_id, output, self.snapshot().await);
        self.downloads
            .launch(&self.config.yt_dlp, request, completion)
            .await
    }

    /// Download a playlist, optionally limited to items `start..=end`
    /// (1-based). Completion is reported with the output directory.
    pub async fn download_playlist(
        &self,
        url: &str,
        format_id: &str,
        output: Option<&str>,
        start: Option<u32>,
        end: Option<u32>,
    ) -> Result<OperationHandle, EngineError> {
        let dir = self.ensure_download_dir().await?;
        let output = match output.map(str::trim).filter(|o| !o.is_empty()) {
            Some(o) => o.to_string(),
            None => dir.join(DEFAULT_TEMPLATE).to_string_lossy().into_owned(),
        };
        let result_dir = Path::new(&output)
            .parent()
            .filter(|p| !p.as_os_str().is_empty() && !p.to_string_lossy().contains("%("))
            .map(Path::to_path_buf)
            .unwrap_or(dir);

        let request = OperationRequest::playlist_download(
            url.trim(),
            format_id,
            output,
            start,
            end,
            self.snapshot().await,
        );
        self.downloads
            .launch(&self.config.yt_dlp, request, Completion::Directory(result_dir))
            .await
    }

    /// Convert `source` to `target_format` next to it.
    pub async fn convert(
        &self,
        source: &Path,
        target_format: &str,
    ) -> Result<OperationHandle, EngineError> {
        if !source.is_file() {
            return Err(EngineError::invalid(format!(
                "source file does not exist: {}",
                source.display()
            )));
        }
        let request = OperationRequest::conversion(source, target_format);
        let output = request
            .output
            .clone()
            .map(PathBuf::from)
            .ok_or_else(|| EngineError::invalid("no output path for conversion"))?;
        if output == source {
            return Err(EngineError::invalid("source already has the target format"));
        }
        self.conversions
            .launch(&self.config.ffmpeg, request, Completion::File(output))
            .await
    }

    /// Cancel the running operation of `category`.
    pub async fn cancel(&self, category: OperationCategory) -> Result<Uuid, EngineError> {
        self.manager(category).cancel().await
    }

    pub async fn is_active(&self, category: OperationCategory) -> bool {
        self.manager(category).is_active().await
    }

    /// Output template for a title: `<download dir>/<sanitized title>.%(ext)s`.
    pub async fn download_path_for(&self, title: &str) -> Result<PathBuf, EngineError> {
        if let Some(path) = self.download_paths.lock().await.get(title) {
            return Ok(path.clone());
        }

        let dir = self.ensure_download_dir().await?;
        let path = dir.join(format!("{}.%(ext)s", utils::sanitize_title(title)));
        self.download_paths
            .lock()
            .await
            .insert(title.to_string(), path.clone());
        Ok(path)
    }

    /// Where the download for `title` ended up. Falls back to
    /// `<dir>/<title>.mp4` when nothing is on disk yet.
    pub async fn actual_download_path(&self, title: &str) -> Result<PathBuf, EngineError> {
        let dir = self.download_dir().await;
        let base = utils::sanitize_title(title);
        match verifier::check_async(&base, &dir).await {
            Verification::Complete { path, .. } => Ok(path),
            Verification::Incomplete { reason } => Err(EngineError::IncompleteOutput { reason }),
            Verification::Missing => Ok(dir.join(format!("{}.mp4", base))),
        }
    }

    /// Paths and versions of the external tools.
    pub async fn tool_status(&self) -> Vec<ToolStatus> {
        tool_manager::probe_tools(&self.config, VERSION_TIMEOUT).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingSink;

    fn engine(dir: &Path) -> Engine {
        let config = EngineConfig {
            yt_dlp: PathBuf::from("/definitely/not/here/yt-dlp"),
            ffmpeg: PathBuf::from("/definitely/not/here/ffmpeg"),
            error_log: None,
            ..EngineConfig::default()
        };
        let settings = UserSettings::default().with_download_dir(dir.join("downloads"));
        Engine::new(config, settings, RecordingSink::new())
    }

    #[tokio::test]
    async fn test_download_path_for_sanitizes_and_creates_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine(tmp.path());

        let path = engine.download_path_for("My: Clip?").await.unwrap();
        assert_eq!(path, tmp.path().join("downloads").join("My__Clip_.%(ext)s"));
        assert!(tmp.path().join("downloads").is_dir());
        assert_eq!(engine.download_path_for("My: Clip?").await.unwrap(), path);
    }

    #[tokio::test]
    async fn test_actual_download_path() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine(tmp.path());
        let dir = engine.download_dir().await;
        std::fs::create_dir_all(&dir).unwrap();

        assert_eq!(
            engine.actual_download_path("Clip").await.unwrap(),
            dir.join("Clip.mp4")
        );

        std::fs::write(dir.join("Clip.webm"), vec![0u8; 2048]).unwrap();
        assert_eq!(
            engine.actual_download_path("Clip").await.unwrap(),
            dir.join("Clip.webm")
        );

        std::fs::write(dir.join("Clip.webm.part"), b"x").unwrap();
        assert!(matches!(
            engine.actual_download_path("Clip").await,
            Err(EngineError::IncompleteOutput { .. })
        ));
    }

    #[tokio::test]
    async fn test_convert_rejects_missing_source() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine(tmp.path());
        let err = engine
            .convert(&tmp.path().join("nope.mkv"), "mp3")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidRequest(_)));
        assert!(!engine.is_active(OperationCategory::Conversion).await);
    }

    #[tokio::test]
    async fn test_download_with_missing_tool_fails_fast() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = RecordingSink::new();
        let config = EngineConfig {
            yt_dlp: PathBuf::from("/definitely/not/here/yt-dlp"),
            error_log: None,
            ..EngineConfig::default()
        };
        let engine = Engine::new(
            config,
            UserSettings::default().with_download_dir(tmp.path()),
            sink.clone(),
        );

        let err = engine
            .download("https://example.com/v", "best", None)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::ProcessStartFailure { .. }));
        assert_eq!(sink.terminal_events().len(), 1);
        assert!(!engine.is_active(OperationCategory::Download).await);
    }

    #[tokio::test]
    async fn test_cancel_idle_category() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine(tmp.path());
        assert!(matches!(
            engine.cancel(OperationCategory::Download).await,
            Err(EngineError::NoActiveOperation(OperationCategory::Download))
        ));
    }
}
