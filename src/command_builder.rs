//! Argument lists for yt-dlp and ffmpeg invocations.
//!
//! Everything here is a function of the request and its config snapshot.
//! The only filesystem access is the existence check on a cookie file.

use std::path::{Path, PathBuf};

use crate::error::EngineError;
use crate::models::OperationCategory;
use crate::settings::{AuthConfig, ConfigSnapshot, ProxyConfig};
use crate::tool_manager::Tool;
use crate::utils::is_youtube_url;

/// Client personas yt-dlp may impersonate on YouTube.
pub const EXTRACTOR_HINT: &str = "youtube:player-client=web,mobile,android,ios";

/// Targets ffmpeg converts without a video stream.
pub const AUDIO_ONLY_FORMATS: &[&str] = &["mp3", "m4a", "opus", "wav", "flac", "aac", "ogg"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskKind {
    /// Single-item info as JSON.
    Metadata,
    /// Flat playlist listing, one JSON object per line.
    PlaylistEntries,
    Download,
    PlaylistDownload {
        start: Option<u32>,
        end: Option<u32>,
    },
    /// ffmpeg transcode. The request target is the source path and the
    /// selector is the target extension.
    Convert,
}

impl TaskKind {
    pub fn tool(&self) -> Tool {
        match self {
            TaskKind::Convert => Tool::Ffmpeg,
            _ => Tool::YtDlp,
        }
    }

    /// Slot this task occupies. Metadata queries don't occupy one.
    pub fn category(&self) -> Option<OperationCategory> {
        match self {
            TaskKind::Metadata | TaskKind::PlaylistEntries => None,
            TaskKind::Download | TaskKind::PlaylistDownload { .. } => {
                Some(OperationCategory::Download)
            }
            TaskKind::Convert => Some(OperationCategory::Conversion),
        }
    }

    /// Operation name used in the error log.
    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::Metadata => "AnalyzeURL",
            TaskKind::PlaylistEntries => "GetPlaylistItems",
            TaskKind::Download => "DownloadVideo",
            TaskKind::PlaylistDownload { .. } => "DownloadPlaylist",
            TaskKind::Convert => "ConvertFile",
        }
    }
}

/// Which JSON flag a metadata query uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonFlag {
    PrintJson,
    /// Older spelling, kept for yt-dlp builds that reject `--print-json`.
    DumpSingleJson,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationRequest {
    pub task: TaskKind,
    /// URL for yt-dlp tasks, source file for conversions.
    pub target: String,
    /// Format id for yt-dlp, target extension for conversions.
    pub selector: Option<String>,
    /// Output template (yt-dlp) or output file (ffmpeg).
    pub output: Option<String>,
    pub config: ConfigSnapshot,
    /// `--no-warnings` on metadata queries.
    pub quiet: bool,
    pub json_flag: JsonFlag,
}

impl OperationRequest {
    fn new(task: TaskKind, target: impl Into<String>, config: ConfigSnapshot) -> Self {
        Self {
            task,
            target: target.into(),
            selector: None,
            output: None,
            config,
            quiet: true,
            json_flag: JsonFlag::PrintJson,
        }
    }

    pub fn metadata(target: impl Into<String>, config: ConfigSnapshot) -> Self {
        Self::new(TaskKind::Metadata, target, config)
    }

    pub fn playlist_entries(target: impl Into<String>, config: ConfigSnapshot) -> Self {
        Self::new(TaskKind::PlaylistEntries, target, config)
    }

    pub fn download(
        target: impl Into<String>,
        format_id: impl Into<String>,
        output: impl Into<String>,
        config: ConfigSnapshot,
    ) -> Self {
        let mut req = Self::new(TaskKind::Download, target, config);
        req.selector = non_empty(format_id.into());
        req.output = non_empty(output.into());
        req
    }

    pub fn playlist_download(
        target: impl Into<String>,
        format_id: impl Into<String>,
        output: impl Into<String>,
        start: Option<u32>,
        end: Option<u32>,
        config: ConfigSnapshot,
    ) -> Self {
        let mut req = Self::new(TaskKind::PlaylistDownload { start, end }, target, config);
        req.selector = non_empty(format_id.into());
        req.output = non_empty(output.into());
        req
    }

    pub fn conversion(source: &Path, target_format: &str) -> Self {
        let format = target_format.trim().trim_start_matches('.').to_ascii_lowercase();
        let output = conversion_output_path(source, &format);
        let mut req = Self::new(
            TaskKind::Convert,
            source.to_string_lossy(),
            ConfigSnapshot::default(),
        );
        req.selector = non_empty(format);
        req.output = Some(output.to_string_lossy().into_owned());
        req
    }

    pub fn has_auth(&self) -> bool {
        !self.config.auth.is_none()
    }
}

fn non_empty(s: String) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// `<dir>/<stem>.<format>` next to the source.
pub fn conversion_output_path(source: &Path, target_format: &str) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let dir = source.parent().unwrap_or_else(|| Path::new(""));
    dir.join(format!("{}.{}", stem, target_format))
}

/// Assemble the argument list for `request`.
pub fn build_args(request: &OperationRequest) -> Result<Vec<String>, EngineError> {
    if request.target.trim().is_empty() {
        return Err(EngineError::invalid("target must not be empty"));
    }

    match &request.task {
        TaskKind::Convert => build_conversion_args(request),
        TaskKind::Metadata => {
            let flag = match request.json_flag {
                JsonFlag::PrintJson => "--print-json",
                JsonFlag::DumpSingleJson => "--dump-single-json",
            };
            let mut args = vec![
                flag.to_string(),
                "--simulate".to_string(),
                request.target.clone(),
            ];
            if request.quiet {
                args.push("--no-warnings".to_string());
            }
            push_common(&mut args, request);
            Ok(args)
        }
        TaskKind::PlaylistEntries => {
            let mut args = vec![
                "--dump-json".to_string(),
                "--flat-playlist".to_string(),
                "--simulate".to_string(),
                request.target.clone(),
            ];
            if request.quiet {
                args.push("--no-warnings".to_string());
            }
            push_common(&mut args, request);
            Ok(args)
        }
        TaskKind::Download => {
            let mut args = download_head(request);
            push_common(&mut args, request);
            Ok(args)
        }
        TaskKind::PlaylistDownload { start, end } => {
            let mut args = download_head(request);
            args.push("--ignore-errors".to_string());
            if let Some(range) = playlist_range(*start, *end)? {
                args.push("--playlist-items".to_string());
                args.push(range);
            }
            push_common(&mut args, request);
            Ok(args)
        }
    }
}

fn download_head(request: &OperationRequest) -> Vec<String> {
    let mut args = vec![request.target.clone()];
    if let Some(ref format) = request.selector {
        args.push("-f".to_string());
        args.push(format.clone());
    }
    if let Some(ref output) = request.output {
        args.push("-o".to_string());
        args.push(output.clone());
    }
    args.push("--newline".to_string());
    args.push("--progress".to_string());
    args
}

/// 1-based `--playlist-items` value.
fn playlist_range(start: Option<u32>, end: Option<u32>) -> Result<Option<String>, EngineError> {
    let start = start.filter(|s| *s > 0);
    let end = end.filter(|e| *e > 0);
    match (start, end) {
        (Some(s), Some(e)) if s > e => Err(EngineError::invalid(format!(
            "playlist start {} is after end {}",
            s, e
        ))),
        (Some(s), Some(e)) => Ok(Some(format!("{}-{}", s, e))),
        (Some(s), None) => Ok(Some(format!("{}-", s))),
        (None, Some(e)) => Ok(Some(format!("1-{}", e))),
        (None, None) => Ok(None),
    }
}

/// Proxy, auth, extractor hint and JavaScript runtime, in that order.
fn push_common(args: &mut Vec<String>, request: &OperationRequest) {
    let config = &request.config;

    if let ProxyConfig::Manual(ref address) = config.proxy {
        if !address.is_empty() {
            args.push("--proxy".to_string());
            args.push(address.clone());
        }
    }

    match config.auth {
        AuthConfig::None => {}
        AuthConfig::Browser(ref browser) => {
            args.push(format!("--cookies-from-browser={}", browser));
        }
        AuthConfig::File(ref path) => {
            if path.exists() {
                args.push("--cookies".to_string());
                args.push(path.to_string_lossy().into_owned());
            } else {
                log::warn!(
                    "Cookie file {} not found, continuing without cookies",
                    path.display()
                );
            }
        }
    }

    args.push("--extractor-args".to_string());
    args.push(EXTRACTOR_HINT.to_string());

    if config.force_js_runtime || is_youtube_url(&request.target) {
        match config.js_runtime {
            Some(ref runtime) if runtime.exists() => {
                args.push("--js-runtimes".to_string());
                args.push(format!("deno:{}", runtime.to_string_lossy()));
            }
            _ => log::info!("No JavaScript runtime available for {}", request.target),
        }
    }
}

fn build_conversion_args(request: &OperationRequest) -> Result<Vec<String>, EngineError> {
    let format = request
        .selector
        .as_deref()
        .ok_or_else(|| EngineError::invalid("target format must not be empty"))?;
    let output = request
        .output
        .clone()
        .ok_or_else(|| EngineError::invalid("conversion output path is missing"))?;

    let mut args: Vec<String> = vec!["-i".to_string(), request.target.clone()];

    if AUDIO_ONLY_FORMATS.contains(&format) {
        args.extend(["-vn", "-map_metadata", "0", "-y"].map(String::from));
        let codec: &[&str] = match format {
            "mp3" => &["-c:a", "libmp3lame", "-b:a", "320k", "-q:a", "2"],
            "m4a" => &["-c:a", "aac", "-b:a", "256k", "-movflags", "+faststart"],
            "opus" => &["-c:a", "libopus", "-b:a", "256k"],
            "wav" => &["-c:a", "pcm_s16le", "-ar", "44100"],
            "flac" => &["-c:a", "flac", "-compression_level", "12"],
            "aac" => &["-c:a", "aac", "-b:a", "256k"],
            "ogg" => &["-c:a", "libvorbis", "-b:a", "320k"],
            _ => &[],
        };
        args.extend(codec.iter().map(|s| s.to_string()));
    } else {
        args.extend(
            [
                "-c:v",
                "libx264",
                "-preset",
                "medium",
                "-crf",
                "23",
                "-c:a",
                "aac",
                "-b:a",
                "128k",
                "-movflags",
                "+faststart",
                "-map_metadata",
                "0",
                "-y",
            ]
            .map(String::from),
        );
    }

    args.push(output);
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn has_pair(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|w| w[0] == flag && w[1] == value)
    }

    #[test]
    fn test_download_args() {
        let req = OperationRequest::download(
            "https://example.com/v/1",
            "137+140",
            "/tmp/out/%(title)s.%(ext)s",
            ConfigSnapshot::default(),
        );
        let args = build_args(&req).unwrap();
        assert_eq!(
            &args[..7],
            &[
                "https://example.com/v/1",
                "-f",
                "137+140",
                "-o",
                "/tmp/out/%(title)s.%(ext)s",
                "--newline",
                "--progress"
            ]
        );
        assert!(has_pair(&args, "--extractor-args", EXTRACTOR_HINT));
        assert!(!args.iter().any(|a| a == "--proxy"));
    }

    #[test]
    fn test_empty_target_is_invalid() {
        let req = OperationRequest::metadata("   ", ConfigSnapshot::default());
        assert!(matches!(
            build_args(&req),
            Err(EngineError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_proxy_only_when_manual_with_address() {
        let mut config = ConfigSnapshot {
            proxy: ProxyConfig::Manual("http://127.0.0.1:8080".to_string()),
            ..ConfigSnapshot::default()
        };
        let args =
            build_args(&OperationRequest::metadata("https://e.com/v", config.clone())).unwrap();
        assert!(has_pair(&args, "--proxy", "http://127.0.0.1:8080"));

        config.proxy = ProxyConfig::Manual(String::new());
        let args =
            build_args(&OperationRequest::metadata("https://e.com/v", config.clone())).unwrap();
        assert!(!args.iter().any(|a| a == "--proxy"));

        config.proxy = ProxyConfig::System;
        let args = build_args(&OperationRequest::metadata("https://e.com/v", config)).unwrap();
        assert!(!args.iter().any(|a| a == "--proxy"));
    }

    #[test]
    fn test_browser_cookies_flag() {
        let config = ConfigSnapshot {
            auth: AuthConfig::Browser("firefox".to_string()),
            ..ConfigSnapshot::default()
        };
        let args = build_args(&OperationRequest::metadata("https://e.com/v", config)).unwrap();
        assert!(args.iter().any(|a| a == "--cookies-from-browser=firefox"));
    }

    #[test]
    fn test_cookie_file_flag_depends_on_existence() {
        let dir = tempfile::tempdir().unwrap();
        let cookies = dir.path().join("cookies.txt");

        let config = ConfigSnapshot {
            auth: AuthConfig::File(cookies.clone()),
            ..ConfigSnapshot::default()
        };
        let req = OperationRequest::download("https://e.com/v", "best", "", config);

        let args = build_args(&req).unwrap();
        assert!(!args.iter().any(|a| a == "--cookies"));

        std::fs::write(&cookies, "# Netscape HTTP Cookie File\n").unwrap();
        let args = build_args(&req).unwrap();
        assert!(has_pair(&args, "--cookies", &cookies.to_string_lossy()));
    }

    #[test]
    fn test_metadata_variants() {
        let mut req = OperationRequest::metadata("https://e.com/v", ConfigSnapshot::default());
        let args = build_args(&req).unwrap();
        assert_eq!(&args[..4], &["--print-json", "--simulate", "https://e.com/v", "--no-warnings"]);

        req.quiet = false;
        req.json_flag = JsonFlag::DumpSingleJson;
        let args = build_args(&req).unwrap();
        assert_eq!(args[0], "--dump-single-json");
        assert!(!args.iter().any(|a| a == "--no-warnings"));
    }

    #[test]
    fn test_playlist_download_range() {
        let req = OperationRequest::playlist_download(
            "https://e.com/list",
            "best",
            "/tmp/%(title)s.%(ext)s",
            Some(2),
            Some(5),
            ConfigSnapshot::default(),
        );
        let args = build_args(&req).unwrap();
        assert!(args.iter().any(|a| a == "--ignore-errors"));
        assert!(has_pair(&args, "--playlist-items", "2-5"));

        let req = OperationRequest::playlist_download(
            "https://e.com/list",
            "best",
            "",
            Some(3),
            None,
            ConfigSnapshot::default(),
        );
        assert!(has_pair(&build_args(&req).unwrap(), "--playlist-items", "3-"));

        let req = OperationRequest::playlist_download(
            "https://e.com/list",
            "best",
            "",
            Some(6),
            Some(2),
            ConfigSnapshot::default(),
        );
        assert!(matches!(build_args(&req), Err(EngineError::InvalidRequest(_))));
    }

    #[test]
    fn test_js_runtime_for_youtube_only_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let deno = dir.path().join("deno");
        std::fs::write(&deno, "").unwrap();

        let config = ConfigSnapshot {
            js_runtime: Some(deno.clone()),
            ..ConfigSnapshot::default()
        };
        let yt = OperationRequest::metadata("https://www.youtube.com/watch?v=x", config.clone());
        let args = build_args(&yt).unwrap();
        assert!(has_pair(
            &args,
            "--js-runtimes",
            &format!("deno:{}", deno.to_string_lossy())
        ));

        let other = OperationRequest::metadata("https://vimeo.com/1", config.clone());
        assert!(!build_args(&other).unwrap().iter().any(|a| a == "--js-runtimes"));

        let forced = OperationRequest::metadata(
            "https://vimeo.com/1",
            ConfigSnapshot {
                force_js_runtime: true,
                ..config
            },
        );
        assert!(build_args(&forced).unwrap().iter().any(|a| a == "--js-runtimes"));
    }

    #[test]
    fn test_conversion_args_audio() {
        let req = OperationRequest::conversion(Path::new("/media/clip.webm"), "MP3");
        assert_eq!(req.output.as_deref(), Some("/media/clip.mp3"));
        let args = build_args(&req).unwrap();
        assert_eq!(
            args,
            [
                "-i",
                "/media/clip.webm",
                "-vn",
                "-map_metadata",
                "0",
                "-y",
                "-c:a",
                "libmp3lame",
                "-b:a",
                "320k",
                "-q:a",
                "2",
                "/media/clip.mp3"
            ]
        );
    }

    #[test]
    fn test_conversion_args_video() {
        let req = OperationRequest::conversion(Path::new("/media/clip.webm"), "mp4");
        let args = build_args(&req).unwrap();
        assert!(has_pair(&args, "-c:v", "libx264"));
        assert!(has_pair(&args, "-crf", "23"));
        assert!(!args.iter().any(|a| a == "-vn"));
        assert_eq!(args.last().map(String::as_str), Some("/media/clip.mp4"));
    }
}
