//! Tool Manager
//!
//! Locates the external tools (yt-dlp, ffmpeg, deno) and probes their
//! versions. Installing or updating them is left to the host.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

#[cfg(windows)]
use std::os::windows::process::CommandExt;

/// Windows flag to prevent console window from appearing when spawning processes.
#[cfg(windows)]
pub(crate) const CREATE_NO_WINDOW: u32 = 0x08000000;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::process::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tool {
    YtDlp,
    Ffmpeg,
    Deno,
}

impl Tool {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tool::YtDlp => "yt-dlp",
            Tool::Ffmpeg => "ffmpeg",
            Tool::Deno => "deno",
        }
    }

    /// Names to look for, most specific first. yt-dlp's standalone release
    /// binaries carry a platform suffix.
    pub fn binary_names(&self) -> &'static [&'static str] {
        #[cfg(target_os = "windows")]
        {
            match self {
                Tool::YtDlp => &["yt-dlp.exe"],
                Tool::Ffmpeg => &["ffmpeg.exe"],
                Tool::Deno => &["deno.exe"],
            }
        }
        #[cfg(target_os = "macos")]
        {
            match self {
                Tool::YtDlp => &["yt-dlp_macos", "yt-dlp"],
                Tool::Ffmpeg => &["ffmpeg"],
                Tool::Deno => &["deno"],
            }
        }
        #[cfg(not(any(target_os = "windows", target_os = "macos")))]
        {
            match self {
                Tool::YtDlp => &["yt-dlp_linux", "yt-dlp"],
                Tool::Ffmpeg => &["ffmpeg"],
                Tool::Deno => &["deno"],
            }
        }
    }

    pub fn version_args(&self) -> &[&str] {
        match self {
            Tool::YtDlp | Tool::Deno => &["--version"],
            Tool::Ffmpeg => &["-version"],
        }
    }
}

/// Resolved tool locations plus the timings the engine runs with.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub yt_dlp: PathBuf,
    pub ffmpeg: PathBuf,
    /// Only used when present on disk.
    pub deno: Option<PathBuf>,
    /// Where `error.log` is written. `None` disables it.
    pub error_log: Option<PathBuf>,
    /// Pause before the first completion check.
    pub settle_delay: Duration,
    /// Pause before the single re-check when nothing was found.
    pub repoll_delay: Duration,
    /// Upper bound for metadata queries.
    pub metadata_timeout: Duration,
    /// How long to keep draining output after a failed attempt exits.
    pub drain_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            yt_dlp: PathBuf::from(Tool::YtDlp.as_str()),
            ffmpeg: PathBuf::from(Tool::Ffmpeg.as_str()),
            deno: None,
            error_log: Some(PathBuf::from("error.log")),
            settle_delay: Duration::from_secs(2),
            repoll_delay: Duration::from_secs(3),
            metadata_timeout: Duration::from_secs(120),
            drain_timeout: Duration::from_secs(2),
        }
    }
}

impl EngineConfig {
    /// Look in `bin_dir` (default `./bin`), then next to the executable,
    /// then `PATH`. Missing tools fall back to their bare name.
    pub fn discover(bin_dir: Option<&Path>) -> Self {
        let mut dirs: Vec<PathBuf> = Vec::new();
        dirs.push(bin_dir.map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("bin")));
        if let Ok(exe) = std::env::current_exe() {
            if let Some(exe_dir) = exe.parent() {
                dirs.push(exe_dir.to_path_buf());
            }
        }

        let yt_dlp = find_tool(Tool::YtDlp, &dirs).unwrap_or_else(|| {
            log::warn!("Could not find yt-dlp, falling back to PATH lookup");
            PathBuf::from(Tool::YtDlp.as_str())
        });
        let ffmpeg = find_tool(Tool::Ffmpeg, &dirs).unwrap_or_else(|| {
            log::warn!("Could not find ffmpeg, falling back to PATH lookup");
            PathBuf::from(Tool::Ffmpeg.as_str())
        });
        let deno = find_tool(Tool::Deno, &dirs);
        if deno.is_none() {
            log::info!("No deno runtime found; YouTube extraction may be limited");
        }

        Self {
            yt_dlp,
            ffmpeg,
            deno,
            ..Self::default()
        }
    }

    pub fn tool_path(&self, tool: Tool) -> Option<&Path> {
        match tool {
            Tool::YtDlp => Some(&self.yt_dlp),
            Tool::Ffmpeg => Some(&self.ffmpeg),
            Tool::Deno => self.deno.as_deref(),
        }
    }

    /// JavaScript runtime, only if it actually exists.
    pub fn js_runtime(&self) -> Option<&Path> {
        self.deno.as_deref().filter(|p| p.exists())
    }
}

/// First existing binary for `tool` in `dirs`, then on `PATH`.
pub fn find_tool(tool: Tool, dirs: &[PathBuf]) -> Option<PathBuf> {
    for dir in dirs {
        for name in tool.binary_names() {
            let candidate = dir.join(name);
            if candidate.is_file() {
                log::info!("Found {} at: {:?}", tool.as_str(), candidate);
                return Some(candidate);
            }
        }
    }

    for name in tool.binary_names() {
        if let Ok(path) = which::which(name) {
            log::info!("Found {} via PATH: {:?}", tool.as_str(), path);
            return Some(path);
        }
    }

    None
}

/// Get the version string from a tool.
pub async fn get_version(path: &Path, tool: Tool, timeout: Duration) -> Result<String> {
    let mut cmd = Command::new(path);
    cmd.args(tool.version_args())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    // Hide console window on Windows
    #[cfg(windows)]
    cmd.creation_flags(CREATE_NO_WINDOW);

    let output = tokio::time::timeout(timeout, cmd.output())
        .await
        .context("Version check timed out")?
        .context("Failed to execute tool")?;

    if !output.status.success() {
        return Err(anyhow!(
            "Tool returned non-zero exit code: {}",
            output.status
        ));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_version(&stdout, tool).ok_or_else(|| anyhow!("Could not parse version from output"))
}

/// Discovery and version result for one tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolStatus {
    pub tool: Tool,
    pub path: Option<PathBuf>,
    pub version: Option<String>,
    pub error: Option<String>,
}

/// Probe every configured tool. Missing optional tools are reported, not
/// treated as errors.
pub async fn probe_tools(config: &EngineConfig, timeout: Duration) -> Vec<ToolStatus> {
    let mut statuses = Vec::new();
    for tool in [Tool::YtDlp, Tool::Ffmpeg, Tool::Deno] {
        let path = config.tool_path(tool).map(Path::to_path_buf);
        let status = match path {
            Some(ref p) => match get_version(p, tool, timeout).await {
                Ok(version) => ToolStatus {
                    tool,
                    path,
                    version: Some(version),
                    error: None,
                },
                Err(e) => {
                    log::warn!("Version check for {} failed: {:#}", tool.as_str(), e);
                    ToolStatus {
                        tool,
                        path,
                        version: None,
                        error: Some(format!("{:#}", e)),
                    }
                }
            },
            None => ToolStatus {
                tool,
                path: None,
                version: None,
                error: Some("not installed".to_string()),
            },
        };
        statuses.push(status);
    }
    statuses
}

/// Parse version string from tool output.
fn parse_version(output: &str, tool: Tool) -> Option<String> {
    let first_line = output.lines().next()?.trim();
    if first_line.is_empty() {
        return None;
    }

    match tool {
        // "2024.01.01"
        Tool::YtDlp => Some(first_line.to_string()),
        // "ffmpeg version 6.1.1 Copyright ..." / "deno 1.40.0 (release, ...)"
        Tool::Ffmpeg | Tool::Deno => {
            let parts: Vec<&str> = first_line.split_whitespace().collect();
            match parts.as_slice() {
                ["ffmpeg", "version", v, ..] => Some(v.to_string()),
                ["deno", v, ..] => Some(v.to_string()),
                _ => Some(first_line.to_string()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version_ytdlp() {
        let output = "2024.01.01\n";
        assert_eq!(
            parse_version(output, Tool::YtDlp),
            Some("2024.01.01".to_string())
        );
    }

    #[test]
    fn test_parse_version_ffmpeg() {
        let output = "ffmpeg version 6.1.1 Copyright (c) 2000-2023 the FFmpeg developers\n";
        assert_eq!(
            parse_version(output, Tool::Ffmpeg),
            Some("6.1.1".to_string())
        );
    }

    #[test]
    fn test_parse_version_deno() {
        let output = "deno 1.40.2 (release, x86_64-unknown-linux-gnu)\nv8 12.1\n";
        assert_eq!(parse_version(output, Tool::Deno), Some("1.40.2".to_string()));
        assert_eq!(parse_version("\n", Tool::Deno), None);
    }

    #[test]
    fn test_find_tool_prefers_bin_dir() {
        let dir = tempfile::tempdir().unwrap();
        let name = Tool::Ffmpeg.binary_names()[0];
        std::fs::write(dir.path().join(name), "").unwrap();

        let found = find_tool(Tool::Ffmpeg, &[dir.path().to_path_buf()]);
        assert_eq!(found, Some(dir.path().join(name)));
    }

    #[test]
    fn test_js_runtime_requires_existing_file() {
        let config = EngineConfig {
            deno: Some(PathBuf::from("/definitely/not/here/deno")),
            ..EngineConfig::default()
        };
        assert!(config.js_runtime().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_get_version_from_script() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("yt-dlp");
        std::fs::write(&script, "#!/bin/sh\necho 2025.06.30\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let version = get_version(&script, Tool::YtDlp, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(version, "2025.06.30");
    }

    #[tokio::test]
    async fn test_probe_reports_missing_tools() {
        let config = EngineConfig {
            yt_dlp: PathBuf::from("/definitely/not/here/yt-dlp"),
            ffmpeg: PathBuf::from("/definitely/not/here/ffmpeg"),
            deno: None,
            ..EngineConfig::default()
        };
        let statuses = probe_tools(&config, Duration::from_secs(5)).await;
        assert_eq!(statuses.len(), 3);
        assert!(statuses.iter().all(|s| s.version.is_none() && s.error.is_some()));
        assert_eq!(statuses[2].path, None);
        assert_eq!(statuses[2].error.as_deref(), Some("not installed"));
    }
}
