//! Completion verifier.
//!
//! yt-dlp can exit 0 while still leaving `.part` files or fragments behind,
//! or before a merge/rename is visible on disk. A download is only
//! complete once the final file exists and no in-progress artifacts remain.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Files smaller than this are suspicious.
pub const MIN_FINAL_SIZE: u64 = 1024;

/// Extensions yt-dlp can leave as the finished file, video first.
pub const FINAL_EXTENSIONS: &[&str] = &[
    ".mp4", ".webm", ".mkv", ".avi", ".mov", ".flv", ".m4v", ".mp3", ".m4a", ".opus", ".ogg",
    ".wav", ".flac", ".aac",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Complete { path: PathBuf, size: u64 },
    Incomplete { reason: String },
    /// Neither a final file nor any artifact.
    Missing,
}

/// In-progress artifacts for one base name.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Artifacts {
    /// `<base>.<ext>.part`
    pub partial: Vec<PathBuf>,
    /// `<base>.<ext>.part-Frag12.part` and similar
    pub fragments: Vec<PathBuf>,
    /// `<base>.ytdl` resume state
    pub sidecars: Vec<PathBuf>,
}

impl Artifacts {
    pub fn is_empty(&self) -> bool {
        self.partial.is_empty() && self.fragments.is_empty() && self.sidecars.is_empty()
    }

    fn describe(&self) -> String {
        let mut parts = Vec::new();
        if !self.partial.is_empty() {
            parts.push(format!("{} partial file(s)", self.partial.len()));
        }
        if !self.fragments.is_empty() {
            parts.push(format!("{} fragment file(s)", self.fragments.len()));
        }
        if !self.sidecars.is_empty() {
            parts.push("a .ytdl state file".to_string());
        }
        parts.join(", ")
    }
}

/// Scan `dir` for files belonging to `base`.
pub fn scan(base: &str, dir: &Path) -> (Artifacts, Option<(PathBuf, u64)>) {
    let mut artifacts = Artifacts::default();
    let mut best: Option<(PathBuf, u64)> = None;

    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) => {
            log::warn!("Cannot read {}: {}", dir.display(), e);
            return (artifacts, None);
        }
    };

    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        let rest = match name.strip_prefix(base) {
            Some(rest) if rest.starts_with('.') => rest,
            _ => continue,
        };
        let path = entry.path();

        if rest.ends_with(".ytdl") {
            artifacts.sidecars.push(path);
        } else if rest.contains(".part-") {
            artifacts.fragments.push(path);
        } else if rest.ends_with(".part") {
            artifacts.partial.push(path);
        } else if FINAL_EXTENSIONS.contains(&rest) {
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            // Prefer the largest; stale smaller files survive earlier attempts.
            if best.as_ref().map_or(true, |(_, s)| size > *s) {
                best = Some((path, size));
            }
        }
    }

    (artifacts, best)
}

/// Single pass over the directory, no waiting.
pub fn check(base: &str, dir: &Path) -> Verification {
    let (artifacts, found) = scan(base, dir);

    if !artifacts.is_empty() {
        log::warn!("In-progress files for {}: {:?}", base, artifacts);
        let reason = match found {
            Some((_, size)) if size < MIN_FINAL_SIZE => format!(
                "file too small ({} bytes) and temporary files present",
                size
            ),
            Some(_) => format!("temporary files still present ({})", artifacts.describe()),
            None => format!(
                "temporary files present but no completed file found ({})",
                artifacts.describe()
            ),
        };
        return Verification::Incomplete { reason };
    }

    match found {
        Some((path, size)) => {
            if size < MIN_FINAL_SIZE {
                log::warn!(
                    "Found file but it's very small: {} ({} bytes)",
                    path.display(),
                    size
                );
            } else {
                log::info!("Found completed file: {} ({} bytes)", path.display(), size);
            }
            Verification::Complete { path, size }
        }
        None => Verification::Missing,
    }
}

/// [`check`] on tokio's blocking pool, off the async workers.
pub async fn check_async(base: &str, dir: &Path) -> Verification {
    let (base, dir) = (base.to_string(), dir.to_path_buf());
    match tokio::task::spawn_blocking(move || check(&base, &dir)).await {
        Ok(verification) => verification,
        Err(e) => {
            log::error!("Directory scan task failed: {}", e);
            Verification::Incomplete {
                reason: "could not scan the output directory".to_string(),
            }
        }
    }
}

/// Waits for the tool to settle before checking, and re-checks once when
/// nothing turned up.
#[derive(Debug, Clone)]
pub struct CompletionVerifier {
    settle_delay: Duration,
    repoll_delay: Duration,
}

impl CompletionVerifier {
    pub fn new(settle_delay: Duration, repoll_delay: Duration) -> Self {
        Self {
            settle_delay,
            repoll_delay,
        }
    }

    pub async fn verify(&self, base: &str, dir: &Path) -> Verification {
        tokio::time::sleep(self.settle_delay).await;

        match check_async(base, dir).await {
            Verification::Missing => {
                log::info!(
                    "No output for {} yet, re-checking in {:?}",
                    base,
                    self.repoll_delay
                );
                tokio::time::sleep(self.repoll_delay).await;
                match check_async(base, dir).await {
                    Verification::Missing => Verification::Incomplete {
                        reason: format!("no output file found for {}", base),
                    },
                    other => other,
                }
            }
            other => other,
        }
    }
}
