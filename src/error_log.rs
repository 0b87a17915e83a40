//! Append-only `error.log` with one line per terminal failure.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;

use crate::error::EngineError;

#[derive(Debug, Clone)]
pub struct ErrorLog {
    path: PathBuf,
}

impl ErrorLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `[2024-05-01 13:37:00] Operation: DownloadVideo URL: https://.. Format: 22, Error: ..`
    pub fn format_entry(
        operation: &str,
        target: &str,
        selector: Option<&str>,
        error: &EngineError,
    ) -> String {
        let mut details = String::new();
        if !target.is_empty() {
            details.push_str(&format!(" URL: {}", target));
        }
        if let Some(selector) = selector.filter(|s| !s.is_empty()) {
            details.push_str(&format!(" Format: {}", selector));
        }
        format!(
            "[{}] Operation: {}{}, Error: {}",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            operation,
            details,
            error
        )
    }

    pub fn append(
        &self,
        operation: &str,
        target: &str,
        selector: Option<&str>,
        error: &EngineError,
    ) -> Result<()> {
        let line = Self::format_entry(operation, target, selector, error);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        writeln!(file, "{}", line)
            .with_context(|| format!("Failed to write to {}", self.path.display()))?;
        Ok(())
    }

    /// Like [`append`](Self::append) but only logs its own failure.
    pub fn record(&self, operation: &str, target: &str, selector: Option<&str>, error: &EngineError) {
        if let Err(e) = self.append(operation, target, selector, error) {
            log::error!("{:#}", e);
        }
    }
}
