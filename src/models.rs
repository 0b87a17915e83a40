use std::fmt;

use serde::{Deserialize, Serialize};

/// Independent single-flight slots. A download and a conversion may run at
/// the same time, but never two of the same category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationCategory {
    Download,
    Conversion,
}

impl OperationCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationCategory::Download => "download",
            OperationCategory::Conversion => "conversion",
        }
    }
}

impl fmt::Display for OperationCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse stage of an operation, derived from tool output markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Downloading,
    Extracting,
    Converting,
    Complete,
}

/// Placeholder shown for size/rate/ETA before the tool reports anything.
pub const PLACEHOLDER: &str = "--";

/// What the sink sees for one progress update. Display strings are passed
/// through from the tool's own formatting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// 0..=100
    pub percent: u8,
    pub size: String,
    pub speed: String,
    pub eta: String,
    pub phase: Phase,
}

impl ProgressSnapshot {
    pub fn empty(phase: Phase) -> Self {
        Self {
            percent: 0,
            size: PLACEHOLDER.to_string(),
            speed: PLACEHOLDER.to_string(),
            eta: PLACEHOLDER.to_string(),
            phase,
        }
    }

    /// Last snapshot published after completion has been verified.
    pub fn finished() -> Self {
        Self {
            percent: 100,
            size: "Complete".to_string(),
            speed: "0".to_string(),
            eta: "00:00".to_string(),
            phase: Phase::Complete,
        }
    }
}

/// Stable error codes surfaced alongside failure events so a front-end can
/// map them to remediation. Keep these stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Unknown,
    InvalidRequest,
    Network,
    GeoRestricted,
    LoginRequired,
    BotCheck,
    ExtractorOutdated,
    FormatUnavailable,
    ToolMissing,
    IncompleteOutput,
    Canceled,
}

/// Actions a front-end can offer as buttons next to a failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RemediationAction {
    ImportCookies { label: String },
    UpdateYtDlp { label: String },
    OpenSettingsProxy { label: String },
    RetryWithOtherFormat { label: String },
    Retry { label: String },
    OpenLogs { label: String },
}

impl RemediationAction {
    pub fn import_cookies() -> Self {
        Self::ImportCookies {
            label: "Import cookies from browser".to_string(),
        }
    }
    pub fn update_ytdlp() -> Self {
        Self::UpdateYtDlp {
            label: "Update yt-dlp and retry".to_string(),
        }
    }
    pub fn open_proxy_settings() -> Self {
        Self::OpenSettingsProxy {
            label: "Configure proxy…".to_string(),
        }
    }
    pub fn retry_other_format() -> Self {
        Self::RetryWithOtherFormat {
            label: "Pick another format".to_string(),
        }
    }
    pub fn retry() -> Self {
        Self::Retry {
            label: "Retry".to_string(),
        }
    }
    pub fn open_logs() -> Self {
        Self::OpenLogs {
            label: "View logs".to_string(),
        }
    }
}

impl ErrorCode {
    /// Suggested remediation for a code. Empty for codes the user can't act on.
    pub fn actions(&self) -> Vec<RemediationAction> {
        match self {
            ErrorCode::LoginRequired | ErrorCode::BotCheck => {
                vec![RemediationAction::import_cookies()]
            }
            ErrorCode::GeoRestricted => vec![RemediationAction::open_proxy_settings()],
            ErrorCode::ExtractorOutdated => vec![
                RemediationAction::update_ytdlp(),
                RemediationAction::retry(),
            ],
            ErrorCode::FormatUnavailable => vec![RemediationAction::retry_other_format()],
            ErrorCode::Network | ErrorCode::IncompleteOutput => {
                vec![RemediationAction::retry()]
            }
            ErrorCode::Unknown | ErrorCode::ToolMissing => vec![
                RemediationAction::retry(),
                RemediationAction::open_logs(),
            ],
            ErrorCode::InvalidRequest | ErrorCode::Canceled => Vec::new(),
        }
    }
}
