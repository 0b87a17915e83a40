//! Settings
//!
//! User preferences persisted as a JSON file, plus the immutable
//! [`ConfigSnapshot`] handed to each operation when it starts.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

/// How yt-dlp should reach the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    #[default]
    None,
    /// Left to the tool's own system-proxy detection.
    System,
    Manual,
}

/// Where authentication cookies come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CookiesMode {
    #[default]
    None,
    Browser,
    File,
}

/// User settings with all configurable options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSettings {
    #[serde(default)]
    pub proxy_mode: ProxyMode,

    /// Used only when `proxy_mode` is manual.
    #[serde(default)]
    pub proxy_address: String,

    #[serde(default)]
    pub cookies_mode: CookiesMode,

    /// Browser profile name passed to `--cookies-from-browser`.
    #[serde(default = "default_cookies_browser")]
    pub cookies_browser: String,

    /// Netscape cookie file passed to `--cookies`.
    #[serde(default)]
    pub cookies_file: String,

    /// Pass a JavaScript runtime to yt-dlp for every site, not only YouTube.
    #[serde(default)]
    pub use_js_runtime: bool,

    /// Empty means the platform download dir.
    #[serde(default)]
    pub download_dir: PathBuf,

    #[serde(default = "default_language")]
    pub language: String,

    #[serde(default = "default_true")]
    pub auto_redirect_to_queue: bool,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            proxy_mode: ProxyMode::None,
            proxy_address: String::new(),
            cookies_mode: CookiesMode::None,
            cookies_browser: default_cookies_browser(),
            cookies_file: String::new(),
            use_js_runtime: false,
            download_dir: PathBuf::new(),
            language: default_language(),
            auto_redirect_to_queue: true,
        }
    }
}

fn default_cookies_browser() -> String {
    "chrome".to_string()
}

fn default_language() -> String {
    "en".to_string()
}

fn default_true() -> bool {
    true
}

/// Fallback download location when the user has not picked one.
pub fn default_download_dir() -> PathBuf {
    dirs::download_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join("Downloads")))
        .unwrap_or_else(|| PathBuf::from("downloads"))
}

/// Proxy part of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyConfig {
    None,
    System,
    Manual(String),
}

/// Auth part of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthConfig {
    None,
    Browser(String),
    File(PathBuf),
}

impl AuthConfig {
    pub fn is_none(&self) -> bool {
        matches!(self, AuthConfig::None)
    }
}

/// Everything the command builder reads from configuration, frozen when an
/// operation starts so that settings edits never affect a running operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigSnapshot {
    pub proxy: ProxyConfig,
    pub auth: AuthConfig,
    /// JavaScript runtime binary, if one is installed.
    pub js_runtime: Option<PathBuf>,
    pub force_js_runtime: bool,
}

impl Default for ConfigSnapshot {
    fn default() -> Self {
        Self {
            proxy: ProxyConfig::None,
            auth: AuthConfig::None,
            js_runtime: None,
            force_js_runtime: false,
        }
    }
}

impl UserSettings {
    pub fn snapshot(&self, js_runtime: Option<&Path>) -> ConfigSnapshot {
        let proxy = match self.proxy_mode {
            ProxyMode::None => ProxyConfig::None,
            ProxyMode::System => ProxyConfig::System,
            ProxyMode::Manual => ProxyConfig::Manual(self.proxy_address.trim().to_string()),
        };
        let auth = match self.cookies_mode {
            CookiesMode::None => AuthConfig::None,
            CookiesMode::Browser if self.cookies_browser.trim().is_empty() => AuthConfig::None,
            CookiesMode::Browser => AuthConfig::Browser(self.cookies_browser.trim().to_string()),
            CookiesMode::File if self.cookies_file.trim().is_empty() => AuthConfig::None,
            CookiesMode::File => AuthConfig::File(PathBuf::from(self.cookies_file.trim())),
        };
        ConfigSnapshot {
            proxy,
            auth,
            js_runtime: js_runtime.map(Path::to_path_buf),
            force_js_runtime: self.use_js_runtime,
        }
    }

    /// The configured download dir, or the platform default.
    pub fn effective_download_dir(&self) -> PathBuf {
        if self.download_dir.as_os_str().is_empty() {
            default_download_dir()
        } else {
            self.download_dir.clone()
        }
    }

    pub fn with_proxy(mut self, mode: ProxyMode, address: impl Into<String>) -> Self {
        self.proxy_mode = mode;
        self.proxy_address = address.into();
        self
    }

    pub fn with_cookies_browser(mut self, browser: impl Into<String>) -> Self {
        self.cookies_mode = CookiesMode::Browser;
        self.cookies_browser = browser.into();
        self
    }

    pub fn with_cookies_file(mut self, path: impl Into<String>) -> Self {
        self.cookies_mode = CookiesMode::File;
        self.cookies_file = path.into();
        self
    }

    pub fn with_download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.download_dir = dir.into();
        self
    }
}

/// Result of checking a cookie file before saving it in settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CookiesFileStatus {
    Ok,
    /// Usable, but not a `.txt`/`.cookies` file.
    UnexpectedExtension,
    Missing,
    NotAFile,
}

pub fn validate_cookies_file(path: &Path) -> CookiesFileStatus {
    let meta = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return CookiesFileStatus::Missing,
    };
    if !meta.is_file() {
        return CookiesFileStatus::NotAFile;
    }
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("txt") | Some("cookies") => CookiesFileStatus::Ok,
        _ => {
            log::warn!("Cookie file has an unexpected extension: {}", path.display());
            CookiesFileStatus::UnexpectedExtension
        }
    }
}

/// Per-user config location, e.g. `~/.config/mediaflow/settings.json`.
pub fn default_settings_path() -> Option<PathBuf> {
    ProjectDirs::from("com", "mediaflow", "Mediaflow")
        .map(|dirs| dirs.config_dir().join("settings.json"))
}

/// Loads and saves [`UserSettings`] as pretty JSON.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at [`default_settings_path`], or `./settings.json` when the
    /// platform has no config dir.
    pub fn open_default() -> Self {
        Self::new(default_settings_path().unwrap_or_else(|| PathBuf::from("settings.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing or malformed files yield defaults.
    pub fn load(&self) -> UserSettings {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return UserSettings::default(),
            Err(e) => {
                log::warn!("Failed to read settings {}: {}", self.path.display(), e);
                return UserSettings::default();
            }
        };
        match serde_json::from_str(&text) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!(
                    "Settings file {} is malformed, using defaults: {}",
                    self.path.display(),
                    e
                );
                UserSettings::default()
            }
        }
    }

    pub fn save(&self, settings: &UserSettings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create settings dir {}", parent.display())
                })?;
            }
        }
        let json =
            serde_json::to_string_pretty(settings).context("Failed to serialize settings")?;
        std::fs::write(&self.path, json)
            .with_context(|| format!("Failed to write settings {}", self.path.display()))?;
        Ok(())
    }
}
