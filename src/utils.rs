//! Small formatting and naming helpers shared by the engine and the CLI.

use url::Url;

const KB: f64 = 1024.0;
const MB: f64 = KB * 1024.0;
const GB: f64 = MB * 1024.0;
const TB: f64 = GB * 1024.0;

/// Binary-unit size with two decimals, e.g. `"1.50 MB"`.
pub fn format_file_size_human(bytes: f64) -> String {
    if bytes >= TB {
        format!("{:.2} TB", bytes / TB)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes / GB)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes / MB)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes / KB)
    } else {
        format!("{:.2} B", bytes)
    }
}

/// `M:SS` below an hour, `H:MM:SS` above.
pub fn format_duration(seconds: f64) -> String {
    let total = if seconds.is_finite() && seconds > 0.0 {
        seconds as u64
    } else {
        0
    };
    let hours = total / 3600;
    let minutes = total % 3600 / 60;
    let secs = total % 60;
    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, secs)
    } else {
        format!("{}:{:02}", minutes, secs)
    }
}

/// Parse ffmpeg's `HH:MM:SS.xx` clock into seconds. Anything else is `0.0`.
pub fn parse_ffmpeg_time(s: &str) -> f64 {
    let parts: Vec<&str> = s.trim().split(':').collect();
    if parts.len() != 3 {
        return 0.0;
    }
    let field = |p: &str| p.trim().parse::<f64>().unwrap_or(0.0);
    field(parts[0]) * 3600.0 + field(parts[1]) * 60.0 + field(parts[2])
}

/// Turn a media title into a file stem yt-dlp and every desktop OS accept.
///
/// Spaces and the characters Windows rejects become `_`; whatever
/// `sanitize-filename` still objects to is replaced the same way.
pub fn sanitize_title(title: &str) -> String {
    let replaced: String = title
        .chars()
        .map(|c| match c {
            ' ' | '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            other => other,
        })
        .collect();

    let options = sanitize_filename::Options {
        windows: true,
        truncate: true,
        replacement: "_",
    };
    let cleaned = sanitize_filename::sanitize_with_options(replaced, options);
    if cleaned.is_empty() {
        "download".to_string()
    } else {
        cleaned
    }
}

/// Parse an http(s) URL, rejecting other schemes.
pub fn parse_http_url(input: &str) -> Option<Url> {
    let url = Url::parse(input.trim()).ok()?;
    match url.scheme() {
        "http" | "https" => Some(url),
        _ => None,
    }
}

/// YouTube needs a JavaScript runtime for signature extraction.
pub fn is_youtube_url(target: &str) -> bool {
    match parse_http_url(target).as_ref().and_then(|u| u.host_str()) {
        Some(host) => {
            let host = host.to_ascii_lowercase();
            let host = host.strip_prefix("www.").unwrap_or(&host);
            host == "youtu.be"
                || host == "youtube.com"
                || host.ends_with(".youtube.com")
                || host == "youtube-nocookie.com"
        }
        // yt-dlp also accepts bare ids and search prefixes; fall back to a substring check.
        None => target.contains("youtube.com") || target.contains("youtu.be"),
    }
}
