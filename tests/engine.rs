//! End-to-end runs against fake yt-dlp/ffmpeg shell scripts.
#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mediaflow::events::RecordingSink;
use mediaflow::models::ErrorCode;
use mediaflow::{
    Engine, EngineConfig, EngineError, EngineEvent, OperationCategory, TerminalOutcome,
    UserSettings,
};
use tempfile::TempDir;

const DOWNLOAD_OK: &str = r#"echo "$*" >> '@CALLS@'
out=""
while [ $# -gt 0 ]; do
  if [ "$1" = "-o" ]; then out="$2"; fi
  shift
done
dest=$(printf '%s' "$out" | sed -e 's/%(title)s/Clip/' -e 's/%(ext)s/mp4/')
echo "[download] Destination: $dest"
echo "[download]  10.0% of 10.00MiB at  1.00MiB/s ETA 00:09"
echo "[download]  55.5% of 10.00MiB at  2.00MiB/s ETA 00:04"
head -c 4096 /dev/zero > "$dest"
echo "[download] 100% of 10.00MiB at  2.00MiB/s ETA 00:00"
exit 0
"#;

const SIGN_IN_REQUIRED: &str = r#"echo "$*" >> '@CALLS@'
echo "ERROR: [youtube] abc: Sign in to confirm you're not a bot. Use --cookies-from-browser" >&2
exit 1
"#;

/// Hangs after the auth error while cookies are passed.
const SIGN_IN_THEN_HANG: &str = r#"echo "$*" >> '@CALLS@'
echo "ERROR: [youtube] abc: Sign in to confirm you're not a bot" >&2
case "$*" in
  *--cookies-from-browser*) exec sleep 30 ;;
esac
exit 1
"#;

/// Removes itself before failing, so the retry cannot be spawned.
const SIGN_IN_THEN_VANISH: &str = r#"echo "$*" >> '@CALLS@'
rm -f "$0"
echo "ERROR: [youtube] abc: Sign in to confirm you're not a bot" >&2
exit 1
"#;

/// Gets to 40% with cookies before the auth error; the cookie-less retry
/// starts over from 5%.
const PROGRESS_THEN_SIGN_IN: &str = r#"echo "$*" >> '@CALLS@'
case "$*" in
  *--cookies-from-browser*)
    echo "[download]  40.0% of 10.00MiB at  1.00MiB/s ETA 00:06"
    sleep 1
    echo "ERROR: [youtube] abc: Sign in to confirm you're not a bot" >&2
    exit 1 ;;
esac
out=""
while [ $# -gt 0 ]; do
  if [ "$1" = "-o" ]; then out="$2"; fi
  shift
done
dest=$(printf '%s' "$out" | sed -e 's/%(title)s/Clip/' -e 's/%(ext)s/mp4/')
echo "[download]   5.0% of 10.00MiB at  1.00MiB/s ETA 00:09"
echo "[download]  60.0% of 10.00MiB at  2.00MiB/s ETA 00:02"
head -c 4096 /dev/zero > "$dest"
echo "[download] 100% of 10.00MiB at  2.00MiB/s ETA 00:00"
exit 0
"#;

const ODD_FAILURE: &str = r#"echo "$*" >> '@CALLS@'
echo "[download]  12.0% of 10.00MiB at  1.00MiB/s ETA 00:09"
echo "ERROR: something odd happened" >&2
exit 2
"#;

const LEAVES_FRAGMENTS: &str = r#"echo "$*" >> '@CALLS@'
out=""
while [ $# -gt 0 ]; do
  if [ "$1" = "-o" ]; then out="$2"; fi
  shift
done
dest=$(printf '%s' "$out" | sed -e 's/%(ext)s/mp4/')
head -c 4096 /dev/zero > "$dest"
echo x > "$dest.part-Frag7"
echo "[download] 100% of 10.00MiB at  2.00MiB/s ETA 00:00"
exit 0
"#;

const SLOW: &str = r#"echo "$*" >> '@CALLS@'
echo "[download]   3.0% of 10.00MiB at  1.00MiB/s ETA 00:30"
exec sleep 30
"#;

const ANALYZE: &str = r#"echo "$*" >> '@CALLS@'
echo "WARNING: noise before the payload"
echo '{"id":"abc","title":"Clip","duration":12.5,"formats":[{"format_id":"22","ext":"mp4","filesize":2048}]}'
"#;

const FFMPEG_OK: &str = r#"echo "$*" >> '@CALLS@'
for last; do :; done
echo "Input #0, matroska,webm, from 'in.mkv':" >&2
echo "  Duration: 00:00:10.00, start: 0.000000, bitrate: 1000 kb/s" >&2
echo "size=     256kB time=00:00:05.00 bitrate= 400.0kbits/s speed=2.0x" >&2
head -c 2048 /dev/zero > "$last"
echo "size=     512kB time=00:00:10.00 bitrate= 400.0kbits/s speed=2.0x" >&2
exit 0
"#;

struct Fixture {
    _tmp: TempDir,
    root: PathBuf,
    sink: Arc<RecordingSink>,
    engine: Engine,
}

impl Fixture {
    fn new(yt_dlp: &str, settings: UserSettings) -> Self {
        Self::with_ffmpeg(yt_dlp, "exit 1\n", settings)
    }

    fn with_ffmpeg(yt_dlp: &str, ffmpeg: &str, settings: UserSettings) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_path_buf();
        let calls = root.join("calls.txt");

        let config = EngineConfig {
            yt_dlp: write_script(&root, "yt-dlp", yt_dlp, &calls),
            ffmpeg: write_script(&root, "ffmpeg", ffmpeg, &calls),
            deno: None,
            error_log: Some(root.join("error.log")),
            settle_delay: Duration::from_millis(20),
            repoll_delay: Duration::from_millis(20),
            metadata_timeout: Duration::from_secs(10),
            drain_timeout: Duration::from_millis(500),
        };
        let settings = settings.with_download_dir(root.join("downloads"));
        let sink = RecordingSink::new();
        let engine = Engine::new(config, settings, sink.clone());

        Self {
            _tmp: tmp,
            root,
            sink,
            engine,
        }
    }

    fn downloads(&self) -> PathBuf {
        self.root.join("downloads")
    }

    fn calls(&self) -> Vec<String> {
        std::fs::read_to_string(self.root.join("calls.txt"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn error_log(&self) -> String {
        std::fs::read_to_string(self.root.join("error.log")).unwrap_or_default()
    }
}

fn write_script(dir: &Path, name: &str, body: &str, calls: &Path) -> PathBuf {
    let path = dir.join(name);
    let body = body.replace("@CALLS@", &calls.to_string_lossy());
    std::fs::write(&path, format!("#!/bin/sh\n{}", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn failure_code(event: &EngineEvent) -> Option<ErrorCode> {
    match event {
        EngineEvent::Failed { error_code, .. } => Some(*error_code),
        _ => None,
    }
}

#[tokio::test]
async fn test_download_completes_after_verification() {
    let fx = Fixture::new(DOWNLOAD_OK, UserSettings::default());

    let handle = fx
        .engine
        .download("https://example.com/watch?v=abc", "22", None)
        .await
        .unwrap();
    let id = handle.id();
    let outcome = handle.wait().await;

    let expected = fx.downloads().join("Clip.mp4");
    assert_eq!(outcome, TerminalOutcome::Completed(expected.clone()));

    let percents = fx.sink.progress_percents();
    assert_eq!(percents, vec![10, 55, 100]);

    let events = fx.sink.events();
    assert!(events.iter().all(|e| e.operation_id() == id));
    match events.last().unwrap() {
        EngineEvent::Completed { path, category, .. } => {
            assert_eq!(Path::new(path), expected);
            assert_eq!(*category, OperationCategory::Download);
        }
        other => panic!("expected completed, got {:?}", other),
    }
    assert_eq!(fx.sink.terminal_events().len(), 1);
    assert!(!fx.engine.is_active(OperationCategory::Download).await);

    let calls = fx.calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].contains("-f 22"));
    assert!(calls[0].contains("--newline --progress"));
}

#[tokio::test]
async fn test_explicit_template_is_verified_by_base_name() {
    let fx = Fixture::new(DOWNLOAD_OK, UserSettings::default());
    let out_dir = fx.root.join("elsewhere");
    let template = out_dir.join("Named.%(ext)s");

    let outcome = fx
        .engine
        .download("https://example.com/v", "best", Some(&template.to_string_lossy()))
        .await
        .unwrap()
        .wait()
        .await;

    assert_eq!(outcome, TerminalOutcome::Completed(out_dir.join("Named.mp4")));
}

#[tokio::test]
async fn test_auth_failure_drops_cookies_once_then_gives_up() {
    let fx = Fixture::new(
        SIGN_IN_REQUIRED,
        UserSettings::default().with_cookies_browser("firefox"),
    );

    let outcome = fx
        .engine
        .download("https://example.com/v", "best", None)
        .await
        .unwrap()
        .wait()
        .await;
    assert!(matches!(outcome, TerminalOutcome::Failed(_)));

    let calls = fx.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[0].contains("--cookies-from-browser=firefox"));
    assert!(!calls[1].contains("--cookies-from-browser"));
    // Dropping auth does not drop the format selector.
    assert!(calls[1].contains("-f best"));

    let terminal = fx.sink.terminal_events();
    assert_eq!(terminal.len(), 1);
    assert_eq!(failure_code(&terminal[0]), Some(ErrorCode::LoginRequired));

    let log = fx.error_log();
    assert_eq!(log.lines().count(), 1);
    assert!(log.contains("Operation: DownloadVideo URL: https://example.com/v Format: best"));
}

#[tokio::test]
async fn test_auth_error_in_live_output_stops_attempt_early() {
    let fx = Fixture::new(
        SIGN_IN_THEN_HANG,
        UserSettings::default().with_cookies_browser("chrome"),
    );

    let started = Instant::now();
    let outcome = fx
        .engine
        .download("https://example.com/v", "best", None)
        .await
        .unwrap()
        .wait()
        .await;

    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(matches!(outcome, TerminalOutcome::Failed(_)));
    let calls = fx.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[0].contains("--cookies-from-browser=chrome"));
    assert!(!calls[1].contains("--cookies-from-browser"));
    assert_eq!(fx.sink.terminal_events().len(), 1);
}

#[tokio::test]
async fn test_retry_spawn_failure_releases_slot() {
    let fx = Fixture::new(
        SIGN_IN_THEN_VANISH,
        UserSettings::default().with_cookies_browser("firefox"),
    );

    let outcome = fx
        .engine
        .download("https://example.com/v", "best", None)
        .await
        .unwrap()
        .wait()
        .await;
    assert!(matches!(outcome, TerminalOutcome::Failed(_)));
    assert_eq!(fx.calls().len(), 1);

    let terminal = fx.sink.terminal_events();
    assert_eq!(terminal.len(), 1);
    assert_eq!(failure_code(&terminal[0]), Some(ErrorCode::ToolMissing));
    assert!(!fx.engine.is_active(OperationCategory::Download).await);

    // The category is free again: the next download gets as far as spawning.
    let err = fx
        .engine
        .download("https://example.com/v", "best", None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ProcessStartFailure { .. }));
}

#[tokio::test]
async fn test_progress_does_not_regress_across_retry() {
    let fx = Fixture::new(
        PROGRESS_THEN_SIGN_IN,
        UserSettings::default().with_cookies_browser("chrome"),
    );

    let outcome = fx
        .engine
        .download("https://example.com/v", "best", None)
        .await
        .unwrap()
        .wait()
        .await;

    assert_eq!(
        outcome,
        TerminalOutcome::Completed(fx.downloads().join("Clip.mp4"))
    );
    assert_eq!(fx.sink.progress_percents(), vec![40, 60, 100]);
    assert_eq!(fx.calls().len(), 2);
    assert_eq!(fx.sink.terminal_events().len(), 1);
}

#[tokio::test]
async fn test_unrecognized_failure_is_not_retried() {
    let fx = Fixture::new(
        ODD_FAILURE,
        UserSettings::default().with_cookies_browser("firefox"),
    );

    let outcome = fx
        .engine
        .download("https://example.com/v", "best", None)
        .await
        .unwrap()
        .wait()
        .await;

    assert_eq!(
        outcome,
        TerminalOutcome::Failed("ERROR: something odd happened".to_string())
    );
    assert_eq!(fx.calls().len(), 1);
    assert_eq!(fx.sink.progress_percents(), vec![12]);

    let terminal = fx.sink.terminal_events();
    assert_eq!(terminal.len(), 1);
    assert_eq!(failure_code(&terminal[0]), Some(ErrorCode::Unknown));
    assert!(fx.error_log().contains("something odd happened"));
}

#[tokio::test]
async fn test_leftover_fragments_fail_verification() {
    let fx = Fixture::new(LEAVES_FRAGMENTS, UserSettings::default());
    let template = fx.downloads().join("Clip.%(ext)s");

    let outcome = fx
        .engine
        .download("https://example.com/v", "best", Some(&template.to_string_lossy()))
        .await
        .unwrap()
        .wait()
        .await;

    assert!(matches!(outcome, TerminalOutcome::Failed(_)));
    let terminal = fx.sink.terminal_events();
    assert_eq!(terminal.len(), 1);
    assert_eq!(failure_code(&terminal[0]), Some(ErrorCode::IncompleteOutput));
    assert!(!fx
        .sink
        .events()
        .iter()
        .any(|e| matches!(e, EngineEvent::Completed { .. })));
}

#[tokio::test]
async fn test_cancel_emits_single_cancelled_event() {
    let fx = Fixture::new(SLOW, UserSettings::default());

    let handle = fx
        .engine
        .download("https://example.com/v", "best", None)
        .await
        .unwrap();
    assert!(fx.engine.is_active(OperationCategory::Download).await);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let (first, second) = tokio::join!(
        fx.engine.cancel(OperationCategory::Download),
        fx.engine.cancel(OperationCategory::Download),
    );
    let cancelled: Vec<_> = [first, second].into_iter().filter_map(Result::ok).collect();
    assert_eq!(cancelled, vec![handle.id()]);

    let started = Instant::now();
    assert_eq!(handle.wait().await, TerminalOutcome::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(10));

    let terminal = fx.sink.terminal_events();
    assert_eq!(terminal.len(), 1);
    assert!(matches!(terminal[0], EngineEvent::Cancelled { .. }));
    assert!(!fx.engine.is_active(OperationCategory::Download).await);
    assert!(fx.error_log().is_empty());
}

#[tokio::test]
async fn test_cancel_without_operation_emits_nothing() {
    let fx = Fixture::new(DOWNLOAD_OK, UserSettings::default());

    let err = fx
        .engine
        .cancel(OperationCategory::Conversion)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::NoActiveOperation(OperationCategory::Conversion)
    ));
    assert!(fx.sink.events().is_empty());
}

#[tokio::test]
async fn test_second_download_is_rejected_while_busy() {
    let fx = Fixture::new(SLOW, UserSettings::default());

    let handle = fx
        .engine
        .download("https://example.com/one", "best", None)
        .await
        .unwrap();
    let err = fx
        .engine
        .download("https://example.com/two", "best", None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidRequest(_)));
    assert!(fx
        .sink
        .events()
        .iter()
        .all(|e| e.operation_id() == handle.id()));

    fx.engine.cancel(OperationCategory::Download).await.unwrap();
    assert_eq!(handle.wait().await, TerminalOutcome::Cancelled);
    assert_eq!(fx.calls().len(), 1);
}

#[tokio::test]
async fn test_cookie_file_is_passed_when_present() {
    let tmp = tempfile::tempdir().unwrap();
    let cookies = tmp.path().join("cookies.txt");
    std::fs::write(&cookies, "# Netscape HTTP Cookie File\n").unwrap();

    let fx = Fixture::new(
        DOWNLOAD_OK,
        UserSettings::default().with_cookies_file(cookies.to_string_lossy()),
    );
    let outcome = fx
        .engine
        .download("https://example.com/v", "best", None)
        .await
        .unwrap()
        .wait()
        .await;

    assert!(matches!(outcome, TerminalOutcome::Completed(_)));
    let calls = fx.calls();
    assert!(calls[0].contains(&format!("--cookies {}", cookies.display())));
}

#[tokio::test]
async fn test_playlist_download_reports_directory() {
    let fx = Fixture::new(DOWNLOAD_OK, UserSettings::default());

    let outcome = fx
        .engine
        .download_playlist("https://example.com/list", "best", None, Some(2), Some(3))
        .await
        .unwrap()
        .wait()
        .await;

    assert_eq!(outcome, TerminalOutcome::Completed(fx.downloads()));
    let calls = fx.calls();
    assert!(calls[0].contains("--ignore-errors"));
    assert!(calls[0].contains("--playlist-items 2-3"));
}

#[tokio::test]
async fn test_playlist_range_is_validated_before_start() {
    let fx = Fixture::new(DOWNLOAD_OK, UserSettings::default());

    let err = fx
        .engine
        .download_playlist("https://example.com/list", "best", None, Some(5), Some(2))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidRequest(_)));
    assert!(fx.calls().is_empty());
    assert!(fx.sink.events().is_empty());
}

#[tokio::test]
async fn test_conversion_progress_and_completion() {
    let fx = Fixture::with_ffmpeg(DOWNLOAD_OK, FFMPEG_OK, UserSettings::default());
    let source = fx.root.join("in.mkv");
    std::fs::write(&source, vec![0u8; 4096]).unwrap();

    let handle = fx.engine.convert(&source, "mp3").await.unwrap();
    assert_eq!(handle.category(), OperationCategory::Conversion);
    // Conversions have their own slot.
    assert!(!fx.engine.is_active(OperationCategory::Download).await);

    let outcome = handle.wait().await;
    let expected = fx.root.join("in.mp3");
    assert_eq!(outcome, TerminalOutcome::Completed(expected.clone()));
    assert_eq!(fx.sink.progress_percents(), vec![50, 100]);

    let calls = fx.calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].starts_with(&format!("-i {}", source.display())));
    assert!(calls[0].contains("libmp3lame"));
    assert!(calls[0].ends_with(&expected.to_string_lossy().into_owned()));
}

#[tokio::test]
async fn test_conversion_to_same_format_is_rejected() {
    let fx = Fixture::new(DOWNLOAD_OK, UserSettings::default());
    let source = fx.root.join("in.mp3");
    std::fs::write(&source, b"x").unwrap();

    let err = fx.engine.convert(&source, "MP3").await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidRequest(_)));
    assert!(fx.sink.events().is_empty());
}

#[tokio::test]
async fn test_analyze_through_engine() {
    let fx = Fixture::new(ANALYZE, UserSettings::default());

    let info = fx.engine.analyze("  https://example.com/v  ").await.unwrap();
    assert_eq!(info.id.as_deref(), Some("abc"));
    assert_eq!(info.title.as_deref(), Some("Clip"));
    assert_eq!(info.formats.len(), 1);
    assert!(info.formats[0].filesize_human.is_some());

    let calls = fx.calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].starts_with("--print-json --simulate https://example.com/v"));
    // Metadata queries do not produce events.
    assert!(fx.sink.events().is_empty());
}
