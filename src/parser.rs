//! Stream parsers for tool output.
//!
//! Chunks arrive at arbitrary byte boundaries. Each parser keeps the
//! unterminated tail of the previous chunk and only matches complete
//! segments, where a segment ends at `\n` or `\r` (ffmpeg and yt-dlp
//! without `--newline` redraw their status line with `\r`).

use std::path::PathBuf;

use lazy_regex::{lazy_regex, Lazy};
use regex::Regex;

use crate::models::{Phase, PLACEHOLDER};
use crate::utils::{format_duration, parse_ffmpeg_time};

/// `[download]  42.0% of 10.00MiB at 1.00MiB/s ETA 00:05`
static PRIMARY: Lazy<Regex> = lazy_regex!(
    r"\[download\]\s+([0-9]{1,3}(?:\.[0-9]+)?)%\s+of\s+(~?[0-9.]+\s*[kKmMgGtT]?i?B)\s+at\s+([0-9.]+\s*[kKmMgGtT]?i?B/s|unknown)\s+ETA\s+([0-9:]+|unknown)"
);

/// Same fields with anything in between, e.g. `of ~  10.00MiB` or a
/// `(frag 3/10)` suffix.
static FLEXIBLE: Lazy<Regex> = lazy_regex!(
    r"\[download\]\s+([0-9]{1,3}(?:\.[0-9]+)?)%.*?of\s+([~≈]?\s*[0-9.]+\s*[kKmMgGtT]?i?B).*?at\s+([0-9.]+\s*[kKmMgGtT]?i?B/s|unknown).*?ETA\s+([0-9:]+|unknown)"
);

static PERCENT_ONLY: Lazy<Regex> = lazy_regex!(r"\[download\][^0-9%]*([0-9]{1,3}(?:\.[0-9]+)?)\s*%");

static DESTINATION: Lazy<Regex> =
    lazy_regex!(r"^\[(?:download|ExtractAudio|VideoConvertor)\] Destination: (.+)$");
static ALREADY_DOWNLOADED: Lazy<Regex> =
    lazy_regex!(r"^\[download\] (.+) has already been downloaded");
static MERGING_INTO: Lazy<Regex> = lazy_regex!(r#"^\[Merger\] Merging formats into "(.+)"$"#);

static FFMPEG_DURATION: Lazy<Regex> = lazy_regex!(r"Duration:\s*([0-9]+:[0-9]+:[0-9]+(?:\.[0-9]+)?)");
static FFMPEG_TIME: Lazy<Regex> = lazy_regex!(r"time=\s*([0-9]+:[0-9]+:[0-9]+(?:\.[0-9]+)?)");
static FFMPEG_SIZE: Lazy<Regex> = lazy_regex!(r"size=\s*([0-9]+\s*[kKmMgG]i?B)");
static FFMPEG_SPEED: Lazy<Regex> = lazy_regex!(r"speed=\s*([0-9.]+)x");

/// Flush the carry buffer when a segment grows past this without a terminator.
const MAX_SEGMENT: usize = 64 * 1024;

/// Which rule produced a reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    Primary,
    Flexible,
    PercentOnly,
    CompletionHeuristic,
    Ffmpeg,
}

/// A single progress reading before reconciliation. Fields that the rule
/// did not report already carry the last known value.
#[derive(Debug, Clone, PartialEq)]
pub struct RawProgress {
    pub percent: f64,
    pub size: String,
    pub speed: String,
    pub eta: String,
    pub rule: RuleKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParseEvent {
    Progress(RawProgress),
    Phase(Phase),
    /// File the tool says it is writing.
    Destination(PathBuf),
}

/// Incremental parser fed with raw output chunks.
pub trait OutputParser: Send {
    fn feed(&mut self, chunk: &[u8]) -> Vec<ParseEvent>;

    /// Parse whatever is left once the stream hits EOF.
    fn finish(&mut self) -> Vec<ParseEvent>;

    /// Drop any half-read segment before a new process starts writing.
    /// Last known values survive.
    fn reset_stream(&mut self);
}

/// Splits a byte stream into `\n`/`\r` terminated segments.
#[derive(Debug, Default)]
struct LineAssembler {
    carry: Vec<u8>,
}

impl LineAssembler {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.carry.extend_from_slice(chunk);
        let mut segments = Vec::new();
        let mut start = 0;
        for (i, b) in self.carry.iter().enumerate() {
            if *b == b'\n' || *b == b'\r' {
                if i > start {
                    segments.push(String::from_utf8_lossy(&self.carry[start..i]).into_owned());
                }
                start = i + 1;
            }
        }
        self.carry.drain(..start);
        if self.carry.len() > MAX_SEGMENT {
            segments.push(String::from_utf8_lossy(&self.carry).into_owned());
            self.carry.clear();
        }
        segments
    }

    fn take_rest(&mut self) -> Option<String> {
        if self.carry.is_empty() {
            return None;
        }
        let rest = String::from_utf8_lossy(&self.carry).into_owned();
        self.carry.clear();
        Some(rest)
    }

    fn clear(&mut self) {
        self.carry.clear();
    }
}

/// What a rule pulled out of a segment. `None` fields were not reported.
#[derive(Debug, Clone, PartialEq)]
struct RuleMatch {
    percent: f64,
    size: Option<String>,
    speed: Option<String>,
    eta: Option<String>,
}

trait ProgressRule: Send + Sync {
    fn kind(&self) -> RuleKind;
    fn apply(&self, segment: &str) -> Option<RuleMatch>;
}

/// Percent, size, speed and ETA in capture groups 1-4.
struct StructuredRule {
    kind: RuleKind,
    pattern: &'static Lazy<Regex>,
}

impl ProgressRule for StructuredRule {
    fn kind(&self) -> RuleKind {
        self.kind
    }

    fn apply(&self, segment: &str) -> Option<RuleMatch> {
        let caps = self.pattern.captures_iter(segment).last()?;
        let percent = caps.get(1)?.as_str().parse::<f64>().ok()?;
        let known = |i: usize| {
            caps.get(i)
                .map(|m| m.as_str().trim())
                .filter(|s| !s.eq_ignore_ascii_case("unknown"))
                .map(normalize_size)
        };
        Some(RuleMatch {
            percent,
            size: known(2),
            speed: known(3),
            eta: known(4),
        })
    }
}

struct PercentOnlyRule;

impl ProgressRule for PercentOnlyRule {
    fn kind(&self) -> RuleKind {
        RuleKind::PercentOnly
    }

    fn apply(&self, segment: &str) -> Option<RuleMatch> {
        let caps = PERCENT_ONLY.captures_iter(segment).last()?;
        let percent = caps.get(1)?.as_str().parse::<f64>().ok()?;
        Some(RuleMatch {
            percent,
            size: None,
            speed: None,
            eta: None,
        })
    }
}

/// Collapse inner whitespace: `"~  10.00MiB"` becomes `"~ 10.00MiB"`.
fn normalize_size(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[derive(Debug, Clone)]
struct LastKnown {
    size: String,
    speed: String,
    eta: String,
}

impl Default for LastKnown {
    fn default() -> Self {
        Self {
            size: PLACEHOLDER.to_string(),
            speed: PLACEHOLDER.to_string(),
            eta: PLACEHOLDER.to_string(),
        }
    }
}

/// Parser for yt-dlp's stdout.
pub struct YtDlpProgressParser {
    lines: LineAssembler,
    rules: Vec<Box<dyn ProgressRule>>,
    last: LastKnown,
    completion_forced: bool,
}

impl Default for YtDlpProgressParser {
    fn default() -> Self {
        Self::new()
    }
}

impl YtDlpProgressParser {
    pub fn new() -> Self {
        Self {
            lines: LineAssembler::default(),
            rules: vec![
                Box::new(StructuredRule {
                    kind: RuleKind::Primary,
                    pattern: &PRIMARY,
                }),
                Box::new(StructuredRule {
                    kind: RuleKind::Flexible,
                    pattern: &FLEXIBLE,
                }),
                Box::new(PercentOnlyRule),
            ],
            last: LastKnown::default(),
            completion_forced: false,
        }
    }

    fn parse_segment(&mut self, segment: &str, out: &mut Vec<ParseEvent>) {
        let segment = segment.trim();
        if segment.is_empty() {
            return;
        }
        if segment.contains("[download]") {
            log::debug!("yt-dlp: {}", segment);
        }

        if let Some(phase) = phase_marker(segment) {
            out.push(ParseEvent::Phase(phase));
        }
        if let Some(path) = destination(segment) {
            out.push(ParseEvent::Destination(path));
        }

        let mut reading = self.rules.iter().find_map(|rule| {
            rule.apply(segment).map(|m| (rule.kind(), m))
        });

        if let Some((_, ref m)) = reading {
            if let Some(ref size) = m.size {
                self.last.size = size.clone();
            }
            if let Some(ref speed) = m.speed {
                self.last.speed = speed.clone();
            }
            if let Some(ref eta) = m.eta {
                self.last.eta = eta.clone();
            }
        }

        if !self.completion_forced && segment.contains("[download]") && segment.contains("100%")
        {
            self.completion_forced = true;
            out.push(ParseEvent::Progress(RawProgress {
                percent: 100.0,
                size: self.last.size.clone(),
                speed: "Done".to_string(),
                eta: "00:00".to_string(),
                rule: RuleKind::CompletionHeuristic,
            }));
            reading = None;
        }

        if let Some((rule, m)) = reading {
            out.push(ParseEvent::Progress(RawProgress {
                percent: m.percent,
                size: self.last.size.clone(),
                speed: self.last.speed.clone(),
                eta: self.last.eta.clone(),
                rule,
            }));
        }
    }
}

impl OutputParser for YtDlpProgressParser {
    fn feed(&mut self, chunk: &[u8]) -> Vec<ParseEvent> {
        let mut out = Vec::new();
        for segment in self.lines.push(chunk) {
            self.parse_segment(&segment, &mut out);
        }
        out
    }

    fn finish(&mut self) -> Vec<ParseEvent> {
        let mut out = Vec::new();
        if let Some(rest) = self.lines.take_rest() {
            self.parse_segment(&rest, &mut out);
        }
        out
    }

    fn reset_stream(&mut self) {
        self.lines.clear();
    }
}

fn phase_marker(segment: &str) -> Option<Phase> {
    if segment.contains("[ExtractAudio]") {
        Some(Phase::Extracting)
    } else if segment.contains("[Merger]")
        || segment.contains("Merging formats")
        || segment.contains("[VideoConvertor]")
        || segment.contains("[ffmpeg]")
    {
        Some(Phase::Converting)
    } else {
        None
    }
}

fn destination(segment: &str) -> Option<PathBuf> {
    [&DESTINATION, &ALREADY_DOWNLOADED, &MERGING_INTO]
        .iter()
        .find_map(|re| re.captures(segment))
        .and_then(|caps| caps.get(1))
        .map(|m| PathBuf::from(m.as_str().trim()))
}

/// Parser for ffmpeg's stderr. Percent is `time=` over the input's `Duration:`.
pub struct FfmpegProgressParser {
    lines: LineAssembler,
    duration: f64,
    last_size: String,
}

impl Default for FfmpegProgressParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FfmpegProgressParser {
    pub fn new() -> Self {
        Self {
            lines: LineAssembler::default(),
            duration: 0.0,
            last_size: PLACEHOLDER.to_string(),
        }
    }

    fn parse_segment(&mut self, segment: &str, out: &mut Vec<ParseEvent>) {
        if self.duration <= 0.0 {
            if let Some(caps) = FFMPEG_DURATION.captures(segment) {
                self.duration = caps.get(1).map(|m| parse_ffmpeg_time(m.as_str())).unwrap_or(0.0);
            }
        }

        let current = match FFMPEG_TIME.captures_iter(segment).last() {
            Some(caps) => caps.get(1).map(|m| parse_ffmpeg_time(m.as_str())).unwrap_or(0.0),
            None => return,
        };
        if self.duration <= 0.0 {
            return;
        }

        if let Some(caps) = FFMPEG_SIZE.captures_iter(segment).last() {
            if let Some(m) = caps.get(1) {
                self.last_size = normalize_size(m.as_str());
            }
        }
        let speed = FFMPEG_SPEED
            .captures_iter(segment)
            .last()
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<f64>().ok());

        let percent = (current / self.duration * 100.0).clamp(0.0, 100.0);
        let (speed_text, eta) = match speed {
            Some(s) if s > 0.0 => (
                format!("{}x", s),
                format_duration((self.duration - current).max(0.0) / s),
            ),
            _ => (PLACEHOLDER.to_string(), PLACEHOLDER.to_string()),
        };

        out.push(ParseEvent::Progress(RawProgress {
            percent,
            size: self.last_size.clone(),
            speed: speed_text,
            eta,
            rule: RuleKind::Ffmpeg,
        }));
    }
}

impl OutputParser for FfmpegProgressParser {
    fn feed(&mut self, chunk: &[u8]) -> Vec<ParseEvent> {
        let mut out = Vec::new();
        for segment in self.lines.push(chunk) {
            self.parse_segment(&segment, &mut out);
        }
        out
    }

    fn finish(&mut self) -> Vec<ParseEvent> {
        let mut out = Vec::new();
        if let Some(rest) = self.lines.take_rest() {
            self.parse_segment(&rest, &mut out);
        }
        out
    }

    fn reset_stream(&mut self) {
        self.lines.clear();
    }
}
