//! Retry/fallback controller.
//!
//! A [`RetryPlan`] is an ordered list of argument variants. Each variant
//! names the failure signals that justify moving to it. The controller only
//! advances when the observed signal is in that list and the variant would
//! actually change the request; anything else ends the operation.

use std::fmt;

use crate::command_builder::{JsonFlag, OperationRequest, TaskKind};
use crate::models::ErrorCode;
use crate::settings::AuthConfig;

/// Substrings in stderr meaning the site wants an authenticated session.
const AUTH_MARKERS: &[&str] = &["cookies", "Sign in to confirm", "authentication"];

const FORMAT_MARKERS: &[&str] = &["Requested format is not available"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureSignal {
    AuthRequired,
    FormatUnavailable,
    Unrecognized,
}

impl fmt::Display for FailureSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureSignal::AuthRequired => "authentication required",
            FailureSignal::FormatUnavailable => "requested format unavailable",
            FailureSignal::Unrecognized => "unrecognized failure",
        };
        f.write_str(s)
    }
}

/// Recognized signal in `stderr`, if any. Used on live output as well as
/// after exit.
pub fn detect_signal(stderr: &str) -> Option<FailureSignal> {
    if FORMAT_MARKERS.iter().any(|m| stderr.contains(m)) {
        return Some(FailureSignal::FormatUnavailable);
    }
    if AUTH_MARKERS.iter().any(|m| stderr.contains(m)) {
        return Some(FailureSignal::AuthRequired);
    }
    None
}

/// Signal for a finished attempt: recognized, or unrecognized.
pub fn classify_exit(stderr: &str) -> FailureSignal {
    detect_signal(stderr).unwrap_or(FailureSignal::Unrecognized)
}

/// Map tool stderr to a stable [`ErrorCode`] for the front-end.
pub fn classify_error(stderr: &str) -> ErrorCode {
    let stderr_lower = stderr.to_lowercase();

    if stderr_lower.contains("requested format") || stderr_lower.contains("format not available") {
        return ErrorCode::FormatUnavailable;
    }

    // Bot check / CAPTCHA
    if stderr_lower.contains("not a bot") || stderr_lower.contains("captcha") {
        return ErrorCode::BotCheck;
    }

    // Sign-in / cookies required
    if stderr_lower.contains("sign in")
        || stderr_lower.contains("login")
        || stderr_lower.contains("cookies")
        || stderr_lower.contains("age-restricted")
    {
        return ErrorCode::LoginRequired;
    }

    if stderr_lower.contains("not available in your country")
        || stderr_lower.contains("geo restrict")
        || stderr_lower.contains("geo-restrict")
    {
        return ErrorCode::GeoRestricted;
    }

    if stderr_lower.contains("unsupported url")
        || stderr_lower.contains("no video formats")
        || stderr_lower.contains("unable to extract")
    {
        return ErrorCode::ExtractorOutdated;
    }

    if stderr_lower.contains("network")
        || stderr_lower.contains("connection")
        || stderr_lower.contains("timed out")
        || stderr_lower.contains("temporary failure in name resolution")
    {
        return ErrorCode::Network;
    }

    ErrorCode::Unknown
}

/// One way of (re)issuing a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    AsRequested,
    WithoutAuth,
    WithoutFormatRestriction,
    /// Drop `--no-warnings`.
    MinimalFlags,
    /// `--dump-single-json` instead of `--print-json`.
    LegacyJsonFlag,
}

impl Variant {
    pub fn name(&self) -> &'static str {
        match self {
            Variant::AsRequested => "as_requested",
            Variant::WithoutAuth => "without_auth",
            Variant::WithoutFormatRestriction => "without_format_restriction",
            Variant::MinimalFlags => "minimal_flags",
            Variant::LegacyJsonFlag => "legacy_json_flag",
        }
    }

    /// Whether applying this variant to `request` changes anything.
    pub fn changes(&self, request: &OperationRequest) -> bool {
        match self {
            Variant::AsRequested => true,
            Variant::WithoutAuth => request.has_auth(),
            Variant::WithoutFormatRestriction => {
                request.selector.is_some() && request.task != TaskKind::Convert
            }
            Variant::MinimalFlags => request.quiet,
            Variant::LegacyJsonFlag => {
                request.task == TaskKind::Metadata && request.json_flag == JsonFlag::PrintJson
            }
        }
    }

    pub fn apply(&self, request: &OperationRequest) -> OperationRequest {
        let mut next = request.clone();
        match self {
            Variant::AsRequested => {}
            Variant::WithoutAuth => next.config.auth = AuthConfig::None,
            Variant::WithoutFormatRestriction => next.selector = None,
            Variant::MinimalFlags => next.quiet = false,
            Variant::LegacyJsonFlag => next.json_flag = JsonFlag::DumpSingleJson,
        }
        next
    }
}

#[derive(Debug, Clone)]
pub struct PlannedVariant {
    pub variant: Variant,
    pub justified_by: &'static [FailureSignal],
}

#[derive(Debug, Clone)]
pub struct RetryPlan {
    steps: Vec<PlannedVariant>,
}

const AUTH_OR_FORMAT: &[FailureSignal] =
    &[FailureSignal::AuthRequired, FailureSignal::FormatUnavailable];
const FORMAT_ONLY: &[FailureSignal] = &[FailureSignal::FormatUnavailable];
const AUTH_ONLY: &[FailureSignal] = &[FailureSignal::AuthRequired];
const NONE: &[FailureSignal] = &[];

fn step(variant: Variant, justified_by: &'static [FailureSignal]) -> PlannedVariant {
    PlannedVariant {
        variant,
        justified_by,
    }
}

impl RetryPlan {
    pub fn new(steps: Vec<PlannedVariant>) -> Self {
        let mut steps = steps;
        if steps.first().map(|s| s.variant) != Some(Variant::AsRequested) {
            steps.insert(0, step(Variant::AsRequested, NONE));
        }
        Self { steps }
    }

    /// Default plan for a task kind.
    pub fn for_task(task: &TaskKind) -> Self {
        match task {
            TaskKind::Metadata => Self::new(vec![
                step(Variant::AsRequested, NONE),
                step(Variant::WithoutAuth, AUTH_OR_FORMAT),
                step(Variant::WithoutFormatRestriction, FORMAT_ONLY),
                step(Variant::MinimalFlags, FORMAT_ONLY),
                step(Variant::LegacyJsonFlag, FORMAT_ONLY),
            ]),
            TaskKind::PlaylistEntries => Self::new(vec![
                step(Variant::AsRequested, NONE),
                step(Variant::WithoutAuth, AUTH_ONLY),
            ]),
            TaskKind::Download | TaskKind::PlaylistDownload { .. } => Self::new(vec![
                step(Variant::AsRequested, NONE),
                step(Variant::WithoutAuth, AUTH_OR_FORMAT),
                step(Variant::WithoutFormatRestriction, FORMAT_ONLY),
            ]),
            TaskKind::Convert => Self::new(vec![step(Variant::AsRequested, NONE)]),
        }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step(&self, index: usize) -> Option<&PlannedVariant> {
        self.steps.get(index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    Attempting(usize),
    Succeeded,
    ExhaustedFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { index: usize, variant: Variant },
    Exhausted,
}

/// Walks a [`RetryPlan`]. Variants are cumulative: once auth is dropped it
/// stays dropped for the later variants.
#[derive(Debug, Clone)]
pub struct RetryController {
    plan: RetryPlan,
    state: RetryState,
    request: OperationRequest,
    attempts: u32,
}

impl RetryController {
    pub fn new(plan: RetryPlan, request: OperationRequest) -> Self {
        Self {
            plan,
            state: RetryState::Attempting(0),
            request,
            attempts: 1,
        }
    }

    pub fn for_request(request: OperationRequest) -> Self {
        Self::new(RetryPlan::for_task(&request.task), request)
    }

    pub fn state(&self) -> RetryState {
        self.state
    }

    /// Request for the current attempt.
    pub fn request(&self) -> &OperationRequest {
        &self.request
    }

    /// 1-based attempt counter.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn current_variant(&self) -> Variant {
        match self.state {
            RetryState::Attempting(i) => self
                .plan
                .step(i)
                .map(|s| s.variant)
                .unwrap_or(Variant::AsRequested),
            _ => Variant::AsRequested,
        }
    }

    fn next_step_for(&self, signal: FailureSignal) -> Option<(usize, Variant)> {
        let current = match self.state {
            RetryState::Attempting(i) => i,
            _ => return None,
        };
        if signal == FailureSignal::Unrecognized {
            return None;
        }
        (current + 1..self.plan.len()).find_map(|i| {
            let step = self.plan.step(i)?;
            (step.justified_by.contains(&signal) && step.variant.changes(&self.request))
                .then_some((i, step.variant))
        })
    }

    /// Whether a failure with `signal` right now would lead to another attempt.
    pub fn can_recover(&self, signal: FailureSignal) -> bool {
        self.next_step_for(signal).is_some()
    }

    pub fn on_success(&mut self) {
        self.state = RetryState::Succeeded;
    }

    pub fn on_failure(&mut self, signal: FailureSignal) -> RetryDecision {
        match self.next_step_for(signal) {
            Some((index, variant)) => {
                self.request = variant.apply(&self.request);
                self.state = RetryState::Attempting(index);
                self.attempts += 1;
                RetryDecision::Retry { index, variant }
            }
            None => {
                self.state = RetryState::ExhaustedFailed;
                RetryDecision::Exhausted
            }
        }
    }
}
