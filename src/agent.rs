use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::coords::{to_pixels, NormPoint, PixelPoint};
use crate::safety::{Decision, GateState, RiskLevel, SafetyGate, SafetyVerdict};

// ========================= Core Types =========================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MouseButton {
    Left,
    Middle,
    Right,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrollDirection {
    Up,
    Down,
    Left,
    Right,
}

impl std::str::FromStr for ScrollDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "up" => Ok(ScrollDirection::Up),
            "down" => Ok(ScrollDirection::Down),
            "left" => Ok(ScrollDirection::Left),
            "right" => Ok(ScrollDirection::Right),
            other => Err(format!("unknown scroll direction {other:?}")),
        }
    }
}

impl fmt::Display for ScrollDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScrollDirection::Up => "up",
            ScrollDirection::Down => "down",
            ScrollDirection::Left => "left",
            ScrollDirection::Right => "right",
        };
        f.write_str(s)
    }
}

/// One proposed UI action. Coordinates are on the normalized 0-999 grid.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    Click {
        at: NormPoint,
    },
    DoubleClick {
        at: NormPoint,
    },
    Hover {
        at: NormPoint,
    },
    TypeText {
        at: Option<NormPoint>,
        text: String,
        press_enter: bool,
        clear_before_typing: bool,
    },
    KeyCombo {
        keys: String,
    },
    ScrollDocument {
        direction: ScrollDirection,
        magnitude: u32,
    },
    ScrollAt {
        at: NormPoint,
        direction: ScrollDirection,
        magnitude: u32,
    },
    Drag {
        from: NormPoint,
        to: NormPoint,
    },
    Wait,
    /// Accepted but has no effect on a bare desktop (e.g. `open_web_browser`).
    Noop {
        name: String,
    },
    /// A call the planner made that could not be decoded. Executes as a failure.
    Rejected {
        name: String,
        reason: String,
    },
}

impl Action {
    /// The planner-facing function name of this action.
    pub fn name(&self) -> &str {
        match self {
            Action::Click { .. } => "click_at",
            Action::DoubleClick { .. } => "double_click_at",
            Action::Hover { .. } => "hover_at",
            Action::TypeText { .. } => "type_text_at",
            Action::KeyCombo { .. } => "key_combination",
            Action::ScrollDocument { .. } => "scroll_document",
            Action::ScrollAt { .. } => "scroll_at",
            Action::Drag { .. } => "drag_and_drop",
            Action::Wait => "wait_5_seconds",
            Action::Noop { name } | Action::Rejected { name, .. } => name,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Click { at } | Action::DoubleClick { at } | Action::Hover { at } => {
                write!(f, "{}(x={}, y={})", self.name(), at.x, at.y)
            }
            Action::TypeText {
                at,
                text,
                press_enter,
                clear_before_typing,
            } => {
                write!(f, "type_text_at(")?;
                if let Some(at) = at {
                    write!(f, "x={}, y={}, ", at.x, at.y)?;
                }
                write!(f, "text={text:?}")?;
                if *press_enter {
                    write!(f, ", press_enter")?;
                }
                if *clear_before_typing {
                    write!(f, ", clear_before_typing")?;
                }
                write!(f, ")")
            }
            Action::KeyCombo { keys } => write!(f, "key_combination(keys={keys:?})"),
            Action::ScrollDocument {
                direction,
                magnitude,
            } => write!(
                f,
                "scroll_document(direction={direction}, magnitude={magnitude})"
            ),
            Action::ScrollAt {
                at,
                direction,
                magnitude,
            } => write!(
                f,
                "scroll_at(x={}, y={}, direction={direction}, magnitude={magnitude})",
                at.x, at.y
            ),
            Action::Drag { from, to } => write!(
                f,
                "drag_and_drop(x={}, y={}, destination_x={}, destination_y={})",
                from.x, from.y, to.x, to.y
            ),
            Action::Wait => write!(f, "wait_5_seconds()"),
            Action::Noop { name } => write!(f, "{name}()"),
            Action::Rejected { name, reason } => write!(f, "{name}(<rejected: {reason}>)"),
        }
    }
}

/// A full-frame capture of the remote display.
#[derive(Clone, Serialize, Deserialize)]
pub struct Screenshot {
    pub id: String,
    #[serde(with = "png_base64")]
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub captured_at: DateTime<Utc>,
}

impl Screenshot {
    pub fn new(png: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            id: nanoid!(),
            png,
            width,
            height,
            captured_at: Utc::now(),
        }
    }

    pub fn reference(&self) -> ScreenshotRef {
        ScreenshotRef {
            id: self.id.clone(),
            width: self.width,
            height: self.height,
        }
    }

    pub fn to_base64(&self) -> String {
        B64.encode(&self.png)
    }
}

impl fmt::Debug for Screenshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Screenshot")
            .field("id", &self.id)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("png_bytes", &self.png.len())
            .finish()
    }
}

mod png_base64 {
    use super::B64;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&B64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        B64.decode(text).map_err(serde::de::Error::custom)
    }
}

/// Identity of a capture without its pixels. History only ever holds these.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenshotRef {
    pub id: String,
    pub width: u32,
    pub height: u32,
}

/// Result of executing one action, with the capture taken right after it.
#[derive(Clone, Debug)]
pub struct ActionOutcome {
    pub action: Action,
    pub success: bool,
    pub error: Option<String>,
    pub screenshot_after: Screenshot,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HistoryEntry {
    Proposal {
        observation: Option<String>,
        actions: Vec<Action>,
    },
    Outcome {
        step: usize,
        action: Action,
        success: bool,
        error: Option<String>,
        screenshot: ScreenshotRef,
    },
}

impl HistoryEntry {
    /// Text-only record of an executed action; the screenshot bytes are dropped here.
    pub fn from_outcome(step: usize, outcome: &ActionOutcome) -> Self {
        HistoryEntry::Outcome {
            step,
            action: outcome.action.clone(),
            success: outcome.success,
            error: outcome.error.clone(),
            screenshot: outcome.screenshot_after.reference(),
        }
    }

    pub fn is_outcome(&self) -> bool {
        matches!(self, HistoryEntry::Outcome { .. })
    }
}

#[derive(Clone, Debug, Default)]
pub struct Proposal {
    pub observation: Option<String>,
    pub actions: Vec<Action>,
    pub safety: Option<SafetyVerdict>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Denied,
    BudgetExceeded,
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Terminal {
    #[default]
    Running,
    Completed,
    Failed,
}

/// Externally visible phase of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Running,
    AwaitingApproval,
    Completed,
    Denied,
    BudgetExceeded,
    Error,
}

impl From<RunStatus> for RunPhase {
    fn from(s: RunStatus) -> Self {
        match s {
            RunStatus::Completed => RunPhase::Completed,
            RunStatus::Denied => RunPhase::Denied,
            RunStatus::BudgetExceeded => RunPhase::BudgetExceeded,
            RunStatus::Error => RunPhase::Error,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLimits {
    pub step_limit: usize,
    pub timeout_seconds: u64,
}

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            step_limit: 40,
            timeout_seconds: 300,
        }
    }
}

/// The single mutable record threaded through a run.
///
/// Serializable so a run suspended at the safety gate can be persisted and
/// picked up by another process. It never holds credentials.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionState {
    pub run_id: String,
    pub session_handle: String,
    pub task: String,
    pub limits: RunLimits,
    pub history: Vec<HistoryEntry>,
    pub pending_actions: VecDeque<Action>,
    pub last_screenshot: Option<Screenshot>,
    pub step_count: usize,
    pub started_at: DateTime<Utc>,
    pub suspended_at: Option<DateTime<Utc>>,
    pub suspended_ms: u64,
    pub terminal: Terminal,
    pub status: Option<RunStatus>,
    pub last_safety_verdict: Option<SafetyVerdict>,
    pub gate: SafetyGate,
    pub last_error: Option<String>,
    pub last_observation: Option<String>,
}

impl SessionState {
    pub fn new(
        run_id: impl Into<String>,
        session_handle: impl Into<String>,
        task: impl Into<String>,
        limits: RunLimits,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            session_handle: session_handle.into(),
            task: task.into(),
            limits,
            history: Vec::new(),
            pending_actions: VecDeque::new(),
            last_screenshot: None,
            step_count: 0,
            started_at: Utc::now(),
            suspended_at: None,
            suspended_ms: 0,
            terminal: Terminal::Running,
            status: None,
            last_safety_verdict: None,
            gate: SafetyGate::default(),
            last_error: None,
            last_observation: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.terminal == Terminal::Running
    }

    pub fn is_suspended(&self) -> bool {
        self.is_running() && self.gate.is_awaiting()
    }

    pub fn phase(&self) -> RunPhase {
        match self.status {
            Some(status) => status.into(),
            None if self.gate.is_awaiting() => RunPhase::AwaitingApproval,
            None => RunPhase::Running,
        }
    }

    /// Active run time, excluding any time spent awaiting approval.
    pub fn elapsed(&self, now: DateTime<Utc>) -> Duration {
        let wall = (now - self.started_at).to_std().unwrap_or_default();
        let mut paused = Duration::from_millis(self.suspended_ms);
        if let Some(since) = self.suspended_at {
            paused += (now - since).to_std().unwrap_or_default();
        }
        wall.saturating_sub(paused)
    }

    /// Time left before the run's timeout, or `None` once it has passed.
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        let limit = Duration::from_secs(self.limits.timeout_seconds);
        let elapsed = self.elapsed(now);
        (elapsed < limit).then(|| limit - elapsed)
    }

    pub fn outcome_count(&self) -> usize {
        self.history.iter().filter(|e| e.is_outcome()).count()
    }

    pub fn begin_suspension(&mut self, now: DateTime<Utc>) {
        if self.suspended_at.is_none() {
            self.suspended_at = Some(now);
        }
    }

    pub fn end_suspension(&mut self, now: DateTime<Utc>) {
        if let Some(since) = self.suspended_at.take() {
            let paused = (now - since).to_std().unwrap_or_default();
            self.suspended_ms = self.suspended_ms.saturating_add(paused.as_millis() as u64);
        }
    }

    /// Move the run to its terminal status. Unexecuted actions are dropped.
    pub fn conclude(&mut self, status: RunStatus, error: Option<String>) {
        if !self.pending_actions.is_empty() {
            debug!(
                run_id = %self.run_id,
                dropped = self.pending_actions.len(),
                "dropping unexecuted actions"
            );
            self.pending_actions.clear();
        }
        self.end_suspension(Utc::now());
        self.terminal = match status {
            RunStatus::Completed => Terminal::Completed,
            _ => Terminal::Failed,
        };
        self.status = Some(status);
        self.last_error = error;
    }

    pub fn summary(&self) -> RunSummary {
        let status = self.phase();
        RunSummary {
            success: status == RunPhase::Completed,
            status,
            steps_taken: self.step_count,
            run_id: self.run_id.clone(),
            error: self.last_error.clone(),
            approval_reason: if status == RunPhase::AwaitingApproval {
                Some(self.gate.reason().unwrap_or("unspecified").to_string())
            } else {
                None
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub success: bool,
    pub status: RunPhase,
    pub steps_taken: usize,
    pub run_id: String,
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_reason: Option<String>,
}

/// Where the loop stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Progress {
    Finished(RunStatus),
    Suspended,
}

/// `YYYYMMDD_HHMMSS_<8 hex chars>`
pub fn new_run_id() -> String {
    const HEX: [char; 16] = [
        '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f',
    ];
    format!(
        "{}_{}",
        Utc::now().format("%Y%m%d_%H%M%S"),
        nanoid!(8, &HEX)
    )
}

// ========================= Errors =========================

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("cannot reach {address}: {cause}")]
    Unreachable { address: String, cause: String },
    #[error("authentication rejected by {address}: {reason}")]
    AuthRejected { address: String, reason: String },
    #[error("protocol error talking to {address}: {cause}")]
    Protocol { address: String, cause: String },
    #[error("invalid address {0:?}")]
    InvalidAddress(String),
}

/// A single display primitive failed.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{primitive} failed: {cause}")]
pub struct BackendError {
    pub primitive: String,
    pub cause: String,
}

impl BackendError {
    pub fn new(primitive: impl Into<String>, cause: impl fmt::Display) -> Self {
        Self {
            primitive: primitive.into(),
            cause: cause.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PlannerError {
    #[error("missing API key: set {0}")]
    MissingApiKey(&'static str),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("planner returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("malformed planner response: {0}")]
    Malformed(String),
    #[error("screenshot encoding failed: {0}")]
    Image(String),
}

#[derive(Debug, Error)]
#[error("recorder error: {0}")]
pub struct RecorderError(pub String);

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("no credentials stored for {0:?}")]
    CredentialNotFound(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
    #[error("{0}")]
    Other(String),
}

// ========================= Pluggable Subsystems =========================

/// Owns one remote display session. All coordinates are pixels.
#[async_trait]
pub trait DisplayController: Send {
    /// Capture the whole screen, re-measuring its dimensions every time.
    async fn capture(&mut self) -> Result<Screenshot, BackendError>;
    async fn pointer_move(&mut self, at: PixelPoint) -> Result<(), BackendError>;
    async fn click(&mut self, at: PixelPoint, button: MouseButton) -> Result<(), BackendError>;
    async fn double_click(&mut self, at: PixelPoint) -> Result<(), BackendError>;
    async fn drag(&mut self, from: PixelPoint, to: PixelPoint) -> Result<(), BackendError>;
    async fn type_text(
        &mut self,
        text: &str,
        press_enter: bool,
        clear_first: bool,
    ) -> Result<(), BackendError>;
    async fn key_combo(&mut self, keys: &str) -> Result<(), BackendError>;
    async fn scroll(
        &mut self,
        direction: ScrollDirection,
        magnitude: u32,
    ) -> Result<(), BackendError>;

    async fn close(&mut self) {}
}

#[async_trait]
impl<T: DisplayController + ?Sized> DisplayController for Box<T> {
    async fn capture(&mut self) -> Result<Screenshot, BackendError> {
        (**self).capture().await
    }

    async fn pointer_move(&mut self, at: PixelPoint) -> Result<(), BackendError> {
        (**self).pointer_move(at).await
    }

    async fn click(&mut self, at: PixelPoint, button: MouseButton) -> Result<(), BackendError> {
        (**self).click(at, button).await
    }

    async fn double_click(&mut self, at: PixelPoint) -> Result<(), BackendError> {
        (**self).double_click(at).await
    }

    async fn drag(&mut self, from: PixelPoint, to: PixelPoint) -> Result<(), BackendError> {
        (**self).drag(from, to).await
    }

    async fn type_text(
        &mut self,
        text: &str,
        press_enter: bool,
        clear_first: bool,
    ) -> Result<(), BackendError> {
        (**self).type_text(text, press_enter, clear_first).await
    }

    async fn key_combo(&mut self, keys: &str) -> Result<(), BackendError> {
        (**self).key_combo(keys).await
    }

    async fn scroll(
        &mut self,
        direction: ScrollDirection,
        magnitude: u32,
    ) -> Result<(), BackendError> {
        (**self).scroll(direction, magnitude).await
    }

    async fn close(&mut self) {
        (**self).close().await
    }
}

/// Opens display sessions; the secret is only ever passed through here.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        address: &str,
        password: Option<&str>,
    ) -> Result<Box<dyn DisplayController>, ConnectionError>;
}

#[async_trait]
pub trait Planner: Send + Sync {
    /// One call to the oracle. `history` carries no image data; `screenshot`
    /// is the only capture attached.
    async fn propose(
        &self,
        task: &str,
        history: &[HistoryEntry],
        screenshot: &Screenshot,
    ) -> Result<Proposal, PlannerError>;

    /// Package one executed action as the evidence the oracle sees next turn.
    fn build_outcome_entry(&self, step: usize, outcome: &ActionOutcome) -> HistoryEntry {
        HistoryEntry::from_outcome(step, outcome)
    }
}

#[async_trait]
impl<T: Planner + ?Sized> Planner for Arc<T> {
    async fn propose(
        &self,
        task: &str,
        history: &[HistoryEntry],
        screenshot: &Screenshot,
    ) -> Result<Proposal, PlannerError> {
        (**self).propose(task, history, screenshot).await
    }

    fn build_outcome_entry(&self, step: usize, outcome: &ActionOutcome) -> HistoryEntry {
        (**self).build_outcome_entry(step, outcome)
    }
}

/// Best-effort persistence of a run. Errors are logged, never propagated.
#[async_trait]
pub trait RunRecorder: Send + Sync {
    async fn begin(&self, state: &SessionState, initial: &Screenshot) -> Result<(), RecorderError>;
    async fn record_step(
        &self,
        run_id: &str,
        step: usize,
        outcome: &ActionOutcome,
        observation: Option<&str>,
    ) -> Result<(), RecorderError>;
    async fn finalize(&self, state: &SessionState) -> Result<(), RecorderError>;
}

/// Source of approve/deny decisions for gated batches.
#[async_trait]
pub trait Approver: Send + Sync {
    /// `None` means no decision yet: the run suspends.
    async fn decide(
        &self,
        run_id: &str,
        verdict: &SafetyVerdict,
        pending: &[Action],
    ) -> Option<Decision>;
}

// ========================= Agent Core =========================

#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// How long `wait_5_seconds` waits.
    pub wait_duration: Duration,
    /// Pause between an action and the capture that follows it.
    pub settle_delay: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            wait_duration: Duration::from_secs(5),
            settle_delay: Duration::from_millis(300),
        }
    }
}

pub struct Agent<D, P>
where
    D: DisplayController,
    P: Planner,
{
    display: D,
    planner: P,
    recorder: Arc<dyn RunRecorder>,
    approver: Arc<dyn Approver>,
    cancel: CancellationToken,
    cfg: AgentConfig,
}

impl<D, P> Agent<D, P>
where
    D: DisplayController,
    P: Planner,
{
    pub fn new(display: D, planner: P, cfg: AgentConfig) -> Self {
        Self {
            display,
            planner,
            recorder: Arc::new(NullRecorder),
            approver: Arc::new(DeferredApprover),
            cancel: CancellationToken::new(),
            cfg,
        }
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn RunRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn with_approver(mut self, approver: Arc<dyn Approver>) -> Self {
        self.approver = approver;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn display(&self) -> &D {
        &self.display
    }

    pub fn into_display(self) -> D {
        self.display
    }

    /// Start (or continue) a run until it finishes or suspends at the gate.
    pub async fn run(&mut self, state: &mut SessionState) -> Progress {
        if !state.is_running() {
            return Progress::Finished(state.status.unwrap_or(RunStatus::Error));
        }
        if state.is_suspended() {
            return Progress::Suspended;
        }
        if state.last_screenshot.is_none() {
            info!(run_id = %state.run_id, task = %state.task, "run started");
            match self.display.capture().await {
                Ok(shot) => {
                    if let Err(e) = self.recorder.begin(state, &shot).await {
                        warn!(run_id = %state.run_id, error = %e, "recorder begin failed");
                    }
                    state.last_screenshot = Some(shot);
                }
                Err(e) => {
                    return self
                        .finish(state, RunStatus::Error, Some(format!("initial capture: {e}")))
                        .await
                }
            }
        }
        self.drive(state).await
    }

    /// Apply a human decision to a run suspended at the gate and carry on.
    ///
    /// Fails with `InvalidState`, leaving `state` untouched, unless the run is
    /// awaiting approval.
    pub async fn resume(
        &mut self,
        state: &mut SessionState,
        decision: Decision,
    ) -> Result<Progress, AgentError> {
        apply_decision(state, decision)?;
        if decision == Decision::Deny {
            let reason = denial_reason(state);
            return Ok(self
                .finish(state, RunStatus::Denied, Some(reason))
                .await);
        }

        info!(run_id = %state.run_id, pending = state.pending_actions.len(), "batch approved");
        // the screen may have changed while the run was parked
        match self.display.capture().await {
            Ok(shot) => state.last_screenshot = Some(shot),
            Err(e) => {
                return Ok(self
                    .finish(state, RunStatus::Error, Some(format!("capture on resume: {e}")))
                    .await)
            }
        }
        if let Some(done) = self.act(state).await {
            return Ok(done);
        }
        state.gate.reset();
        Ok(self.drive(state).await)
    }

    async fn drive(&mut self, state: &mut SessionState) -> Progress {
        loop {
            if self.cancel.is_cancelled() {
                return self
                    .finish(state, RunStatus::Error, Some("cancelled".into()))
                    .await;
            }
            if state.step_count >= state.limits.step_limit {
                let msg = format!("step limit of {} reached", state.limits.step_limit);
                return self.finish(state, RunStatus::BudgetExceeded, Some(msg)).await;
            }
            let Some(remaining) = state.remaining(Utc::now()) else {
                let msg = format!("timeout of {}s exceeded", state.limits.timeout_seconds);
                return self.finish(state, RunStatus::BudgetExceeded, Some(msg)).await;
            };
            let Some(screenshot) = state.last_screenshot.clone() else {
                return self
                    .finish(state, RunStatus::Error, Some("no screenshot to plan from".into()))
                    .await;
            };

            let turn = state.history.iter().filter(|e| !e.is_outcome()).count() + 1;
            debug!(run_id = %state.run_id, turn, "proposing");
            let proposed = tokio::select! {
                _ = self.cancel.cancelled() => None,
                r = tokio::time::timeout(
                    remaining,
                    self.planner.propose(&state.task, &state.history, &screenshot),
                ) => Some(r),
            };
            let proposal = match proposed {
                None => {
                    return self
                        .finish(state, RunStatus::Error, Some("cancelled".into()))
                        .await;
                }
                Some(Err(_)) => {
                    let msg = format!("timeout of {}s exceeded", state.limits.timeout_seconds);
                    return self.finish(state, RunStatus::BudgetExceeded, Some(msg)).await;
                }
                Some(Ok(Err(e))) => {
                    warn!(run_id = %state.run_id, error = %e, "planner failed");
                    return self
                        .finish(state, RunStatus::Error, Some(format!("planner failure: {e}")))
                        .await;
                }
                Some(Ok(Ok(p))) => p,
            };

            info!(
                run_id = %state.run_id,
                turn,
                actions = proposal.actions.len(),
                risk = ?proposal.safety.as_ref().map(|v| v.risk_level),
                "proposal received"
            );
            state.history.push(HistoryEntry::Proposal {
                observation: proposal.observation.clone(),
                actions: proposal.actions.clone(),
            });
            state.last_observation = proposal.observation;
            state.pending_actions = proposal.actions.into();
            state.last_safety_verdict = proposal.safety;

            if let Some(progress) = self.gate(state).await {
                return progress;
            }
            if state.pending_actions.is_empty() {
                return self.finish(state, RunStatus::Completed, None).await;
            }
            if let Some(progress) = self.act(state).await {
                return progress;
            }
            state.gate.reset();
        }
    }

    /// Consume the turn's verdict. Returns `Some` when the run must stop here.
    async fn gate(&mut self, state: &mut SessionState) -> Option<Progress> {
        let verdict = state.last_safety_verdict.take();
        match state.gate.inspect(verdict.as_ref()) {
            GateState::Denied => {
                let reason = denial_reason(state);
                warn!(run_id = %state.run_id, %reason, "planner blocked the batch");
                Some(self.finish(state, RunStatus::Denied, Some(reason)).await)
            }
            GateState::AwaitingApproval if state.pending_actions.is_empty() => {
                // nothing to approve; the empty batch ends the run normally
                state.gate.reset();
                None
            }
            GateState::AwaitingApproval => {
                let verdict = verdict.unwrap_or(SafetyVerdict {
                    risk_level: RiskLevel::RequireConfirmation,
                    reason: None,
                });
                info!(
                    run_id = %state.run_id,
                    reason = verdict.reason_or_default(),
                    "batch requires confirmation"
                );
                let pending: Vec<Action> = state.pending_actions.iter().cloned().collect();
                let answer = tokio::select! {
                    _ = self.cancel.cancelled() => None,
                    d = self.approver.decide(&state.run_id, &verdict, &pending) => Some(d),
                };
                let Some(answer) = answer else {
                    info!(run_id = %state.run_id, "cancelled while awaiting approval");
                    return Some(
                        self.finish(
                            state,
                            RunStatus::Denied,
                            Some("cancelled while awaiting approval".into()),
                        )
                        .await,
                    );
                };
                match answer {
                    Some(decision) => {
                        if let Err(e) = state.gate.decide(decision) {
                            return Some(
                                self.finish(state, RunStatus::Error, Some(e.to_string())).await,
                            );
                        }
                        if decision == Decision::Deny {
                            let reason = denial_reason(state);
                            return Some(self.finish(state, RunStatus::Denied, Some(reason)).await);
                        }
                        info!(run_id = %state.run_id, "batch approved");
                        None
                    }
                    None => {
                        state.begin_suspension(Utc::now());
                        info!(run_id = %state.run_id, "run suspended awaiting approval");
                        Some(Progress::Suspended)
                    }
                }
            }
            GateState::Clear | GateState::Approved => None,
        }
    }

    /// Drain the pending batch in order. Returns `Some` when the run stops.
    async fn act(&mut self, state: &mut SessionState) -> Option<Progress> {
        while let Some(action) = state.pending_actions.pop_front() {
            if self.cancel.is_cancelled() {
                return Some(
                    self.finish(state, RunStatus::Error, Some("cancelled".into()))
                        .await,
                );
            }
            if state.remaining(Utc::now()).is_none() {
                let msg = format!("timeout of {}s exceeded", state.limits.timeout_seconds);
                return Some(self.finish(state, RunStatus::BudgetExceeded, Some(msg)).await);
            }

            // denormalize against the capture taken right before this action
            let (width, height) = match &state.last_screenshot {
                Some(s) => (s.width, s.height),
                None => (0, 0),
            };
            let step = state.step_count + 1;
            info!(run_id = %state.run_id, step, action = %action, "executing action");
            let result = self.execute(&action, width, height).await;
            if let Err(e) = &result {
                warn!(run_id = %state.run_id, step, error = %e, "action failed");
            }
            state.step_count = step;

            if !self.cfg.settle_delay.is_zero() {
                tokio::time::sleep(self.cfg.settle_delay).await;
            }
            let shot = match self.display.capture().await {
                Ok(s) => s,
                Err(e) => {
                    return Some(
                        self.finish(state, RunStatus::Error, Some(format!("capture after action: {e}")))
                            .await,
                    )
                }
            };

            let outcome = ActionOutcome {
                action,
                success: result.is_ok(),
                error: result.err().map(|e| e.to_string()),
                screenshot_after: shot,
            };
            state.history.push(self.planner.build_outcome_entry(step, &outcome));
            if let Err(e) = self
                .recorder
                .record_step(&state.run_id, step, &outcome, state.last_observation.as_deref())
                .await
            {
                warn!(run_id = %state.run_id, step, error = %e, "recorder step failed");
            }
            state.last_screenshot = Some(outcome.screenshot_after);

            if state.step_count >= state.limits.step_limit {
                let msg = format!("step limit of {} reached", state.limits.step_limit);
                return Some(self.finish(state, RunStatus::BudgetExceeded, Some(msg)).await);
            }
        }
        None
    }

    async fn execute(&mut self, action: &Action, width: u32, height: u32) -> Result<(), BackendError> {
        let px = |p: &NormPoint| to_pixels(*p, width, height);
        match action {
            Action::Click { at } => self.display.click(px(at), MouseButton::Left).await,
            Action::DoubleClick { at } => self.display.double_click(px(at)).await,
            Action::Hover { at } => self.display.pointer_move(px(at)).await,
            Action::TypeText {
                at,
                text,
                press_enter,
                clear_before_typing,
            } => {
                if let Some(at) = at {
                    self.display.click(px(at), MouseButton::Left).await?;
                }
                self.display
                    .type_text(text, *press_enter, *clear_before_typing)
                    .await
            }
            Action::KeyCombo { keys } => self.display.key_combo(keys).await,
            Action::ScrollDocument {
                direction,
                magnitude,
            } => self.display.scroll(*direction, *magnitude).await,
            Action::ScrollAt {
                at,
                direction,
                magnitude,
            } => {
                self.display.pointer_move(px(at)).await?;
                self.display.scroll(*direction, *magnitude).await
            }
            Action::Drag { from, to } => self.display.drag(px(from), px(to)).await,
            Action::Wait => {
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.cfg.wait_duration) => {}
                }
                Ok(())
            }
            Action::Noop { name } => {
                debug!(action = %name, "no-op action");
                Ok(())
            }
            Action::Rejected { name, reason } => Err(BackendError::new(name.clone(), reason)),
        }
    }

    async fn finish(
        &mut self,
        state: &mut SessionState,
        status: RunStatus,
        error: Option<String>,
    ) -> Progress {
        state.conclude(status, error);
        info!(
            run_id = %state.run_id,
            status = ?status,
            steps = state.step_count,
            error = ?state.last_error,
            "run finished"
        );
        if let Err(e) = self.recorder.finalize(state).await {
            warn!(run_id = %state.run_id, error = %e, "recorder finalize failed");
        }
        Progress::Finished(status)
    }
}

/// Record a reviewer decision on a suspended run.
pub fn apply_decision(state: &mut SessionState, decision: Decision) -> Result<GateState, AgentError> {
    if !state.is_suspended() {
        return Err(AgentError::InvalidState(format!(
            "run {} is {:?}, not awaiting approval",
            state.run_id,
            state.phase()
        )));
    }
    let gate = state
        .gate
        .decide(decision)
        .map_err(|e| AgentError::InvalidState(e.to_string()))?;
    state.end_suspension(Utc::now());
    info!(run_id = %state.run_id, ?decision, "approval decision recorded");
    Ok(gate)
}

/// The terminal error text for a denied batch.
pub fn denial_reason(state: &SessionState) -> String {
    match state.gate.reason() {
        Some(reason) => format!("denied: {reason}"),
        None => "denied".to_string(),
    }
}

// ========================= Defaults =========================

pub struct NullRecorder;

#[async_trait]
impl RunRecorder for NullRecorder {
    async fn begin(&self, _state: &SessionState, _initial: &Screenshot) -> Result<(), RecorderError> {
        Ok(())
    }

    async fn record_step(
        &self,
        _run_id: &str,
        _step: usize,
        _outcome: &ActionOutcome,
        _observation: Option<&str>,
    ) -> Result<(), RecorderError> {
        Ok(())
    }

    async fn finalize(&self, _state: &SessionState) -> Result<(), RecorderError> {
        Ok(())
    }
}

/// Never decides; every gated batch suspends the run for an external decision.
#[derive(Clone, Copy, Debug, Default)]
pub struct DeferredApprover;

#[async_trait]
impl Approver for DeferredApprover {
    async fn decide(&self, _run_id: &str, _verdict: &SafetyVerdict, _pending: &[Action]) -> Option<Decision> {
        None
    }
}

/// Approves everything. Used when HITL is switched off for a run.
#[derive(Clone, Copy, Debug, Default)]
pub struct AutoApprover;

#[async_trait]
impl Approver for AutoApprover {
    async fn decide(&self, run_id: &str, verdict: &SafetyVerdict, pending: &[Action]) -> Option<Decision> {
        warn!(
            run_id,
            reason = verdict.reason_or_default(),
            actions = pending.len(),
            "HITL disabled, auto-approving gated batch"
        );
        Some(Decision::Approve)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn state() -> SessionState {
        SessionState::new("r1", "desk", "open the settings", RunLimits::default())
    }

    #[test]
    fn elapsed_excludes_suspension() {
        let mut s = state();
        let t0 = s.started_at;
        s.begin_suspension(t0 + ChronoDuration::seconds(10));
        assert_eq!(s.elapsed(t0 + ChronoDuration::seconds(100)), Duration::from_secs(10));
        s.end_suspension(t0 + ChronoDuration::seconds(100));
        assert_eq!(s.elapsed(t0 + ChronoDuration::seconds(130)), Duration::from_secs(40));
    }

    #[test]
    fn remaining_runs_out() {
        let mut s = state();
        s.limits.timeout_seconds = 5;
        let t0 = s.started_at;
        assert_eq!(s.remaining(t0 + ChronoDuration::seconds(2)), Some(Duration::from_secs(3)));
        assert_eq!(s.remaining(t0 + ChronoDuration::seconds(5)), None);
    }

    #[test]
    fn run_id_shape() {
        let id = new_run_id();
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 8);
        assert_eq!(parts[1].len(), 6);
        assert_eq!(parts[2].len(), 8);
        assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn outcome_entry_drops_image_bytes() {
        let shot = Screenshot::new(vec![1, 2, 3], 10, 20);
        let outcome = ActionOutcome {
            action: Action::Wait,
            success: true,
            error: None,
            screenshot_after: shot.clone(),
        };
        let entry = HistoryEntry::from_outcome(1, &outcome);
        let json = serde_json::to_string(&entry).unwrap();
        assert!(!json.contains(&shot.to_base64()));
        assert!(json.contains(&shot.id));
    }

    #[test]
    fn apply_decision_requires_suspension() {
        let mut s = state();
        let before = serde_json::to_value(&s).unwrap();
        let err = apply_decision(&mut s, Decision::Approve).unwrap_err();
        assert!(matches!(err, AgentError::InvalidState(_)));
        assert_eq!(serde_json::to_value(&s).unwrap(), before);
    }

    #[test]
    fn screenshot_serializes_png_as_base64() {
        let shot = Screenshot::new(vec![0x89, b'P', b'N', b'G'], 1, 1);
        let value = serde_json::to_value(&shot).unwrap();
        assert_eq!(value["png"], "iVBORw==");
        let back: Screenshot = serde_json::from_value(value).unwrap();
        assert_eq!(back.png, shot.png);
    }

    #[test]
    fn action_display_is_call_like() {
        let a = Action::Drag {
            from: NormPoint { x: 1, y: 2 },
            to: NormPoint { x: 3, y: 4 },
        };
        assert_eq!(
            a.to_string(),
            "drag_and_drop(x=1, y=2, destination_x=3, destination_y=4)"
        );
        assert_eq!(Action::Wait.name(), "wait_5_seconds");
    }
}
