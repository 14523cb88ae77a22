#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use vnc_agent::agent::{
    Action, AgentConfig, Approver, BackendError, ConnectionError, Connector, DisplayController,
    HistoryEntry, MouseButton, Planner, PlannerError, Proposal, ScrollDirection, Screenshot,
};
use vnc_agent::coords::{NormPoint, PixelPoint};
use vnc_agent::safety::{Decision, RiskLevel, SafetyVerdict};

pub fn test_config() -> AgentConfig {
    AgentConfig {
        wait_duration: Duration::ZERO,
        settle_delay: Duration::ZERO,
    }
}

pub fn click(x: u16, y: u16) -> Action {
    Action::Click {
        at: NormPoint { x, y },
    }
}

pub fn proposal(actions: Vec<Action>) -> Proposal {
    Proposal {
        observation: Some(format!("{} action(s) planned", actions.len())),
        actions,
        safety: None,
    }
}

pub fn gated(actions: Vec<Action>, level: RiskLevel, reason: &str) -> Proposal {
    Proposal {
        safety: Some(SafetyVerdict::new(level, reason)),
        ..proposal(actions)
    }
}

// ========================= Display =========================

/// Every primitive the fake display was asked to perform, in pixels.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Move(PixelPoint),
    Click(PixelPoint, MouseButton),
    DoubleClick(PixelPoint),
    Drag(PixelPoint, PixelPoint),
    Type {
        text: String,
        press_enter: bool,
        clear_first: bool,
    },
    Keys(String),
    Scroll(ScrollDirection, u32),
}

#[derive(Default)]
struct DisplayInner {
    calls: Vec<Call>,
    captures: Vec<Screenshot>,
    sizes: VecDeque<(u32, u32)>,
    size: (u32, u32),
    fail_primitive: Option<&'static str>,
    fail_capture_after: Option<usize>,
    closed: usize,
}

/// In-memory display. Clones share one log so a test can inspect it after
/// the display has been moved into an agent.
#[derive(Clone)]
pub struct FakeDisplay {
    inner: Arc<Mutex<DisplayInner>>,
}

impl FakeDisplay {
    pub fn new(width: u32, height: u32) -> Self {
        let inner = DisplayInner {
            size: (width, height),
            ..Default::default()
        };
        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    /// Sizes reported by successive captures; the last one sticks.
    pub fn with_sizes(self, sizes: &[(u32, u32)]) -> Self {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.sizes = sizes.iter().copied().collect();
        }
        self
    }

    /// Make one primitive (`"click"`, `"key_combo"`, ...) always fail.
    pub fn failing(self, primitive: &'static str) -> Self {
        self.inner.lock().unwrap().fail_primitive = Some(primitive);
        self
    }

    /// Let `n` captures succeed, then fail every capture after that.
    pub fn capture_fails_after(self, n: usize) -> Self {
        self.inner.lock().unwrap().fail_capture_after = Some(n);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn captures(&self) -> Vec<Screenshot> {
        self.inner.lock().unwrap().captures.clone()
    }

    pub fn closed(&self) -> usize {
        self.inner.lock().unwrap().closed
    }

    fn record(&self, primitive: &'static str, call: Call) -> Result<(), BackendError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_primitive == Some(primitive) {
            return Err(BackendError::new(primitive, "simulated failure"));
        }
        inner.calls.push(call);
        Ok(())
    }
}

#[async_trait]
impl DisplayController for FakeDisplay {
    async fn capture(&mut self) -> Result<Screenshot, BackendError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(limit) = inner.fail_capture_after {
            if inner.captures.len() >= limit {
                return Err(BackendError::new("capture", "display went away"));
            }
        }
        if let Some(next) = inner.sizes.pop_front() {
            inner.size = next;
        }
        let (w, h) = inner.size;
        let shot = Screenshot::new(vec![inner.captures.len() as u8], w, h);
        inner.captures.push(shot.clone());
        Ok(shot)
    }

    async fn pointer_move(&mut self, at: PixelPoint) -> Result<(), BackendError> {
        self.record("pointer_move", Call::Move(at))
    }

    async fn click(&mut self, at: PixelPoint, button: MouseButton) -> Result<(), BackendError> {
        self.record("click", Call::Click(at, button))
    }

    async fn double_click(&mut self, at: PixelPoint) -> Result<(), BackendError> {
        self.record("double_click", Call::DoubleClick(at))
    }

    async fn drag(&mut self, from: PixelPoint, to: PixelPoint) -> Result<(), BackendError> {
        self.record("drag", Call::Drag(from, to))
    }

    async fn type_text(
        &mut self,
        text: &str,
        press_enter: bool,
        clear_first: bool,
    ) -> Result<(), BackendError> {
        self.record(
            "type_text",
            Call::Type {
                text: text.to_string(),
                press_enter,
                clear_first,
            },
        )
    }

    async fn key_combo(&mut self, keys: &str) -> Result<(), BackendError> {
        self.record("key_combo", Call::Keys(keys.to_string()))
    }

    async fn scroll(
        &mut self,
        direction: ScrollDirection,
        magnitude: u32,
    ) -> Result<(), BackendError> {
        self.record("scroll", Call::Scroll(direction, magnitude))
    }

    async fn close(&mut self) {
        self.inner.lock().unwrap().closed += 1;
    }
}

/// Hands out clones of one fake display and remembers who asked.
#[derive(Clone)]
pub struct FakeConnector {
    pub display: FakeDisplay,
    connections: Arc<Mutex<Vec<(String, Option<String>)>>>,
    refuse: bool,
}

impl FakeConnector {
    pub fn new(display: FakeDisplay) -> Self {
        Self {
            display,
            connections: Arc::new(Mutex::new(Vec::new())),
            refuse: false,
        }
    }

    pub fn refusing(mut self) -> Self {
        self.refuse = true;
        self
    }

    pub fn connections(&self) -> Vec<(String, Option<String>)> {
        self.connections.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(
        &self,
        address: &str,
        password: Option<&str>,
    ) -> Result<Box<dyn DisplayController>, ConnectionError> {
        self.connections
            .lock()
            .unwrap()
            .push((address.to_string(), password.map(str::to_string)));
        if self.refuse {
            return Err(ConnectionError::Unreachable {
                address: address.to_string(),
                cause: "connection refused".into(),
            });
        }
        Ok(Box::new(self.display.clone()))
    }
}

// ========================= Planner =========================

/// What the planner was shown on one turn.
#[derive(Clone, Debug)]
pub struct Seen {
    pub history: Vec<HistoryEntry>,
    pub screenshot_id: String,
    pub screenshot_size: (u32, u32),
}

/// Replays a fixed script of proposals. An exhausted script proposes
/// nothing, which completes the run.
#[derive(Clone, Default)]
pub struct ScriptedPlanner {
    script: Arc<Mutex<VecDeque<Result<Proposal, String>>>>,
    seen: Arc<Mutex<Vec<Seen>>>,
}

impl ScriptedPlanner {
    pub fn new(script: Vec<Proposal>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into_iter().map(Ok).collect())),
            seen: Arc::default(),
        }
    }

    /// Fail the next turn after the scripted proposals run out.
    pub fn then_fail(self, message: &str) -> Self {
        self.script.lock().unwrap().push_back(Err(message.to_string()));
        self
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn propose(
        &self,
        _task: &str,
        history: &[HistoryEntry],
        screenshot: &Screenshot,
    ) -> Result<Proposal, PlannerError> {
        self.seen.lock().unwrap().push(Seen {
            history: history.to_vec(),
            screenshot_id: screenshot.id.clone(),
            screenshot_size: (screenshot.width, screenshot.height),
        });
        match self.script.lock().unwrap().pop_front() {
            Some(Ok(p)) => Ok(p),
            Some(Err(message)) => Err(PlannerError::Transport(message)),
            None => Ok(Proposal::default()),
        }
    }
}

// ========================= Approver =========================

/// Gives the same answer every time and counts how often it was asked.
pub struct FixedApprover {
    decision: Option<Decision>,
    asked: Mutex<usize>,
}

impl FixedApprover {
    pub fn new(decision: Option<Decision>) -> Self {
        Self {
            decision,
            asked: Mutex::new(0),
        }
    }

    pub fn asked(&self) -> usize {
        *self.asked.lock().unwrap()
    }
}

#[async_trait]
impl Approver for FixedApprover {
    async fn decide(&self, _run_id: &str, _verdict: &SafetyVerdict, _pending: &[Action]) -> Option<Decision> {
        *self.asked.lock().unwrap() += 1;
        self.decision
    }
}

/// Answers after a delay, like a person reading the prompt.
pub struct SlowApprover {
    pub delay: Duration,
    pub decision: Decision,
}

#[async_trait]
impl Approver for SlowApprover {
    async fn decide(&self, _run_id: &str, _verdict: &SafetyVerdict, _pending: &[Action]) -> Option<Decision> {
        tokio::time::sleep(self.delay).await;
        Some(self.decision)
    }
}
