//! Invocation and approval surfaces around the control loop.
//!
//! `execute` resolves the session handle, connects, and drives one run. A run
//! that stops at the safety gate is parked in the [`SessionStore`] and can be
//! resumed later, from this process or another one, with `resume`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::{
    apply_decision, denial_reason, new_run_id, Agent, AgentConfig, AgentError, Approver,
    AutoApprover, Connector, DeferredApprover, DisplayController, NullRecorder, Planner, Progress,
    RunLimits, RunRecorder, RunStatus, RunSummary, SessionState,
};
use crate::credentials::{lookup, CredentialStore};
use crate::safety::Decision;
use crate::store::SessionStore;

fn default_true() -> bool {
    true
}

/// `{ session_handle, task, step_limit, timeout_seconds, hitl_enabled }`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub session_handle: String,
    pub task: String,
    #[serde(default)]
    pub step_limit: Option<usize>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default = "default_true")]
    pub hitl_enabled: bool,
}

impl ExecuteRequest {
    pub fn new(session_handle: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            session_handle: session_handle.into(),
            task: task.into(),
            step_limit: None,
            timeout_seconds: None,
            hitl_enabled: true,
        }
    }

    fn limits(&self, defaults: RunLimits) -> RunLimits {
        RunLimits {
            step_limit: self.step_limit.unwrap_or(defaults.step_limit),
            timeout_seconds: self.timeout_seconds.unwrap_or(defaults.timeout_seconds),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResumeRequest {
    pub run_id: String,
    pub decision: Decision,
}

pub struct AgentService {
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialStore>,
    planner: Arc<dyn Planner>,
    store: Arc<dyn SessionStore>,
    recorder: Arc<dyn RunRecorder>,
    approver: Arc<dyn Approver>,
    limits: RunLimits,
    cfg: AgentConfig,
    active: Mutex<HashMap<String, CancellationToken>>,
}

impl AgentService {
    pub fn new(
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialStore>,
        planner: Arc<dyn Planner>,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            connector,
            credentials,
            planner,
            store,
            recorder: Arc::new(NullRecorder),
            approver: Arc::new(DeferredApprover),
            limits: RunLimits::default(),
            cfg: AgentConfig::default(),
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn RunRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    /// Decision source for gated batches when HITL is on. Defaults to
    /// suspending every gated run.
    pub fn with_approver(mut self, approver: Arc<dyn Approver>) -> Self {
        self.approver = approver;
        self
    }

    pub fn with_limits(mut self, limits: RunLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_config(mut self, cfg: AgentConfig) -> Self {
        self.cfg = cfg;
        self
    }

    /// Start a run and drive it until it finishes or suspends.
    ///
    /// Credential and connection failures happen before any run exists and
    /// are returned as errors. Everything after that is reported in the
    /// summary.
    pub async fn execute(&self, req: ExecuteRequest) -> Result<RunSummary, AgentError> {
        self.execute_as(new_run_id(), req).await
    }

    /// `execute` under a run id picked by the caller, so it can follow the
    /// run (progress, cancellation) before the summary comes back.
    pub async fn execute_as(
        &self,
        run_id: String,
        req: ExecuteRequest,
    ) -> Result<RunSummary, AgentError> {
        if self.store.load(&run_id).await?.is_some() {
            return Err(AgentError::InvalidState(format!("run {run_id} already exists")));
        }
        let token = self.register(&run_id).await?;
        let result = self.execute_registered(run_id.clone(), req, token).await;
        self.unregister(&run_id).await;
        result
    }

    async fn execute_registered(
        &self,
        run_id: String,
        req: ExecuteRequest,
        token: CancellationToken,
    ) -> Result<RunSummary, AgentError> {
        let creds = lookup(self.credentials.as_ref(), &req.session_handle).await?;
        let display = self
            .connector
            .connect(&creds.address, creds.password.as_deref())
            .await?;

        let mut state = SessionState::new(
            run_id.clone(),
            req.session_handle.clone(),
            req.task.clone(),
            req.limits(self.limits),
        );
        let approver: Arc<dyn Approver> = if req.hitl_enabled {
            self.approver.clone()
        } else {
            Arc::new(AutoApprover)
        };
        info!(
            run_id = %run_id,
            handle = %req.session_handle,
            step_limit = state.limits.step_limit,
            timeout_seconds = state.limits.timeout_seconds,
            hitl = req.hitl_enabled,
            "executing task"
        );

        let progress = self.drive(display, approver, token, &mut state, None).await?;
        self.settle(&state, progress).await?;
        Ok(state.summary())
    }

    /// Apply an approve/deny decision to a run parked at the gate.
    ///
    /// Fails with `InvalidState` when the run is unknown, still executing, or
    /// not awaiting approval; the stored state is left as it was.
    pub async fn resume(&self, req: ResumeRequest) -> Result<RunSummary, AgentError> {
        let token = self.register(&req.run_id).await?;
        let result = self.resume_registered(&req, token).await;
        self.unregister(&req.run_id).await;
        result
    }

    async fn resume_registered(
        &self,
        req: &ResumeRequest,
        token: CancellationToken,
    ) -> Result<RunSummary, AgentError> {
        let mut state = self.load_suspended(&req.run_id).await?;

        if req.decision == Decision::Deny {
            apply_decision(&mut state, Decision::Deny)?;
            let reason = denial_reason(&state);
            state.conclude(RunStatus::Denied, Some(reason));
            self.finalize_parked(&state).await;
            return Ok(state.summary());
        }

        let creds = lookup(self.credentials.as_ref(), &state.session_handle).await?;
        let display = self
            .connector
            .connect(&creds.address, creds.password.as_deref())
            .await?;
        let progress = self
            .drive(display, self.approver.clone(), token, &mut state, Some(req.decision))
            .await?;
        self.settle(&state, progress).await?;
        Ok(state.summary())
    }

    /// Stop a run.
    ///
    /// An executing run is signalled and its summary comes back from the
    /// `execute` call driving it, so this returns `None`. It halts between
    /// actions with outcome `error`, or as `denied` if it was waiting on the
    /// approver. A parked run resolves as `denied` here.
    pub async fn cancel(&self, run_id: &str) -> Result<Option<RunSummary>, AgentError> {
        if let Some(token) = self.active.lock().await.get(run_id) {
            info!(run_id, "cancelling active run");
            token.cancel();
            return Ok(None);
        }
        let mut state = self.load_suspended(run_id).await?;
        state.conclude(
            RunStatus::Denied,
            Some("cancelled while awaiting approval".into()),
        );
        info!(run_id, "suspended run cancelled");
        self.finalize_parked(&state).await;
        Ok(Some(state.summary()))
    }

    /// Ids of the runs this service is executing right now.
    pub async fn active(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.active.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Summaries of every run parked at the gate.
    pub async fn pending(&self) -> Result<Vec<RunSummary>, AgentError> {
        let mut out = Vec::new();
        for run_id in self.store.list().await? {
            if let Some(state) = self.store.load(&run_id).await? {
                if state.is_suspended() {
                    out.push(state.summary());
                }
            }
        }
        Ok(out)
    }

    async fn load_suspended(&self, run_id: &str) -> Result<SessionState, AgentError> {
        let state = self
            .store
            .load(run_id)
            .await?
            .ok_or_else(|| AgentError::InvalidState(format!("no suspended run {run_id}")))?;
        if !state.is_suspended() {
            return Err(AgentError::InvalidState(format!(
                "run {run_id} is {:?}, not awaiting approval",
                state.phase()
            )));
        }
        Ok(state)
    }

    async fn drive(
        &self,
        display: Box<dyn DisplayController>,
        approver: Arc<dyn Approver>,
        token: CancellationToken,
        state: &mut SessionState,
        decision: Option<Decision>,
    ) -> Result<Progress, AgentError> {
        let mut agent = Agent::new(display, self.planner.clone(), self.cfg.clone())
            .with_recorder(self.recorder.clone())
            .with_approver(approver)
            .with_cancellation(token);
        let progress = match decision {
            Some(decision) => agent.resume(state, decision).await,
            None => Ok(agent.run(state).await),
        };
        let mut display = agent.into_display();
        display.close().await;
        progress
    }

    /// Persist a suspended run, forget a finished one.
    async fn settle(&self, state: &SessionState, progress: Progress) -> Result<(), AgentError> {
        match progress {
            Progress::Suspended => {
                self.store.save(state).await?;
                info!(run_id = %state.run_id, "run parked awaiting approval");
            }
            Progress::Finished(status) => {
                info!(run_id = %state.run_id, ?status, steps = state.step_count, "run concluded");
                self.store.delete(&state.run_id).await?;
            }
        }
        Ok(())
    }

    async fn finalize_parked(&self, state: &SessionState) {
        if let Err(e) = self.recorder.finalize(state).await {
            warn!(run_id = %state.run_id, error = %e, "recorder finalize failed");
        }
        if let Err(e) = self.store.delete(&state.run_id).await {
            warn!(run_id = %state.run_id, error = %e, "failed to drop parked session");
        }
    }

    async fn register(&self, run_id: &str) -> Result<CancellationToken, AgentError> {
        let mut active = self.active.lock().await;
        if active.contains_key(run_id) {
            return Err(AgentError::InvalidState(format!("run {run_id} is already executing")));
        }
        let token = CancellationToken::new();
        active.insert(run_id.to_string(), token.clone());
        Ok(token)
    }

    async fn unregister(&self, run_id: &str) {
        self.active.lock().await.remove(run_id);
    }
}
