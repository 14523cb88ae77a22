//! Model Context Protocol server over stdio.
//!
//! Messages are newline-delimited JSON-RPC 2.0. Tool calls run as their own
//! tasks so the read loop keeps draining elicitation replies and
//! cancellations while a run is on screen.
//!
//! | Tool                | Arguments                                   |
//! |---------------------|---------------------------------------------|
//! | `execute_vnc_task`  | `hostname`, `task`, `step_limit`, `timeout`, `hitl` |
//! | `resume_vnc_task`   | `run_id`, `decision` (`approve` / `deny`)   |
//! | `cancel_vnc_task`   | `run_id`                                    |
//! | `list_pending_runs` | none                                        |
//!
//! Progress goes out as `notifications/progress` when the call carries a
//! `progressToken`, and as `notifications/message` log lines either way.
//! Gated batches are put to the client through `elicitation/create`; a client
//! without that capability gets the run parked for `resume_vnc_task`.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::agent::{
    new_run_id, Action, ActionOutcome, AgentError, Approver, RecorderError, RunRecorder,
    RunSummary, Screenshot, SessionState,
};
use crate::planner::prepare_screenshot;
use crate::safety::{Decision, SafetyVerdict};
use crate::service::{AgentService, ExecuteRequest, ResumeRequest};

pub const PROTOCOL_VERSION: &str = "2025-06-18";
pub const SERVER_NAME: &str = "vnc-agent";
/// Width of the screenshots streamed back with each step.
pub const THUMBNAIL_WIDTH: u32 = 256;
const OBSERVATION_PREVIEW: usize = 200;

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

// ========================= JSON-RPC =========================

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum RequestId {
    Num(i64),
    Str(String),
    Null,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

/// Any inbound line: request, notification, or a reply to one of ours.
#[derive(Deserialize, Debug)]
struct Incoming {
    #[serde(default)]
    id: Option<RequestId>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

/// The client as seen from the server: a line sink plus the replies we are
/// still waiting on.
struct Peer {
    out: mpsc::UnboundedSender<String>,
    waiting: Mutex<HashMap<i64, oneshot::Sender<Result<Value, RpcError>>>>,
    next_id: AtomicI64,
    elicitation: AtomicBool,
}

impl Peer {
    fn new(out: mpsc::UnboundedSender<String>) -> Self {
        Self {
            out,
            waiting: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            elicitation: AtomicBool::new(false),
        }
    }

    fn send(&self, msg: Value) {
        if self.out.send(msg.to_string()).is_err() {
            debug!("client gone, dropping outbound message");
        }
    }

    fn respond(&self, id: RequestId, result: Result<Value, RpcError>) {
        let msg = match result {
            Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
            Err(error) => json!({ "jsonrpc": "2.0", "id": id, "error": error }),
        };
        self.send(msg);
    }

    fn notify(&self, method: &str, params: Value) {
        self.send(json!({ "jsonrpc": "2.0", "method": method, "params": params }));
    }

    fn log(&self, level: &str, data: Value) {
        self.notify(
            "notifications/message",
            json!({ "level": level, "logger": SERVER_NAME, "data": data }),
        );
    }

    fn supports_elicitation(&self) -> bool {
        self.elicitation.load(Ordering::SeqCst)
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.waiting.lock().await.insert(id, tx);
        self.send(json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params }));
        rx.await
            .unwrap_or_else(|_| Err(RpcError::new(INTERNAL_ERROR, "connection closed")))
    }

    async fn complete(&self, id: RequestId, result: Result<Value, RpcError>) {
        let RequestId::Num(n) = id else {
            warn!(?id, "reply to a request we never sent");
            return;
        };
        match self.waiting.lock().await.remove(&n) {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => warn!(id = n, "reply to a request we never sent"),
        }
    }

    /// Fail every outstanding request.
    async fn abandon(&self) {
        self.waiting.lock().await.clear();
    }
}

// ========================= Run events =========================

/// What a subscribed run reports while it executes.
#[derive(Clone, Debug, PartialEq)]
pub enum RunEvent {
    Started {
        task: String,
        step_limit: usize,
    },
    Step {
        step: usize,
        call: String,
        success: bool,
        error: Option<String>,
        observation: Option<String>,
        /// Downscaled post-action screenshot, base64 PNG.
        thumbnail: Option<String>,
    },
}

/// Forwards to an inner recorder and fans step events out to whoever is
/// following the run.
pub struct StreamingRecorder {
    inner: Arc<dyn RunRecorder>,
    subscribers: Mutex<HashMap<String, mpsc::UnboundedSender<RunEvent>>>,
}

impl StreamingRecorder {
    pub fn new(inner: Arc<dyn RunRecorder>) -> Self {
        Self {
            inner,
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    pub async fn subscribe(&self, run_id: &str) -> mpsc::UnboundedReceiver<RunEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().await.insert(run_id.to_string(), tx);
        rx
    }

    pub async fn unsubscribe(&self, run_id: &str) {
        self.subscribers.lock().await.remove(run_id);
    }

    async fn emit(&self, run_id: &str, event: RunEvent) {
        if let Some(tx) = self.subscribers.lock().await.get(run_id) {
            let _ = tx.send(event);
        }
    }
}

fn thumbnail(shot: &Screenshot) -> Option<String> {
    match prepare_screenshot(shot, THUMBNAIL_WIDTH) {
        Ok(png) => Some(B64.encode(png)),
        Err(e) => {
            debug!(error = %e, "no thumbnail for step");
            None
        }
    }
}

#[async_trait]
impl RunRecorder for StreamingRecorder {
    async fn begin(&self, state: &SessionState, initial: &Screenshot) -> Result<(), RecorderError> {
        let result = self.inner.begin(state, initial).await;
        self.emit(
            &state.run_id,
            RunEvent::Started {
                task: state.task.clone(),
                step_limit: state.limits.step_limit,
            },
        )
        .await;
        result
    }

    async fn record_step(
        &self,
        run_id: &str,
        step: usize,
        outcome: &ActionOutcome,
        observation: Option<&str>,
    ) -> Result<(), RecorderError> {
        let result = self
            .inner
            .record_step(run_id, step, outcome, observation)
            .await;
        if !self.subscribers.lock().await.contains_key(run_id) {
            return result;
        }
        self.emit(
            run_id,
            RunEvent::Step {
                step,
                call: outcome.action.to_string(),
                success: outcome.success,
                error: outcome.error.clone(),
                observation: observation.map(str::to_string),
                thumbnail: thumbnail(&outcome.screenshot_after),
            },
        )
        .await;
        result
    }

    async fn finalize(&self, state: &SessionState) -> Result<(), RecorderError> {
        self.inner.finalize(state).await
    }
}

/// Turns run events into progress and log notifications for one tool call.
struct Relay {
    peer: Arc<Peer>,
    run_id: String,
    progress_token: Option<Value>,
    total: Option<usize>,
    last_observation: Option<String>,
}

impl Relay {
    fn progress(&self, progress: usize, message: String) {
        let Some(token) = &self.progress_token else {
            return;
        };
        let mut params = json!({
            "progressToken": token,
            "progress": progress,
            "message": message,
        });
        if let Some(total) = self.total {
            params["total"] = json!(total);
        }
        self.peer.notify("notifications/progress", params);
    }

    fn forward(&mut self, event: RunEvent) {
        match event {
            RunEvent::Started { task, step_limit } => {
                self.total = Some(step_limit);
                self.peer
                    .log("info", json!(format!("[{}] Starting VNC task: {task}", self.run_id)));
                self.progress(0, "Analyzing screenshot...".into());
            }
            RunEvent::Step {
                step,
                call,
                success,
                error,
                observation,
                thumbnail,
            } => {
                if let Some(obs) = observation {
                    if self.last_observation.as_deref() != Some(obs.as_str()) {
                        self.peer.log(
                            "info",
                            json!(format!("[Step {step}] Model observes: {}", preview(&obs))),
                        );
                        self.last_observation = Some(obs);
                    }
                }
                let line = match (&error, success) {
                    (None, true) => format!("[Step {step}] ✓ Executed: {call}"),
                    (Some(e), _) => format!("[Step {step}] ✗ Executed: {call} ({e})"),
                    (None, false) => format!("[Step {step}] ✗ Executed: {call}"),
                };
                self.peer.log(if success { "info" } else { "warning" }, json!(line));
                if let Some(data) = thumbnail {
                    self.peer.log(
                        "debug",
                        json!({
                            "run_id": self.run_id,
                            "step": step,
                            "screenshot": { "mimeType": "image/png", "data": data },
                        }),
                    );
                }
                self.progress(step, format!("Step {step}: {call}"));
            }
        }
    }
}

fn preview(text: &str) -> String {
    if text.chars().count() <= OBSERVATION_PREVIEW {
        return text.to_string();
    }
    let cut: String = text.chars().take(OBSERVATION_PREVIEW).collect();
    format!("{cut}...")
}

// ========================= Approval =========================

/// Puts gated batches to the client through `elicitation/create`.
struct ElicitingApprover {
    peer: Arc<Peer>,
}

#[async_trait]
impl Approver for ElicitingApprover {
    async fn decide(&self, run_id: &str, verdict: &SafetyVerdict, pending: &[Action]) -> Option<Decision> {
        let reason = verdict.reason_or_default();
        let actions = pending.iter().map(|a| a.name()).collect::<Vec<_>>().join(", ");
        self.peer.log(
            "warning",
            json!(format!("[{run_id}] Safety confirmation required: {reason}. Proposed actions: {actions}")),
        );
        if !self.peer.supports_elicitation() {
            self.peer.log(
                "warning",
                json!(format!("[{run_id}] client cannot be asked; run parked for resume_vnc_task")),
            );
            return None;
        }

        let params = json!({
            "message": format!(
                "Safety confirmation required: {reason}\nProposed actions: {actions}\nApprove execution?"
            ),
            "requestedSchema": {
                "type": "object",
                "properties": {
                    "approve": {
                        "type": "boolean",
                        "title": "Approve",
                        "description": "Run the proposed actions",
                        "default": true,
                    }
                },
                "required": ["approve"],
            },
        });
        let decision = match self.peer.request("elicitation/create", params).await {
            Ok(reply) => match reply.get("action").and_then(Value::as_str) {
                Some("accept") => {
                    let approve = reply
                        .pointer("/content/approve")
                        .and_then(Value::as_bool)
                        .unwrap_or(true);
                    if approve {
                        Decision::Approve
                    } else {
                        Decision::Deny
                    }
                }
                // decline and cancel both refuse the batch
                _ => Decision::Deny,
            },
            Err(e) => {
                warn!(run_id, error = %e.message, "elicitation failed");
                Decision::Deny
            }
        };
        let verdict_line = match decision {
            Decision::Approve => "✓ User approved action",
            Decision::Deny => "✗ User declined action",
        };
        self.peer.log("info", json!(format!("[{run_id}] {verdict_line}")));
        Some(decision)
    }
}

// ========================= Tools =========================

fn default_true() -> bool {
    true
}

#[derive(Deserialize, Debug)]
struct ExecuteArgs {
    hostname: String,
    task: String,
    #[serde(default)]
    step_limit: Option<usize>,
    #[serde(default)]
    timeout: Option<u64>,
    #[serde(default = "default_true")]
    hitl: bool,
}

#[derive(Deserialize, Debug)]
struct RunIdArgs {
    run_id: String,
}

pub fn tool_definitions() -> Vec<Value> {
    vec![
        json!({
            "name": "execute_vnc_task",
            "description": "Execute a task on a VNC desktop. Credentials are looked up by hostname; \
                            never pass passwords as arguments. Streams progress, observations and \
                            screenshots while the run executes.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "hostname": { "type": "string", "description": "Credential handle of the desktop" },
                    "task": { "type": "string", "description": "What to do on the desktop" },
                    "step_limit": { "type": "integer", "minimum": 1 },
                    "timeout": { "type": "integer", "minimum": 0, "description": "Seconds" },
                    "hitl": { "type": "boolean", "default": true, "description": "Ask before risky actions" },
                },
                "required": ["hostname", "task"],
            },
        }),
        json!({
            "name": "resume_vnc_task",
            "description": "Approve or deny a run that is awaiting approval.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "run_id": { "type": "string" },
                    "decision": { "type": "string", "enum": ["approve", "deny"] },
                },
                "required": ["run_id", "decision"],
            },
        }),
        json!({
            "name": "cancel_vnc_task",
            "description": "Cancel an executing run or one awaiting approval.",
            "inputSchema": {
                "type": "object",
                "properties": { "run_id": { "type": "string" } },
                "required": ["run_id"],
            },
        }),
        json!({
            "name": "list_pending_runs",
            "description": "Runs parked awaiting approval.",
            "inputSchema": { "type": "object", "properties": {} },
        }),
    ]
}

fn summary_result(summary: &RunSummary) -> Value {
    let structured = serde_json::to_value(summary).unwrap_or(Value::Null);
    json!({
        "content": [{ "type": "text", "text": structured.to_string() }],
        "structuredContent": structured,
        "isError": false,
    })
}

fn error_result(message: impl std::fmt::Display) -> Value {
    json!({
        "content": [{ "type": "text", "text": message.to_string() }],
        "isError": true,
    })
}

fn run_result(result: Result<RunSummary, AgentError>) -> Value {
    match result {
        Ok(summary) => summary_result(&summary),
        Err(e) => error_result(e),
    }
}

fn parse_args<T: for<'de> Deserialize<'de>>(args: Value) -> Result<T, RpcError> {
    serde_json::from_value(args).map_err(|e| RpcError::new(INVALID_PARAMS, e.to_string()))
}

// ========================= Server =========================

struct Shared {
    service: AgentService,
    recorder: Arc<StreamingRecorder>,
    peer: Arc<Peer>,
    /// In-flight `tools/call` request ids and the run each one drives.
    calls: Mutex<HashMap<RequestId, String>>,
}

pub struct McpServer {
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedReceiver<String>,
}

impl McpServer {
    /// Wrap a service. Its recorder and approver are replaced: steps go
    /// through `recorder` and out to the client, approvals are elicited.
    pub fn new(service: AgentService, recorder: Arc<dyn RunRecorder>) -> Self {
        let (tx, outbound) = mpsc::unbounded_channel();
        let peer = Arc::new(Peer::new(tx));
        let recorder = Arc::new(StreamingRecorder::new(recorder));
        let service = service
            .with_recorder(recorder.clone())
            .with_approver(Arc::new(ElicitingApprover { peer: peer.clone() }));
        Self {
            shared: Arc::new(Shared {
                service,
                recorder,
                peer,
                calls: Mutex::new(HashMap::new()),
            }),
            outbound,
        }
    }

    /// Serve one client until it closes its end. Runs still executing at
    /// that point are cancelled and awaited.
    pub async fn serve<R, W>(self, reader: R, writer: W) -> std::io::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let Self {
            shared,
            mut outbound,
        } = self;
        let writer_task = tokio::spawn(async move {
            let mut writer = writer;
            while let Some(line) = outbound.recv().await {
                writer.write_all(line.as_bytes()).await?;
                writer.write_all(b"\n").await?;
                writer.flush().await?;
            }
            Ok::<_, std::io::Error>(())
        });

        info!("mcp server ready on stdio");
        let mut lines = BufReader::new(reader).lines();
        let mut calls = JoinSet::new();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => shared.clone().dispatch(&line, &mut calls).await,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "reading from client failed");
                    break;
                }
            }
        }

        info!("client disconnected");
        for run_id in shared.service.active().await {
            let _ = shared.service.cancel(&run_id).await;
        }
        shared.peer.abandon().await;
        while calls.join_next().await.is_some() {}
        drop(shared);

        match writer_task.await {
            Ok(result) => result,
            Err(e) => Err(std::io::Error::other(e)),
        }
    }
}

impl Shared {
    async fn dispatch(self: Arc<Self>, line: &str, calls: &mut JoinSet<()>) {
        let msg: Incoming = match serde_json::from_str(line) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "unparseable message");
                self.peer
                    .respond(RequestId::Null, Err(RpcError::new(PARSE_ERROR, e.to_string())));
                return;
            }
        };

        match (msg.method, msg.id) {
            (Some(method), Some(id)) if method == "tools/call" => {
                let shared = self.clone();
                calls.spawn(async move {
                    let result = shared.call_tool(id.clone(), msg.params).await;
                    shared.peer.respond(id, result);
                });
            }
            (Some(method), Some(id)) => {
                let result = self.handle_request(&method, msg.params).await;
                self.peer.respond(id, result);
            }
            (Some(method), None) => self.handle_notification(&method, msg.params).await,
            (None, Some(id)) => {
                let result = match msg.error {
                    Some(error) => Err(error),
                    None => Ok(msg.result.unwrap_or(Value::Null)),
                };
                self.peer.complete(id, result).await;
            }
            (None, None) => self.peer.respond(
                RequestId::Null,
                Err(RpcError::new(INVALID_REQUEST, "neither a method nor an id")),
            ),
        }
    }

    async fn handle_request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            "initialize" => {
                let elicitation = params.pointer("/capabilities/elicitation").is_some();
                self.peer.elicitation.store(elicitation, Ordering::SeqCst);
                let version = params
                    .get("protocolVersion")
                    .and_then(Value::as_str)
                    .unwrap_or(PROTOCOL_VERSION);
                info!(protocol = version, elicitation, "client initialized");
                Ok(json!({
                    "protocolVersion": version,
                    "capabilities": { "tools": { "listChanged": false }, "logging": {} },
                    "serverInfo": { "name": SERVER_NAME, "version": env!("CARGO_PKG_VERSION") },
                    "instructions": "Drive remote desktops over VNC. Runs that need approval \
                                     and cannot be asked interactively are parked; finish them \
                                     with resume_vnc_task.",
                }))
            }
            "ping" | "logging/setLevel" => Ok(json!({})),
            "tools/list" => Ok(json!({ "tools": tool_definitions() })),
            other => Err(RpcError::new(METHOD_NOT_FOUND, format!("unknown method {other}"))),
        }
    }

    async fn handle_notification(&self, method: &str, params: Value) {
        match method {
            "notifications/cancelled" => {
                let Some(id) = params
                    .get("requestId")
                    .cloned()
                    .and_then(|v| serde_json::from_value::<RequestId>(v).ok())
                else {
                    return;
                };
                let run_id = self.calls.lock().await.get(&id).cloned();
                if let Some(run_id) = run_id {
                    info!(%run_id, "client cancelled the call");
                    if let Err(e) = self.service.cancel(&run_id).await {
                        warn!(%run_id, error = %e, "cancel failed");
                    }
                }
            }
            other => debug!(method = other, "notification ignored"),
        }
    }

    async fn call_tool(&self, id: RequestId, params: Value) -> Result<Value, RpcError> {
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::new(INVALID_PARAMS, "missing tool name"))?
            .to_string();
        let args = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
        let token = params.pointer("/_meta/progressToken").cloned();
        debug!(tool = %name, "tool call");

        match name.as_str() {
            "execute_vnc_task" => {
                let args: ExecuteArgs = parse_args(args)?;
                let req = ExecuteRequest {
                    session_handle: args.hostname,
                    task: args.task,
                    step_limit: args.step_limit,
                    timeout_seconds: args.timeout,
                    hitl_enabled: args.hitl,
                };
                let run_id = new_run_id();
                let result = self
                    .followed(id, run_id.clone(), token, |svc| svc.execute_as(run_id, req))
                    .await;
                Ok(run_result(result))
            }
            "resume_vnc_task" => {
                let req: ResumeRequest = parse_args(args)?;
                let run_id = req.run_id.clone();
                let result = self
                    .followed(id, run_id, token, |svc| svc.resume(req))
                    .await;
                Ok(run_result(result))
            }
            "cancel_vnc_task" => {
                let args: RunIdArgs = parse_args(args)?;
                Ok(match self.service.cancel(&args.run_id).await {
                    Ok(Some(summary)) => summary_result(&summary),
                    Ok(None) => json!({
                        "content": [{ "type": "text", "text": format!("cancellation requested for {}", args.run_id) }],
                        "isError": false,
                    }),
                    Err(e) => error_result(e),
                })
            }
            "list_pending_runs" => Ok(match self.service.pending().await {
                Ok(pending) => {
                    let structured = json!({ "runs": pending });
                    json!({
                        "content": [{ "type": "text", "text": structured.to_string() }],
                        "structuredContent": structured,
                        "isError": false,
                    })
                }
                Err(e) => error_result(e),
            }),
            other => Err(RpcError::new(INVALID_PARAMS, format!("unknown tool {other}"))),
        }
    }

    /// Drive a run while relaying its events back on this call.
    async fn followed<'a, F, Fut>(
        &'a self,
        id: RequestId,
        run_id: String,
        token: Option<Value>,
        drive: F,
    ) -> Result<RunSummary, AgentError>
    where
        F: FnOnce(&'a AgentService) -> Fut,
        Fut: std::future::Future<Output = Result<RunSummary, AgentError>>,
    {
        self.calls.lock().await.insert(id.clone(), run_id.clone());
        let mut events = self.recorder.subscribe(&run_id).await;
        let mut relay = Relay {
            peer: self.peer.clone(),
            run_id: run_id.clone(),
            progress_token: token,
            total: None,
            last_observation: None,
        };
        let relay_task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                relay.forward(event);
            }
            relay
        });

        let result = drive(&self.service).await;

        self.recorder.unsubscribe(&run_id).await;
        self.calls.lock().await.remove(&id);
        let relay = relay_task.await.ok();
        match (&result, relay) {
            (Ok(summary), Some(relay)) => {
                let line = if summary.success {
                    format!("✓ Task completed successfully in {} steps", summary.steps_taken)
                } else {
                    format!(
                        "✗ Task ended {:?}: {}",
                        summary.status,
                        summary.error.as_deref().unwrap_or("no error recorded")
                    )
                };
                relay.peer.log("info", json!(format!("[{run_id}] {line}")));
            }
            (Err(e), Some(relay)) => relay.peer.log("error", json!(format!("[{run_id}] ✗ Error: {e}"))),
            (_, None) => {}
        }
        result
    }
}
