mod common;

use common::*;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;

use vnc_agent::agent::NullRecorder;
use vnc_agent::credentials::EnvironmentStore;
use vnc_agent::mcp::{McpServer, METHOD_NOT_FOUND, PARSE_ERROR};
use vnc_agent::safety::RiskLevel;
use vnc_agent::store::MemorySessionStore;
use vnc_agent::AgentService;

/// The client end of a stdio session with the server.
struct Client {
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    writer: WriteHalf<DuplexStream>,
    server: JoinHandle<std::io::Result<()>>,
    /// Notifications seen while waiting for responses.
    notes: Vec<Value>,
}

impl Client {
    async fn send(&mut self, msg: Value) {
        let line = format!("{msg}\n");
        self.writer.write_all(line.as_bytes()).await.unwrap();
    }

    async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    async fn next(&mut self) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(10), self.lines.next_line())
            .await
            .expect("server went quiet")
            .unwrap()
            .expect("server closed the stream");
        serde_json::from_str(&line).unwrap()
    }

    /// Read until the response to `id`, keeping notifications aside.
    async fn response(&mut self, id: i64) -> Value {
        loop {
            let msg = self.next().await;
            if msg.get("method").is_some() && msg.get("id").is_none() {
                self.notes.push(msg);
                continue;
            }
            assert_eq!(msg["id"], json!(id), "unexpected message {msg}");
            return msg;
        }
    }

    /// Read until the server asks something of us.
    async fn server_request(&mut self, method: &str) -> Value {
        loop {
            let msg = self.next().await;
            if msg.get("method").is_some() && msg.get("id").is_none() {
                self.notes.push(msg);
                continue;
            }
            assert_eq!(msg["method"], json!(method), "unexpected message {msg}");
            return msg;
        }
    }

    async fn initialize(&mut self, elicitation: bool) -> Value {
        let capabilities = if elicitation {
            json!({ "elicitation": {} })
        } else {
            json!({})
        };
        self.send(json!({
            "jsonrpc": "2.0",
            "id": 0,
            "method": "initialize",
            "params": {
                "protocolVersion": "2025-06-18",
                "capabilities": capabilities,
                "clientInfo": { "name": "test", "version": "0" },
            },
        }))
        .await;
        let reply = self.response(0).await;
        self.send(json!({ "jsonrpc": "2.0", "method": "notifications/initialized" }))
            .await;
        reply
    }

    async fn call(&mut self, id: i64, name: &str, arguments: Value) {
        self.send(json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "tools/call",
            "params": {
                "name": name,
                "arguments": arguments,
                "_meta": { "progressToken": format!("tok-{id}") },
            },
        }))
        .await;
    }

    fn progress(&self) -> Vec<Value> {
        self.notes
            .iter()
            .filter(|n| n["method"] == "notifications/progress")
            .map(|n| n["params"].clone())
            .collect()
    }

    fn log_lines(&self) -> Vec<String> {
        self.notes
            .iter()
            .filter(|n| n["method"] == "notifications/message")
            .filter_map(|n| n["params"]["data"].as_str().map(str::to_string))
            .collect()
    }

    async fn close(mut self) {
        self.writer.shutdown().await.unwrap();
        drop(self.writer);
        tokio::time::timeout(Duration::from_secs(10), self.server)
            .await
            .expect("server did not shut down")
            .unwrap()
            .unwrap();
    }
}

fn start(planner: ScriptedPlanner, display: FakeDisplay) -> Client {
    let service = AgentService::new(
        Arc::new(FakeConnector::new(display)),
        Arc::new(EnvironmentStore::new(Some("desk.local::5901".into()), None)),
        Arc::new(planner),
        Arc::new(MemorySessionStore::new()),
    )
    .with_config(test_config());
    let server = McpServer::new(service, Arc::new(NullRecorder));

    let (client_end, server_end) = tokio::io::duplex(1 << 20);
    let (server_r, server_w) = tokio::io::split(server_end);
    let server = tokio::spawn(server.serve(server_r, server_w));
    let (client_r, writer) = tokio::io::split(client_end);
    Client {
        lines: BufReader::new(client_r).lines(),
        writer,
        server,
        notes: Vec::new(),
    }
}

fn gated_click() -> ScriptedPlanner {
    ScriptedPlanner::new(vec![gated(
        vec![click(500, 500)],
        RiskLevel::RequireConfirmation,
        "Sends an email",
    )])
}

#[tokio::test]
async fn lists_the_task_tools() {
    let mut client = start(ScriptedPlanner::new(vec![]), FakeDisplay::new(100, 100));
    let init = client.initialize(false).await;
    assert_eq!(init["result"]["serverInfo"]["name"], json!("vnc-agent"));
    assert!(init["result"]["capabilities"]["tools"].is_object());

    client
        .send(json!({ "jsonrpc": "2.0", "id": 1, "method": "tools/list" }))
        .await;
    let reply = client.response(1).await;
    let names: Vec<&str> = reply["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert_eq!(
        names,
        vec!["execute_vnc_task", "resume_vnc_task", "cancel_vnc_task", "list_pending_runs"]
    );
    client.close().await;
}

#[tokio::test]
async fn execute_streams_progress_per_step() {
    let display = FakeDisplay::new(100, 100);
    let planner = ScriptedPlanner::new(vec![proposal(vec![click(1, 1), click(2, 2)])]);
    let mut client = start(planner, display.clone());
    client.initialize(false).await;

    client
        .call(1, "execute_vnc_task", json!({ "hostname": "desk", "task": "click twice", "step_limit": 5 }))
        .await;
    let reply = client.response(1).await;

    let result = &reply["result"];
    assert_eq!(result["isError"], json!(false));
    assert_eq!(result["structuredContent"]["status"], json!("completed"));
    assert_eq!(result["structuredContent"]["steps_taken"], json!(2));
    assert_eq!(display.calls().len(), 2);

    let progress = client.progress();
    let steps: Vec<i64> = progress.iter().map(|p| p["progress"].as_i64().unwrap()).collect();
    assert_eq!(steps, vec![0, 1, 2]);
    assert!(progress.iter().all(|p| p["progressToken"] == json!("tok-1")));
    assert_eq!(progress[2]["total"], json!(5));

    let logs = client.log_lines();
    assert!(logs.iter().any(|l| l.contains("Starting VNC task: click twice")));
    assert!(logs.iter().any(|l| l.contains("[Step 1] ✓ Executed: click_at")));
    assert!(logs.iter().any(|l| l.contains("Model observes: 2 action(s) planned")));
    assert!(logs.iter().any(|l| l.contains("Task completed successfully in 2 steps")));
    client.close().await;
}

#[tokio::test]
async fn approval_is_elicited_from_the_client() {
    let display = FakeDisplay::new(1000, 1000);
    let mut client = start(gated_click(), display.clone());
    client.initialize(true).await;

    client
        .call(1, "execute_vnc_task", json!({ "hostname": "desk", "task": "send the draft" }))
        .await;
    let ask = client.server_request("elicitation/create").await;
    let message = ask["params"]["message"].as_str().unwrap();
    assert!(message.contains("Sends an email"), "{message}");
    assert!(message.contains("click_at"), "{message}");
    assert!(display.calls().is_empty(), "nothing runs before the answer");

    client
        .send(json!({
            "jsonrpc": "2.0",
            "id": ask["id"],
            "result": { "action": "accept", "content": { "approve": true } },
        }))
        .await;
    let reply = client.response(1).await;

    assert_eq!(reply["result"]["structuredContent"]["status"], json!("completed"));
    assert_eq!(display.calls().len(), 1);
    client.close().await;
}

#[tokio::test]
async fn declined_elicitation_denies_the_run() {
    let display = FakeDisplay::new(1000, 1000);
    let mut client = start(gated_click(), display.clone());
    client.initialize(true).await;

    client
        .call(1, "execute_vnc_task", json!({ "hostname": "desk", "task": "send the draft" }))
        .await;
    let ask = client.server_request("elicitation/create").await;
    client
        .send(json!({ "jsonrpc": "2.0", "id": ask["id"], "result": { "action": "decline" } }))
        .await;
    let reply = client.response(1).await;

    let summary = &reply["result"]["structuredContent"];
    assert_eq!(summary["status"], json!("denied"));
    assert_eq!(summary["error"], json!("denied: Sends an email"));
    assert!(display.calls().is_empty());
    client.close().await;
}

#[tokio::test]
async fn client_without_elicitation_parks_then_resumes() {
    let display = FakeDisplay::new(1000, 1000);
    let mut client = start(gated_click(), display.clone());
    client.initialize(false).await;

    client
        .call(1, "execute_vnc_task", json!({ "hostname": "desk", "task": "send the draft" }))
        .await;
    let parked = client.response(1).await;
    let summary = &parked["result"]["structuredContent"];
    assert_eq!(summary["status"], json!("awaiting_approval"));
    let run_id = summary["run_id"].as_str().unwrap().to_string();

    client.call(2, "list_pending_runs", json!({})).await;
    let pending = client.response(2).await;
    assert_eq!(pending["result"]["structuredContent"]["runs"][0]["run_id"], json!(run_id));

    client
        .call(3, "resume_vnc_task", json!({ "run_id": run_id, "decision": "approve" }))
        .await;
    let done = client.response(3).await;
    assert_eq!(done["result"]["structuredContent"]["status"], json!("completed"));
    assert_eq!(display.calls().len(), 1);
    client.close().await;
}

#[tokio::test]
async fn closing_the_connection_mid_approval_denies_the_run() {
    let display = FakeDisplay::new(1000, 1000);
    let mut client = start(gated_click(), display.clone());
    client.initialize(true).await;

    client
        .call(1, "execute_vnc_task", json!({ "hostname": "desk", "task": "send the draft" }))
        .await;
    client.server_request("elicitation/create").await;

    // never answer; the server must still shut down cleanly
    client.close().await;
    assert!(display.calls().is_empty());
}

#[tokio::test]
async fn tool_failures_are_reported_in_the_result() {
    let service = AgentService::new(
        Arc::new(FakeConnector::new(FakeDisplay::new(10, 10)).refusing()),
        Arc::new(EnvironmentStore::new(Some("nowhere:0".into()), None)),
        Arc::new(ScriptedPlanner::new(vec![])),
        Arc::new(MemorySessionStore::new()),
    );
    let (client_end, server_end) = tokio::io::duplex(1 << 16);
    let (server_r, server_w) = tokio::io::split(server_end);
    let server = tokio::spawn(McpServer::new(service, Arc::new(NullRecorder)).serve(server_r, server_w));
    let (client_r, writer) = tokio::io::split(client_end);
    let mut client = Client {
        lines: BufReader::new(client_r).lines(),
        writer,
        server,
        notes: Vec::new(),
    };
    client.initialize(false).await;

    client
        .call(1, "execute_vnc_task", json!({ "hostname": "desk", "task": "t" }))
        .await;
    let reply = client.response(1).await;
    assert_eq!(reply["result"]["isError"], json!(true));
    assert!(reply["result"]["content"][0]["text"]
        .as_str()
        .unwrap()
        .contains("connection refused"));

    client.call(2, "execute_vnc_task", json!({ "task": "no host" })).await;
    let reply = client.response(2).await;
    assert_eq!(reply["error"]["code"], json!(-32602));
    client.close().await;
}

#[tokio::test]
async fn protocol_errors() {
    let mut client = start(ScriptedPlanner::new(vec![]), FakeDisplay::new(10, 10));
    client.initialize(false).await;

    client
        .send(json!({ "jsonrpc": "2.0", "id": 7, "method": "resources/list" }))
        .await;
    let reply = client.response(7).await;
    assert_eq!(reply["error"]["code"], json!(METHOD_NOT_FOUND));

    client.send_raw("{not json").await;
    let reply = client.next().await;
    assert_eq!(reply["id"], Value::Null);
    assert_eq!(reply["error"]["code"], json!(PARSE_ERROR));

    client
        .send(json!({ "jsonrpc": "2.0", "id": 8, "method": "ping" }))
        .await;
    assert_eq!(client.response(8).await["result"], json!({}));
    client.close().await;
}
