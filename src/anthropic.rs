use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::agent::{HistoryEntry, Planner, PlannerError, Proposal, Screenshot};
use crate::config::{PlannerSettings, DEFAULT_SCREENSHOT_WIDTH, ENV_ANTHROPIC_API_KEY};
use crate::planner::{self, decode_call, history_lines, tool_schemas};
use crate::safety::{RiskLevel, SafetyVerdict};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 1024;

const REFUSAL_PHRASES: &[&str] = &[
    "i cannot",
    "i can't",
    "i'm not able to",
    "unsafe",
    "dangerous",
    "i shouldn't",
    "i won't",
    "cannot comply",
];

const USER_PROMPT: &str =
    "Here is the current screenshot. What action(s) should I take next to accomplish the task?";

/// Claude over the Messages API, with the desktop actions declared as tools.
#[derive(Clone)]
pub struct AnthropicPlanner {
    http: Client,
    api_key: String,
    model: String,
    base_url: String,
    excluded: Vec<String>,
    max_width: u32,
}

impl AnthropicPlanner {
    pub fn new(settings: PlannerSettings, excluded: Vec<String>) -> Result<Self, PlannerError> {
        let api_key = settings
            .api_key
            .ok_or(PlannerError::MissingApiKey(ENV_ANTHROPIC_API_KEY))?;
        info!(model = %settings.model, "anthropic planner ready");
        Ok(Self {
            http: Client::new(),
            api_key,
            model: settings.model,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            excluded,
            max_width: DEFAULT_SCREENSHOT_WIDTH,
        })
    }

    pub fn with_max_width(mut self, max_width: u32) -> Self {
        self.max_width = max_width;
        self
    }

    fn system_prompt(&self, task: &str, history: &[HistoryEntry]) -> String {
        let tools = tool_schemas(&self.excluded);
        let mut prompt = String::from(
            "You are controlling a computer via VNC (Virtual Network Computing).\n\
             You can see screenshots of the desktop and propose actions to accomplish tasks.\n\n",
        );
        prompt.push_str(&format!("Current task: {task}\n\nAvailable actions:\n"));
        for tool in &tools {
            let name = tool["name"].as_str().unwrap_or_default();
            let description = tool["description"].as_str().unwrap_or_default();
            prompt.push_str(&format!("- {name}: {description}\n"));
        }
        prompt.push_str(
            "\nCoordinates are normalized to a 0-999 grid. Convert screen positions proportionally.\n\
             When the task is complete, reply without calling any tool.",
        );
        let lines = history_lines(history);
        if !lines.is_empty() {
            prompt.push_str("\n\nActions taken so far:\n");
            for (i, line) in lines.iter().enumerate() {
                prompt.push_str(&format!("{}. {line}\n", i + 1));
            }
        }
        prompt
    }

    pub fn build_request(&self, task: &str, history: &[HistoryEntry], png: &[u8]) -> Value {
        json!({
            "model": self.model,
            "max_tokens": MAX_TOKENS,
            "temperature": 0.0,
            "system": self.system_prompt(task, history),
            "tools": tool_schemas(&self.excluded),
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": USER_PROMPT },
                    { "type": "image", "source": {
                        "type": "base64",
                        "media_type": "image/png",
                        "data": B64.encode(png),
                    }}
                ]
            }]
        })
    }

    pub fn parse_response(v: &Value) -> Result<Proposal, PlannerError> {
        let blocks = v
            .get("content")
            .and_then(Value::as_array)
            .ok_or_else(|| PlannerError::Malformed("response has no content".into()))?;

        let mut actions = Vec::new();
        let mut texts = Vec::new();
        for block in blocks {
            match block.get("type").and_then(Value::as_str) {
                Some("text") => {
                    if let Some(t) = block.get("text").and_then(Value::as_str) {
                        if !t.trim().is_empty() {
                            texts.push(t.trim().to_string());
                        }
                    }
                }
                Some("tool_use") => {
                    let name = block.get("name").and_then(Value::as_str).unwrap_or_default();
                    let input = block.get("input").cloned().unwrap_or_else(|| json!({}));
                    debug!(tool = name, "anthropic tool call");
                    actions.push(decode_call(name, &input));
                }
                _ => {}
            }
        }
        let observation = (!texts.is_empty()).then(|| texts.join(" "));

        let refused = v.get("stop_reason").and_then(Value::as_str) == Some("refusal");
        let safety = if actions.is_empty() {
            let text = observation.as_deref().unwrap_or_default();
            if refused || is_refusal(text) {
                warn!(text = %truncate(text, 100), "model refused the task");
                Some(SafetyVerdict::new(
                    RiskLevel::Blocked,
                    format!("Model refused: {}", truncate(text, 200)),
                ))
            } else {
                None
            }
        } else {
            None
        };

        Ok(Proposal {
            observation,
            actions,
            safety,
        })
    }
}

fn is_refusal(text: &str) -> bool {
    let lower = text.to_lowercase();
    REFUSAL_PHRASES.iter().any(|p| lower.contains(p))
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[async_trait]
impl Planner for AnthropicPlanner {
    async fn propose(
        &self,
        task: &str,
        history: &[HistoryEntry],
        screenshot: &Screenshot,
    ) -> Result<Proposal, PlannerError> {
        let png = planner::prepare_screenshot(screenshot, self.max_width)?;
        let url = format!("{}/messages", self.base_url);
        let body = self.build_request(task, history, &png);
        debug!(history = history.len(), image_bytes = png.len(), "calling anthropic");

        let resp = self
            .http
            .post(url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| PlannerError::Transport(e.to_string()))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| PlannerError::Transport(e.to_string()))?;
        if !status.is_success() {
            warn!(status = status.as_u16(), "anthropic request failed");
            return Err(PlannerError::Http {
                status: status.as_u16(),
                body: text,
            });
        }
        let v: Value = serde_json::from_str(&text)
            .map_err(|e| PlannerError::Malformed(format!("invalid JSON: {e}")))?;
        Self::parse_response(&v)
    }
}
