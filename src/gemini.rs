use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::agent::{HistoryEntry, Planner, PlannerError, Proposal, Screenshot};
use crate::config::{PlannerSettings, DEFAULT_SCREENSHOT_WIDTH, ENV_GEMINI_API_KEY};
use crate::planner::{self, context_text, decode_call, stricter, take_safety_decision, verdict_from_value};
use crate::safety::{RiskLevel, SafetyVerdict};

/// Gemini computer-use planner.
///
/// Every turn is a single stateless `generateContent` call: the task, a short
/// text log of recent actions and the current screenshot. Nothing is threaded
/// between calls, so the request size stays flat over a long run.
#[derive(Clone)]
pub struct GeminiPlanner {
    http: Client,
    api_key: String,
    model: String,
    base_url: String,
    excluded: Vec<String>,
    max_width: u32,
}

impl GeminiPlanner {
    pub fn new(settings: PlannerSettings, excluded: Vec<String>) -> Result<Self, PlannerError> {
        let api_key = settings
            .api_key
            .ok_or(PlannerError::MissingApiKey(ENV_GEMINI_API_KEY))?;
        info!(model = %settings.model, ?excluded, "gemini planner ready");
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

    pub fn build_request(&self, task: &str, history: &[HistoryEntry], png: &[u8]) -> Value {
        json!({
            "contents": [{
                "role": "user",
                "parts": [
                    { "text": context_text(task, history) },
                    { "inline_data": { "mime_type": "image/png", "data": B64.encode(png) } }
                ]
            }],
            "tools": [{
                "computer_use": {
                    "environment": "ENVIRONMENT_BROWSER",
                    "excluded_predefined_functions": self.excluded,
                }
            }]
        })
    }

    /// Read function calls, text and any safety decision out of a response.
    pub fn parse_response(v: &Value) -> Result<Proposal, PlannerError> {
        let candidate = match v.pointer("/candidates/0") {
            Some(c) => c,
            None => {
                if let Some(reason) = v.pointer("/promptFeedback/blockReason").and_then(Value::as_str) {
                    return Ok(Proposal {
                        observation: None,
                        actions: vec![],
                        safety: Some(SafetyVerdict::new(
                            RiskLevel::Blocked,
                            format!("prompt blocked: {reason}"),
                        )),
                    });
                }
                return Err(PlannerError::Malformed("response has no candidates".into()));
            }
        };

        let mut safety = candidate
            .get("safety_decision")
            .or_else(|| candidate.get("safetyDecision"))
            .and_then(verdict_from_value)
            .filter(|v| v.risk_level != RiskLevel::Allowed);
        if candidate.get("finishReason").and_then(Value::as_str) == Some("SAFETY") {
            safety = stricter(
                safety,
                Some(SafetyVerdict::new(RiskLevel::Blocked, "response stopped for safety")),
            );
        }

        let mut actions = Vec::new();
        let mut texts = Vec::new();
        let parts = candidate
            .pointer("/content/parts")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for part in parts {
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                if !text.trim().is_empty() {
                    texts.push(text.trim().to_string());
                }
                continue;
            }
            let Some(call) = part.get("functionCall").or_else(|| part.get("function_call")) else {
                continue;
            };
            let name = call.get("name").and_then(Value::as_str).unwrap_or_default();
            let mut args = call.get("args").cloned().unwrap_or_else(|| json!({}));
            let verdict = take_safety_decision(&mut args).filter(|v| v.risk_level != RiskLevel::Allowed);
            safety = stricter(safety, verdict);
            debug!(function = name, "gemini function call");
            actions.push(decode_call(name, &args));
        }

        Ok(Proposal {
            observation: (!texts.is_empty()).then(|| texts.join(" ")),
            actions,
            safety,
        })
    }
}

#[async_trait]
impl Planner for GeminiPlanner {
    async fn propose(
        &self,
        task: &str,
        history: &[HistoryEntry],
        screenshot: &Screenshot,
    ) -> Result<Proposal, PlannerError> {
        let png = planner::prepare_screenshot(screenshot, self.max_width)?;
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        let body = self.build_request(task, history, &png);
        debug!(
            history = history.len(),
            image_bytes = png.len(),
            "calling gemini"
        );

        let resp = self
            .http
            .post(url)
            .header("x-goog-api-key", &self.api_key)
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
            warn!(status = status.as_u16(), "gemini request failed");
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
