use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tokio::fs as async_fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::agent::{Action, ActionOutcome, RecorderError, RunPhase, RunRecorder, Screenshot, SessionState};

pub const INITIAL_SCREENSHOT: &str = "step_000_initial.png";
pub const STEPS_FILE: &str = "steps.jsonl";
pub const METADATA_FILE: &str = "metadata.json";
pub const HISTORY_FILE: &str = "action_history.txt";
pub const REPORT_FILE: &str = "EXECUTION_REPORT.md";

/// One line of `steps.jsonl`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StepRecord {
    pub step: usize,
    pub action: Action,
    pub call: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observation: Option<String>,
    pub screenshot: String,
    pub width: u32,
    pub height: u32,
    pub timestamp: DateTime<Utc>,
}

/// Writes each run's artifacts under `<base_dir>/<run_id>/`.
///
/// Step records are appended to `steps.jsonl` as they happen and read back at
/// finalize, so a run resumed in another process still gets a full report.
pub struct DiskRecorder {
    base_dir: PathBuf,
}

impl DiskRecorder {
    pub fn new<P: AsRef<Path>>(base: P) -> Self {
        Self {
            base_dir: base.as_ref().to_path_buf(),
        }
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.base_dir.join(run_id)
    }

    async fn ensure_dir(&self, run_id: &str) -> Result<PathBuf, RecorderError> {
        let dir = self.run_dir(run_id);
        async_fs::create_dir_all(&dir)
            .await
            .map_err(|e| RecorderError(format!("create_dir {}: {e}", dir.display())))?;
        Ok(dir)
    }

    async fn write_png(dir: &Path, name: &str, shot: &Screenshot) -> Result<(), RecorderError> {
        let path = dir.join(name);
        async_fs::write(&path, &shot.png)
            .await
            .map_err(|e| RecorderError(format!("write {}: {e}", path.display())))?;
        debug!(path = %path.display(), "screenshot saved");
        Ok(())
    }

    /// Every step recorded so far. Unreadable lines are skipped.
    pub async fn read_steps(&self, run_id: &str) -> Vec<StepRecord> {
        let path = self.run_dir(run_id).join(STEPS_FILE);
        let Ok(text) = async_fs::read_to_string(&path).await else {
            return Vec::new();
        };
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| match serde_json::from_str(l) {
                Ok(r) => Some(r),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping bad step record");
                    None
                }
            })
            .collect()
    }
}

pub fn step_screenshot_name(step: usize) -> String {
    format!("step_{step:03}_after.png")
}

#[async_trait]
impl RunRecorder for DiskRecorder {
    async fn begin(&self, state: &SessionState, initial: &Screenshot) -> Result<(), RecorderError> {
        let dir = self.ensure_dir(&state.run_id).await?;
        Self::write_png(&dir, INITIAL_SCREENSHOT, initial).await?;
        info!(run_id = %state.run_id, dir = %dir.display(), "recording run");
        Ok(())
    }

    async fn record_step(
        &self,
        run_id: &str,
        step: usize,
        outcome: &ActionOutcome,
        observation: Option<&str>,
    ) -> Result<(), RecorderError> {
        let dir = self.ensure_dir(run_id).await?;
        let name = step_screenshot_name(step);
        Self::write_png(&dir, &name, &outcome.screenshot_after).await?;

        let record = StepRecord {
            step,
            action: outcome.action.clone(),
            call: outcome.action.to_string(),
            success: outcome.success,
            error: outcome.error.clone(),
            observation: observation.map(str::to_string),
            screenshot: name,
            width: outcome.screenshot_after.width,
            height: outcome.screenshot_after.height,
            timestamp: Utc::now(),
        };
        let mut line = serde_json::to_string(&record).map_err(|e| RecorderError(e.to_string()))?;
        line.push('\n');

        let path = dir.join(STEPS_FILE);
        let mut file = async_fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| RecorderError(format!("open {}: {e}", path.display())))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| RecorderError(format!("append {}: {e}", path.display())))?;
        file.flush()
            .await
            .map_err(|e| RecorderError(e.to_string()))?;
        Ok(())
    }

    async fn finalize(&self, state: &SessionState) -> Result<(), RecorderError> {
        let dir = self.ensure_dir(&state.run_id).await?;
        let steps = self.read_steps(&state.run_id).await;
        let ended_at = Utc::now();
        let summary = state.summary();

        let metadata = json!({
            "run_id": state.run_id,
            "task": state.task,
            "session_handle": state.session_handle,
            "start_time": state.started_at,
            "end_time": ended_at,
            "active_seconds": state.elapsed(ended_at).as_secs_f64(),
            "limits": state.limits,
            "summary": summary,
            "steps": steps.iter().map(|s| json!({
                "step": s.step,
                "call": s.call,
                "success": s.success,
                "error": s.error,
                "timestamp": s.timestamp,
            })).collect::<Vec<_>>(),
        });
        let text = serde_json::to_string_pretty(&metadata).map_err(|e| RecorderError(e.to_string()))?;
        write_text(&dir.join(METADATA_FILE), &text).await?;

        if !steps.is_empty() {
            write_text(&dir.join(HISTORY_FILE), &render_history(&state.task, &steps)).await?;
        }
        write_text(&dir.join(REPORT_FILE), &render_report(state, &steps, ended_at)).await?;
        info!(run_id = %state.run_id, dir = %dir.display(), "run recording finalized");
        Ok(())
    }
}

async fn write_text(path: &Path, text: &str) -> Result<(), RecorderError> {
    async_fs::write(path, text)
        .await
        .map_err(|e| RecorderError(format!("write {}: {e}", path.display())))
}

fn render_history(task: &str, steps: &[StepRecord]) -> String {
    let mut out = format!("Task: {task}\n{}\n\n", "=".repeat(70));
    for (i, s) in steps.iter().enumerate() {
        let result = match &s.error {
            None if s.success => "Success".to_string(),
            Some(e) => format!("Error: {e}"),
            None => "Error".to_string(),
        };
        let _ = writeln!(out, "{}. {} - {result}", i + 1, s.call);
    }
    out
}

fn render_report(state: &SessionState, steps: &[StepRecord], ended_at: DateTime<Utc>) -> String {
    let summary = state.summary();
    let status = match summary.status {
        RunPhase::Completed => "✓ Completed".to_string(),
        other => format!("✗ {other:?}"),
    };

    let mut out = String::new();
    let _ = writeln!(out, "# Agent Execution Report\n");
    let _ = writeln!(out, "**Run ID:** `{}`\n", state.run_id);
    let _ = writeln!(out, "**Task:** {}\n", state.task);
    let _ = writeln!(out, "**Duration:** {:.1} seconds\n", state.elapsed(ended_at).as_secs_f64());
    let _ = writeln!(out, "**Status:** {status}\n");
    if let Some(err) = &summary.error {
        let _ = writeln!(out, "**Error:** {err}\n");
    }
    out.push_str("---\n\n## Initial Observation\n\n");
    let _ = writeln!(out, "![Initial Screenshot]({INITIAL_SCREENSHOT})\n");
    out.push_str("---\n\n## Execution Timeline\n\n");

    let mut previous = state.started_at;
    let mut last_observation: Option<&str> = None;
    for s in steps {
        let took = (s.timestamp - previous).num_milliseconds().max(0) as f64 / 1000.0;
        previous = s.timestamp;
        let _ = writeln!(out, "### Step {} ({took:.1}s)\n", s.step);
        // the same observation covers every action of a batch
        if let Some(obs) = s.observation.as_deref().filter(|o| Some(*o) != last_observation) {
            let _ = writeln!(out, "**Model Observation:**\n> {obs}\n");
        }
        last_observation = s.observation.as_deref();
        let _ = writeln!(out, "**Executed:** `{}`\n", s.call);
        match &s.error {
            None if s.success => out.push_str("**Result:** ✓ Success\n\n"),
            err => {
                let _ = writeln!(out, "**Result:** ✗ Error: {}\n", err.as_deref().unwrap_or("unknown"));
            }
        }
        let _ = writeln!(out, "![After Step {}]({})\n", s.step, s.screenshot);
        out.push_str("---\n\n");
    }

    out.push_str("## Summary\n\n");
    let _ = writeln!(out, "- **Total Steps:** {}", summary.steps_taken);
    let _ = writeln!(out, "- **Success:** {}", if summary.success { "Yes" } else { "No" });
    if let Some(err) = &summary.error {
        let _ = writeln!(out, "- **Final Error:** {err}");
    }
    let _ = writeln!(out, "- **Screenshots Saved:** {}", steps.len() + 1);
    let _ = writeln!(out, "- **Run Directory:** `{}`", state.run_id);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{RunLimits, RunStatus};
    use crate::coords::NormPoint;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn outcome(action: Action, error: Option<&str>) -> ActionOutcome {
        ActionOutcome {
            action,
            success: error.is_none(),
            error: error.map(str::to_string),
            screenshot_after: Screenshot::new(vec![1, 2, 3], 20, 10),
        }
    }

    #[tokio::test]
    async fn writes_screenshots_steps_and_report() {
        let dir = TempDir::new().unwrap();
        let recorder = DiskRecorder::new(dir.path());
        let mut state = SessionState::new("run_a", "lab", "save the file", RunLimits::default());

        recorder
            .begin(&state, &Screenshot::new(vec![9, 9], 20, 10))
            .await
            .unwrap();
        recorder
            .record_step(
                "run_a",
                1,
                &outcome(Action::Click { at: NormPoint { x: 1, y: 2 } }, None),
                Some("Menu is open."),
            )
            .await
            .unwrap();
        recorder
            .record_step(
                "run_a",
                2,
                &outcome(Action::KeyCombo { keys: "hyper+q".into() }, Some("unknown key")),
                Some("Menu is open."),
            )
            .await
            .unwrap();
        state.step_count = 2;
        state.conclude(RunStatus::Completed, None);
        recorder.finalize(&state).await.unwrap();

        let run_dir = recorder.run_dir("run_a");
        assert_eq!(std::fs::read(run_dir.join(INITIAL_SCREENSHOT)).unwrap(), vec![9, 9]);
        assert!(run_dir.join("step_001_after.png").exists());
        assert!(run_dir.join("step_002_after.png").exists());

        let steps = recorder.read_steps("run_a").await;
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].call, "click_at(x=1, y=2)");
        assert_eq!(steps[1].error.as_deref(), Some("unknown key"));

        let history = std::fs::read_to_string(run_dir.join(HISTORY_FILE)).unwrap();
        assert!(history.starts_with("Task: save the file\n"));
        assert!(history.contains("1. click_at(x=1, y=2) - Success"));
        assert!(history.contains("2. key_combination(keys=\"hyper+q\") - Error: unknown key"));

        let report = std::fs::read_to_string(run_dir.join(REPORT_FILE)).unwrap();
        assert!(report.contains("**Status:** ✓ Completed"));
        assert_eq!(report.matches("**Model Observation:**").count(), 1);
        assert!(report.contains("![After Step 2](step_002_after.png)"));

        let meta: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(run_dir.join(METADATA_FILE)).unwrap())
                .unwrap();
        assert_eq!(meta["summary"]["steps_taken"], 2);
        assert_eq!(meta["steps"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn finalize_without_steps_still_reports() {
        let dir = TempDir::new().unwrap();
        let recorder = DiskRecorder::new(dir.path());
        let mut state = SessionState::new("run_b", "lab", "t", RunLimits::default());
        state.conclude(RunStatus::Error, Some("planner failure: boom".into()));
        recorder.finalize(&state).await.unwrap();

        let run_dir = recorder.run_dir("run_b");
        assert!(!run_dir.join(HISTORY_FILE).exists());
        let report = std::fs::read_to_string(run_dir.join(REPORT_FILE)).unwrap();
        assert!(report.contains("**Error:** planner failure: boom"));
        assert!(report.contains("- **Success:** No"));
    }
}
