//! Plumbing shared by the planner backends: the action catalogue, decoding of
//! model function calls, the text-only history rendering and screenshot
//! downscaling.

use image::codecs::png::PngEncoder;
use image::imageops::FilterType;
use image::{ColorType, ImageEncoder};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::agent::{Action, HistoryEntry, PlannerError, Screenshot, ScrollDirection};
use crate::coords::NormPoint;
use crate::safety::{RiskLevel, SafetyVerdict};
use crate::vnc::DEFAULT_SCROLL_MAGNITUDE;

/// Function names a desktop session can actually carry out.
pub const DESKTOP_ACTIONS: &[&str] = &[
    "click_at",
    "double_click_at",
    "hover_at",
    "type_text_at",
    "key_combination",
    "scroll_document",
    "scroll_at",
    "drag_and_drop",
    "wait_5_seconds",
];

/// Browser-only predefined functions kept out of the tool catalogue by default.
pub const DEFAULT_EXCLUDED_ACTIONS: &[&str] =
    &["open_web_browser", "navigate", "go_back", "go_forward", "search"];

/// How many past actions are replayed to a stateless planner.
pub const HISTORY_WINDOW: usize = 10;

pub fn default_excluded_actions() -> Vec<String> {
    DEFAULT_EXCLUDED_ACTIONS.iter().map(|s| s.to_string()).collect()
}

// ========================= Function call decoding =========================

/// Turn one model function call into an [`Action`].
///
/// Never fails: unknown names and malformed arguments come back as
/// [`Action::Rejected`] so the model sees the problem on its next turn.
pub fn decode_call(name: &str, args: &Value) -> Action {
    match decode_inner(name, args) {
        Ok(action) => action,
        Err(reason) => {
            debug!(function = name, %reason, "rejecting function call");
            Action::Rejected {
                name: name.to_string(),
                reason,
            }
        }
    }
}

fn decode_inner(name: &str, args: &Value) -> Result<Action, String> {
    let action = match name {
        "click_at" => Action::Click {
            at: point(args, "x", "y")?,
        },
        "double_click_at" => Action::DoubleClick {
            at: point(args, "x", "y")?,
        },
        "hover_at" => Action::Hover {
            at: point(args, "x", "y")?,
        },
        "type_text_at" => Action::TypeText {
            at: match (args.get("x"), args.get("y")) {
                (None, None) => None,
                _ => Some(point(args, "x", "y")?),
            },
            text: string(args, "text")?,
            press_enter: flag(args, "press_enter"),
            clear_before_typing: flag(args, "clear_before_typing"),
        },
        "key_combination" => Action::KeyCombo {
            keys: string(args, "keys")?,
        },
        "scroll_document" => Action::ScrollDocument {
            direction: direction(args)?,
            magnitude: magnitude(args)?,
        },
        "scroll_at" => Action::ScrollAt {
            at: point(args, "x", "y")?,
            direction: direction(args)?,
            magnitude: magnitude(args)?,
        },
        "drag_and_drop" => Action::Drag {
            from: point(args, "x", "y")?,
            to: point(args, "destination_x", "destination_y")?,
        },
        "wait_5_seconds" => Action::Wait,
        "open_web_browser" => Action::Noop {
            name: name.to_string(),
        },
        "navigate" | "go_back" | "go_forward" | "search" => {
            return Err(format!("{name} needs a browser API and is not available on a VNC desktop"))
        }
        other => return Err(format!("unknown action {other:?}")),
    };
    Ok(action)
}

fn number(args: &Value, key: &str) -> Result<i64, String> {
    let v = args
        .get(key)
        .ok_or_else(|| format!("missing argument {key:?}"))?;
    v.as_i64()
        .or_else(|| v.as_f64().map(|f| f.round() as i64))
        .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
        .ok_or_else(|| format!("argument {key:?} is not a number: {v}"))
}

fn point(args: &Value, x: &str, y: &str) -> Result<NormPoint, String> {
    Ok(NormPoint::clamped(number(args, x)?, number(args, y)?))
}

fn string(args: &Value, key: &str) -> Result<String, String> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| format!("missing string argument {key:?}"))
}

fn flag(args: &Value, key: &str) -> bool {
    args.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn direction(args: &Value) -> Result<ScrollDirection, String> {
    string(args, "direction")?.parse()
}

fn magnitude(args: &Value) -> Result<u32, String> {
    match args.get("magnitude") {
        None | Some(Value::Null) => Ok(DEFAULT_SCROLL_MAGNITUDE),
        Some(_) => {
            let m = number(args, "magnitude")?;
            u32::try_from(m).map_err(|_| format!("magnitude {m} out of range"))
        }
    }
}

// ========================= Safety verdicts =========================

/// Read a verdict from either a bare decision string or an object carrying
/// `decision`/`action` and `explanation`/`reason`.
pub fn verdict_from_value(v: &Value) -> Option<SafetyVerdict> {
    match v {
        Value::String(s) => Some(SafetyVerdict {
            risk_level: RiskLevel::classify(s),
            reason: None,
        }),
        Value::Object(obj) => {
            let decision = obj
                .get("decision")
                .or_else(|| obj.get("action"))
                .and_then(Value::as_str)?;
            let reason = obj
                .get("explanation")
                .or_else(|| obj.get("reason"))
                .and_then(Value::as_str)
                .map(str::to_string);
            Some(SafetyVerdict {
                risk_level: RiskLevel::classify(decision),
                reason,
            })
        }
        _ => None,
    }
}

fn severity(level: RiskLevel) -> u8 {
    match level {
        RiskLevel::Allowed => 0,
        RiskLevel::RequireConfirmation => 1,
        RiskLevel::Blocked => 2,
    }
}

/// Keep whichever verdict is more restrictive.
pub fn stricter(current: Option<SafetyVerdict>, next: Option<SafetyVerdict>) -> Option<SafetyVerdict> {
    match (current, next) {
        (Some(a), Some(b)) => Some(if severity(b.risk_level) > severity(a.risk_level) { b } else { a }),
        (a, b) => a.or(b),
    }
}

/// Split a `safety_decision` argument off a function call.
pub fn take_safety_decision(args: &mut Value) -> Option<SafetyVerdict> {
    let obj: &mut Map<String, Value> = args.as_object_mut()?;
    let raw = obj.remove("safety_decision")?;
    verdict_from_value(&raw)
}

// ========================= Prompt context =========================

/// Render executed actions as text, oldest first.
pub fn history_lines(history: &[HistoryEntry]) -> Vec<String> {
    history
        .iter()
        .filter_map(|entry| match entry {
            HistoryEntry::Outcome {
                action,
                success: true,
                ..
            } => Some(format!("Executed {action} - Success")),
            HistoryEntry::Outcome { action, error, .. } => Some(format!(
                "Executed {action} - Error: {}",
                error.as_deref().unwrap_or("unknown error")
            )),
            HistoryEntry::Proposal { .. } => None,
        })
        .collect()
}

/// Context block for stateless planners: task, recent actions, then the
/// screen marker the attached image follows.
pub fn context_text(task: &str, history: &[HistoryEntry]) -> String {
    let lines = history_lines(history);
    let mut out = format!("Task: {task}\n");
    if !lines.is_empty() {
        out.push_str("\nPrevious actions:\n");
        let start = lines.len().saturating_sub(HISTORY_WINDOW);
        for line in &lines[start..] {
            out.push_str("- ");
            out.push_str(line);
            out.push('\n');
        }
    }
    out.push_str("\nCurrent screen:");
    out
}

/// PNG bytes for upload, downscaled to at most `max_width` pixels wide.
pub fn prepare_screenshot(shot: &Screenshot, max_width: u32) -> Result<Vec<u8>, PlannerError> {
    if max_width == 0 || shot.width <= max_width {
        return Ok(shot.png.clone());
    }
    let img = image::load_from_memory(&shot.png)
        .map_err(|e| PlannerError::Image(e.to_string()))?
        .to_rgba8();
    let height = ((img.height() as f64 * max_width as f64 / img.width() as f64).round() as u32).max(1);
    let resized = image::imageops::resize(&img, max_width, height, FilterType::Lanczos3);

    let mut png = Vec::new();
    PngEncoder::new(&mut png)
        .write_image(resized.as_raw(), max_width, height, ColorType::Rgba8)
        .map_err(|e| PlannerError::Image(e.to_string()))?;
    debug!(
        from = %format!("{}x{}", shot.width, shot.height),
        to = %format!("{max_width}x{height}"),
        bytes = png.len(),
        "downscaled screenshot"
    );
    Ok(png)
}

// ========================= Tool schemas =========================

fn coords_schema(props: &mut Map<String, Value>, x: &str, y: &str, what: &str) {
    props.insert(
        x.into(),
        json!({"type": "integer", "description": format!("{what} X coordinate (0-999 normalized)")}),
    );
    props.insert(
        y.into(),
        json!({"type": "integer", "description": format!("{what} Y coordinate (0-999 normalized)")}),
    );
}

fn scroll_schema(props: &mut Map<String, Value>) {
    props.insert(
        "direction".into(),
        json!({"type": "string", "enum": ["up", "down", "left", "right"], "description": "Direction to scroll"}),
    );
    props.insert(
        "magnitude".into(),
        json!({"type": "integer", "default": DEFAULT_SCROLL_MAGNITUDE, "description": "Scroll amount, applied as page or arrow key repeats"}),
    );
}

/// JSON-schema tool declarations for every desktop action not in `excluded`.
pub fn tool_schemas(excluded: &[String]) -> Vec<Value> {
    DESKTOP_ACTIONS
        .iter()
        .filter(|name| !excluded.iter().any(|e| e == *name))
        .map(|&name| {
            let mut props = Map::new();
            let (description, required): (&str, Vec<&str>) = match name {
                "click_at" => {
                    coords_schema(&mut props, "x", "y", "Click");
                    ("Click at specified coordinates on the screen.", vec!["x", "y"])
                }
                "double_click_at" => {
                    coords_schema(&mut props, "x", "y", "Double-click");
                    ("Double-click at specified coordinates on the screen.", vec!["x", "y"])
                }
                "hover_at" => {
                    coords_schema(&mut props, "x", "y", "Hover");
                    ("Move the mouse cursor to the specified coordinates.", vec!["x", "y"])
                }
                "type_text_at" => {
                    coords_schema(&mut props, "x", "y", "Focus click");
                    props.insert("text".into(), json!({"type": "string", "description": "Text to type"}));
                    props.insert(
                        "press_enter".into(),
                        json!({"type": "boolean", "default": false, "description": "Press Enter after typing"}),
                    );
                    props.insert(
                        "clear_before_typing".into(),
                        json!({"type": "boolean", "default": false, "description": "Clear existing text (Ctrl+A, Delete) first"}),
                    );
                    ("Click at the coordinates, then type text.", vec!["x", "y", "text"])
                }
                "key_combination" => {
                    props.insert(
                        "keys".into(),
                        json!({"type": "string", "description": "Key combination, e.g. 'control+c' or 'alt+f4'"}),
                    );
                    ("Press a keyboard shortcut or combination.", vec!["keys"])
                }
                "scroll_document" => {
                    scroll_schema(&mut props);
                    ("Scroll the focused document.", vec!["direction"])
                }
                "scroll_at" => {
                    coords_schema(&mut props, "x", "y", "Scroll");
                    scroll_schema(&mut props);
                    ("Scroll at specific coordinates on the screen.", vec!["x", "y", "direction"])
                }
                "drag_and_drop" => {
                    coords_schema(&mut props, "x", "y", "Start");
                    coords_schema(&mut props, "destination_x", "destination_y", "End");
                    (
                        "Drag from one location and drop at another.",
                        vec!["x", "y", "destination_x", "destination_y"],
                    )
                }
                _ => ("Wait for 5 seconds for loads or animations to finish.", vec![]),
            };
            json!({
                "name": name,
                "description": description,
                "input_schema": {
                    "type": "object",
                    "properties": props,
                    "required": required,
                }
            })
        })
        .collect()
}
