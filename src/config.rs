//! Environment-driven settings.
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `GEMINI_API_KEY` / `GOOGLE_API_KEY` | Gemini API key | none |
//! | `GEMINI_MODEL` | Gemini computer-use model | `gemini-2.5-computer-use-preview-10-2025` |
//! | `GEMINI_BASE_URL` | Gemini REST base | `https://generativelanguage.googleapis.com/v1beta` |
//! | `ANTHROPIC_API_KEY` | Anthropic API key | none |
//! | `ANTHROPIC_MODEL` | Anthropic model | `claude-haiku-4-5` |
//! | `ANTHROPIC_BASE_URL` | Anthropic REST base | `https://api.anthropic.com/v1` |
//! | `VNC_AGENT_RUNS_DIR` | Run recordings | `runs` |
//! | `VNC_AGENT_STATE_DIR` | Suspended sessions | `<runs>/.sessions` |
//! | `VNC_AGENT_CREDENTIALS` | netrc-style credential file | `~/.vnc_credentials` |
//! | `VNC_AGENT_SCREENSHOT_WIDTH` | Max screenshot width sent to planners | `512` |
//! | `VNC_AGENT_KEYRING` | Look up credentials in the OS keyring first (`0` turns it off) | on |

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::agent::RunLimits;

// ============================================================================
// Defaults
// ============================================================================

pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-computer-use-preview-10-2025";
pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_ANTHROPIC_MODEL: &str = "claude-haiku-4-5";
pub const DEFAULT_ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";
pub const DEFAULT_RUNS_DIR: &str = "runs";
pub const DEFAULT_STATE_SUBDIR: &str = ".sessions";
pub const DEFAULT_CREDENTIALS_FILE: &str = ".vnc_credentials";
pub const DEFAULT_SCREENSHOT_WIDTH: u32 = 512;
pub const DEFAULT_STEP_LIMIT: usize = 40;
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 300;

// ============================================================================
// Environment Variable Names
// ============================================================================

pub const ENV_GEMINI_API_KEY: &str = "GEMINI_API_KEY";
pub const ENV_GOOGLE_API_KEY: &str = "GOOGLE_API_KEY";
pub const ENV_GEMINI_MODEL: &str = "GEMINI_MODEL";
pub const ENV_GEMINI_BASE_URL: &str = "GEMINI_BASE_URL";
pub const ENV_ANTHROPIC_API_KEY: &str = "ANTHROPIC_API_KEY";
pub const ENV_ANTHROPIC_MODEL: &str = "ANTHROPIC_MODEL";
pub const ENV_ANTHROPIC_BASE_URL: &str = "ANTHROPIC_BASE_URL";
pub const ENV_RUNS_DIR: &str = "VNC_AGENT_RUNS_DIR";
pub const ENV_STATE_DIR: &str = "VNC_AGENT_STATE_DIR";
pub const ENV_CREDENTIALS_FILE: &str = "VNC_AGENT_CREDENTIALS";
pub const ENV_SCREENSHOT_WIDTH: &str = "VNC_AGENT_SCREENSHOT_WIDTH";
pub const ENV_KEYRING: &str = "VNC_AGENT_KEYRING";

// ============================================================================
// Settings
// ============================================================================

/// Endpoint settings for one planner backend.
#[derive(Clone)]
pub struct PlannerSettings {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
}

impl fmt::Debug for PlannerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlannerSettings")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl PlannerSettings {
    pub fn gemini_from_env() -> Self {
        Self {
            api_key: non_empty_var(ENV_GEMINI_API_KEY).or_else(|| non_empty_var(ENV_GOOGLE_API_KEY)),
            model: env::var(ENV_GEMINI_MODEL).unwrap_or_else(|_| DEFAULT_GEMINI_MODEL.to_string()),
            base_url: env::var(ENV_GEMINI_BASE_URL)
                .unwrap_or_else(|_| DEFAULT_GEMINI_BASE_URL.to_string()),
        }
    }

    pub fn anthropic_from_env() -> Self {
        Self {
            api_key: non_empty_var(ENV_ANTHROPIC_API_KEY),
            model: env::var(ENV_ANTHROPIC_MODEL)
                .unwrap_or_else(|_| DEFAULT_ANTHROPIC_MODEL.to_string()),
            base_url: env::var(ENV_ANTHROPIC_BASE_URL)
                .unwrap_or_else(|_| DEFAULT_ANTHROPIC_BASE_URL.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub gemini: PlannerSettings,
    pub anthropic: PlannerSettings,
    pub runs_dir: PathBuf,
    pub state_dir: PathBuf,
    pub credentials_file: PathBuf,
    pub keyring_enabled: bool,
    pub screenshot_max_width: u32,
    pub limits: RunLimits,
    pub hitl_enabled: bool,
}

impl Settings {
    /// Read every setting from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let runs_dir = env::var(ENV_RUNS_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_RUNS_DIR));
        let state_dir = env::var(ENV_STATE_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| runs_dir.join(DEFAULT_STATE_SUBDIR));
        let credentials_file = env::var(ENV_CREDENTIALS_FILE)
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_credentials_file());
        Self {
            gemini: PlannerSettings::gemini_from_env(),
            anthropic: PlannerSettings::anthropic_from_env(),
            runs_dir,
            state_dir,
            credentials_file,
            keyring_enabled: env::var(ENV_KEYRING)
                .map(|v| flag_enabled(&v))
                .unwrap_or(true),
            screenshot_max_width: parse_var(ENV_SCREENSHOT_WIDTH)
                .filter(|w: &u32| *w > 0)
                .unwrap_or(DEFAULT_SCREENSHOT_WIDTH),
            limits: RunLimits {
                step_limit: DEFAULT_STEP_LIMIT,
                timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            },
            hitl_enabled: true,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_env()
    }
}

fn default_credentials_file() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(DEFAULT_CREDENTIALS_FILE))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CREDENTIALS_FILE))
}

fn flag_enabled(value: &str) -> bool {
    !matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "0" | "false" | "no" | "off"
    )
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|s| s.trim().parse().ok())
}
