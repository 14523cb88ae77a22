pub mod agent;
pub mod anthropic;
pub mod config;
pub mod coords;
pub mod credentials;
pub mod gemini;
pub mod keys;
pub mod mcp;
pub mod planner;
pub mod recorder;
pub mod rfb;
pub mod safety;
pub mod service;
pub mod store;
pub mod vnc;

pub use agent::{Agent, AgentConfig, AgentError, Progress, RunStatus, RunSummary, SessionState};
pub use anthropic::AnthropicPlanner;
pub use config::Settings;
pub use gemini::GeminiPlanner;
pub use mcp::McpServer;
pub use safety::{Decision, RiskLevel, SafetyVerdict};
pub use service::{AgentService, ExecuteRequest, ResumeRequest};
pub use vnc::{VncConnector, VncDisplay};
