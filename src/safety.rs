//! Planner risk verdicts and the human-in-the-loop gate.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Allowed,
    RequireConfirmation,
    Blocked,
}

impl RiskLevel {
    /// Classify a raw decision string reported by a planner.
    pub fn classify(raw: &str) -> Self {
        let lower = raw.trim().to_lowercase();
        if lower.contains("confirm") {
            RiskLevel::RequireConfirmation
        } else if matches!(lower.as_str(), "block" | "blocked" | "deny" | "reject") {
            RiskLevel::Blocked
        } else {
            RiskLevel::Allowed
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyVerdict {
    pub risk_level: RiskLevel,
    pub reason: Option<String>,
}

impl SafetyVerdict {
    pub fn new(risk_level: RiskLevel, reason: impl Into<String>) -> Self {
        Self {
            risk_level,
            reason: Some(reason.into()),
        }
    }

    pub fn reason_or_default(&self) -> &str {
        self.reason.as_deref().unwrap_or("unspecified")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Deny,
}

impl std::str::FromStr for Decision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "approve" | "approved" | "yes" | "y" => Ok(Decision::Approve),
            "deny" | "denied" | "no" | "n" => Ok(Decision::Deny),
            other => Err(format!("unknown decision {other:?} (expected approve or deny)")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GateState {
    #[default]
    Clear,
    AwaitingApproval,
    Approved,
    Denied,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("safety gate is {0:?}, not awaiting approval")]
pub struct NotAwaiting(pub GateState);

/// Once-per-turn gate between a proposal and its execution.
///
/// The gate never times out on its own: an `AwaitingApproval` gate stays that
/// way until [`SafetyGate::decide`] is called.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyGate {
    state: GateState,
    reason: Option<String>,
}

impl SafetyGate {
    pub fn state(&self) -> GateState {
        self.state
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn is_awaiting(&self) -> bool {
        self.state == GateState::AwaitingApproval
    }

    /// Inspect the verdict of a fresh proposal. Only valid from `Clear`;
    /// any other state is reset first since a new turn has begun.
    pub fn inspect(&mut self, verdict: Option<&SafetyVerdict>) -> GateState {
        self.reset();
        if let Some(v) = verdict {
            match v.risk_level {
                RiskLevel::RequireConfirmation => {
                    self.state = GateState::AwaitingApproval;
                    self.reason = v.reason.clone();
                }
                RiskLevel::Blocked => {
                    self.state = GateState::Denied;
                    self.reason = v.reason.clone();
                }
                RiskLevel::Allowed => {}
            }
        }
        self.state
    }

    pub fn decide(&mut self, decision: Decision) -> Result<GateState, NotAwaiting> {
        if self.state != GateState::AwaitingApproval {
            return Err(NotAwaiting(self.state));
        }
        self.state = match decision {
            Decision::Approve => GateState::Approved,
            Decision::Deny => GateState::Denied,
        };
        Ok(self.state)
    }

    pub fn reset(&mut self) {
        self.state = GateState::Clear;
        self.reason = None;
    }
}
