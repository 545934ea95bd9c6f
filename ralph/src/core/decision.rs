//! End-of-cycle exit decision.

use serde::Serialize;

/// What a finished cycle observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleFacts {
    pub aborted: bool,
    pub completed: bool,
    /// Scoped backlog has no remaining items after the agent ran.
    pub backlog_done: bool,
    pub validation_green: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleDecision {
    Abort,
    /// Backlog done and validation green.
    BacklogComplete,
    /// Backlog done but validation red: keep going in stabilize mode.
    SelfFix,
    /// Completion marker seen and validation green.
    MarkerComplete,
    /// Completion marker seen but validation red.
    MarkerRejected,
    Continue,
}

impl CycleDecision {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Abort => "abort",
            Self::BacklogComplete => "backlog_complete",
            Self::SelfFix => "self_fix",
            Self::MarkerComplete => "marker_complete",
            Self::MarkerRejected => "marker_rejected",
            Self::Continue => "continue",
        }
    }
}

/// Apply the stop rules in their fixed order.
pub fn decide(facts: CycleFacts) -> CycleDecision {
    if facts.aborted {
        return CycleDecision::Abort;
    }
    if facts.backlog_done {
        return if facts.validation_green {
            CycleDecision::BacklogComplete
        } else {
            CycleDecision::SelfFix
        };
    }
    if facts.completed {
        return if facts.validation_green {
            CycleDecision::MarkerComplete
        } else {
            CycleDecision::MarkerRejected
        };
    }
    CycleDecision::Continue
}
