//! Shared deterministic types for the loop core.
//!
//! These types define the contracts between the selector, the marker
//! interpreter, the memory enforcer and the controller. They carry no I/O.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One unit of backlog work.
///
/// Unknown fields are preserved in `extra` so the loop can render them into the
/// prompt without understanding them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Absent or `null` sorts after every item that has a priority.
    #[serde(default)]
    pub priority: Option<f64>,
    pub passes: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Whether the cycle works on a real backlog item or on the synthetic
/// stabilization item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkMode {
    Feature,
    Stabilize,
}

impl WorkMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Feature => "feature",
            Self::Stabilize => "stabilize",
        }
    }
}

/// How the agent's transcript is shaped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputMode {
    #[default]
    Plain,
    StreamJson,
}

impl OutputMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::StreamJson => "stream-json",
        }
    }
}

/// When the external compaction command runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompactMode {
    #[default]
    Always,
    OnFailure,
    Off,
}

impl CompactMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Always => "always",
            Self::OnFailure => "on-failure",
            Self::Off => "off",
        }
    }

    /// `on-failure` fires on red validation or an observed abort.
    pub fn should_run(self, validation_exit: i32, aborted: bool) -> bool {
        match self {
            Self::Always => true,
            Self::OnFailure => validation_exit != 0 || aborted,
            Self::Off => false,
        }
    }
}

/// Operator preference for the agent transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportChoice {
    #[default]
    Auto,
    Pty,
    Pipe,
}

impl TransportChoice {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Pty => "pty",
            Self::Pipe => "pipe",
        }
    }
}

/// Error for an unrecognized enum spelling on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant {
    pub flag: &'static str,
    pub value: String,
    pub expected: &'static str,
}

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid {} '{}' (expected one of: {})",
            self.flag, self.value, self.expected
        )
    }
}

impl std::error::Error for UnknownVariant {}

impl FromStr for OutputMode {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plain" => Ok(Self::Plain),
            "stream-json" => Ok(Self::StreamJson),
            other => Err(UnknownVariant {
                flag: "agent output mode",
                value: other.to_string(),
                expected: "plain, stream-json",
            }),
        }
    }
}

impl FromStr for CompactMode {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "always" => Ok(Self::Always),
            "on-failure" => Ok(Self::OnFailure),
            "off" => Ok(Self::Off),
            other => Err(UnknownVariant {
                flag: "compact mode",
                value: other.to_string(),
                expected: "always, on-failure, off",
            }),
        }
    }
}

impl FromStr for TransportChoice {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "pty" => Ok(Self::Pty),
            "pipe" => Ok(Self::Pipe),
            other => Err(UnknownVariant {
                flag: "agent transport",
                value: other.to_string(),
                expected: "auto, pty, pipe",
            }),
        }
    }
}

/// Reason code attached to a synthetic memory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    Progressed,
    ValidationFailed,
    AgentTimeout,
    Abort,
    StabilizedValidation,
}

impl ReasonCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Progressed => "progressed",
            Self::ValidationFailed => "validation_failed",
            Self::AgentTimeout => "agent_timeout",
            Self::Abort => "abort",
            Self::StabilizedValidation => "stabilized_validation",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of scanning agent output for markers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MarkerScan {
    pub aborted: bool,
    pub completed: bool,
}
