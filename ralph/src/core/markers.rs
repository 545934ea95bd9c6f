//! Marker interpretation over agent transcripts.
//!
//! Which artifact is scanned and how a marker must appear depends only on the
//! output mode, so the decision lives in one table ([`rule_for`]).

use serde::{Deserialize, Serialize};

use crate::core::stream::AgentUsage;
use crate::core::types::{MarkerScan, OutputMode};

pub const DEFAULT_COMPLETE_MARKER: &str = "<promise>COMPLETE</promise>";
pub const DEFAULT_ALTERNATE_COMPLETE_MARKER: &str = "<promise>NO MORE TASKS</promise>";
pub const DEFAULT_ABORT_MARKER: &str = "<promise>ABORT</promise>";

/// The three literal control strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Markers {
    pub complete: String,
    pub alternate_complete: String,
    pub abort: String,
}

impl Default for Markers {
    fn default() -> Self {
        Self {
            complete: DEFAULT_COMPLETE_MARKER.to_string(),
            alternate_complete: DEFAULT_ALTERNATE_COMPLETE_MARKER.to_string(),
            abort: DEFAULT_ABORT_MARKER.to_string(),
        }
    }
}

/// Transcript artifact a marker may be read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    RawLog,
    AssistantText,
    FinalResult,
}

/// How a marker must appear inside the artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchRule {
    /// The marker is the whole line (a trailing `\r` is ignored).
    FullLine,
    Substring,
}

impl MatchRule {
    pub fn matches(self, haystack: &str, marker: &str) -> bool {
        if marker.is_empty() {
            return false;
        }
        match self {
            Self::FullLine => haystack
                .split('\n')
                .any(|line| line.strip_suffix('\r').unwrap_or(line) == marker),
            Self::Substring => haystack.contains(marker),
        }
    }
}

/// The artifact and match rule used for a given output mode.
pub fn rule_for(mode: OutputMode) -> (ArtifactKind, MatchRule) {
    match mode {
        OutputMode::Plain => (ArtifactKind::RawLog, MatchRule::FullLine),
        OutputMode::StreamJson => (ArtifactKind::FinalResult, MatchRule::Substring),
    }
}

/// The text artifacts produced by one agent run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentTranscript {
    pub raw_log: String,
    pub assistant_text: String,
    pub final_result: String,
    /// Only populated in stream-json mode.
    pub usage: AgentUsage,
}

impl AgentTranscript {
    pub fn artifact(&self, kind: ArtifactKind) -> &str {
        match kind {
            ArtifactKind::RawLog => &self.raw_log,
            ArtifactKind::AssistantText => &self.assistant_text,
            ArtifactKind::FinalResult => &self.final_result,
        }
    }
}

impl Markers {
    pub fn is_aborted(&self, transcript: &AgentTranscript, mode: OutputMode) -> bool {
        let (kind, rule) = rule_for(mode);
        rule.matches(transcript.artifact(kind), &self.abort)
    }

    pub fn is_completed(&self, transcript: &AgentTranscript, mode: OutputMode) -> bool {
        let (kind, rule) = rule_for(mode);
        let text = transcript.artifact(kind);
        rule.matches(text, &self.complete) || rule.matches(text, &self.alternate_complete)
    }

    /// Abort wins: when it is set, `completed` is reported as false.
    pub fn classify(&self, transcript: &AgentTranscript, mode: OutputMode) -> MarkerScan {
        let aborted = self.is_aborted(transcript, mode);
        MarkerScan {
            aborted,
            completed: !aborted && self.is_completed(transcript, mode),
        }
    }
}
