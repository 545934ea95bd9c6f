//! Memory-tier rules: reason precedence and fallback entry templates.
//!
//! The enforcer in `io::memory` decides *whether* a tier needs a synthetic
//! entry; this module decides *what* that entry says.

use serde::Serialize;

use crate::core::types::{ReasonCode, WorkMode};

/// One of the three knowledge files that must change every iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryTier {
    Guardrails,
    Style,
    Recent,
}

impl MemoryTier {
    pub const ALL: [MemoryTier; 3] = [Self::Guardrails, Self::Style, Self::Recent];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Guardrails => "guardrails",
            Self::Style => "style",
            Self::Recent => "recent",
        }
    }

    /// Content written when the file is first created.
    pub fn header(self) -> &'static str {
        match self {
            Self::Guardrails => "# Guardrails\n\nRules and warnings learned during development.\n",
            Self::Style => "# Style\n\nPatterns and preferences for this codebase.\n",
            Self::Recent => "# Recent\n\nRecent development activity summaries.\n",
        }
    }
}

/// Inputs to reason-code selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReasonInputs {
    pub timed_out: bool,
    pub aborted: bool,
    /// `None` when validation was skipped.
    pub validation_exit: Option<i32>,
    pub work_mode: WorkMode,
}

/// timeout > abort > validation failure > stabilize mode > progressed.
pub fn choose_reason(inputs: ReasonInputs) -> ReasonCode {
    if inputs.timed_out {
        ReasonCode::AgentTimeout
    } else if inputs.aborted {
        ReasonCode::Abort
    } else if inputs.validation_exit.is_some_and(|code| code != 0) {
        ReasonCode::ValidationFailed
    } else if inputs.work_mode == WorkMode::Stabilize {
        ReasonCode::StabilizedValidation
    } else {
        ReasonCode::Progressed
    }
}

/// Everything a fallback entry may mention.
#[derive(Debug, Clone)]
pub struct FallbackContext<'a> {
    /// RFC 3339 UTC timestamp.
    pub timestamp: &'a str,
    pub iteration: u32,
    pub item_id: &'a str,
    pub item_title: &'a str,
    pub work_mode: WorkMode,
    pub agent_exit: i32,
    /// `None` when validation was skipped after an abort.
    pub validation_exit: Option<i32>,
    pub reason: ReasonCode,
    pub validation_cmd: Option<&'a str>,
    /// Condensed validation failure lines; empty when validation passed.
    pub failure_excerpt: &'a [String],
    /// Directory holding this iteration's artifacts, for the operator.
    pub artifact_dir: &'a str,
}

/// Render the synthetic entry for `tier`. Starts with a blank line and ends with `\n`.
pub fn render_fallback(tier: MemoryTier, ctx: &FallbackContext<'_>) -> String {
    let mut lines: Vec<String> = vec![String::new()];
    match tier {
        MemoryTier::Guardrails => {
            lines.push(format!(
                "## {} Iteration {} ({})",
                ctx.timestamp, ctx.iteration, ctx.item_id
            ));
            if !ctx.item_title.is_empty() {
                lines.push(format!("- Scope item: {}", ctx.item_title));
            }
            lines.push(format!("- Reason: {}", ctx.reason));
            lines.push(format!("- {}", guardrail_rule(ctx.reason)));
            if ctx.reason == ReasonCode::ValidationFailed && !ctx.failure_excerpt.is_empty() {
                lines.push("- Validation failure excerpt:".to_string());
                for line in ctx.failure_excerpt {
                    lines.push(format!("  - {line}"));
                }
            }
        }
        MemoryTier::Style => {
            lines.push(format!(
                "## {} Iteration {} ({})",
                ctx.timestamp, ctx.iteration, ctx.item_id
            ));
            lines.push("- Prefer one logical change per commit.".to_string());
            lines.push(match ctx.validation_cmd {
                Some(cmd) => {
                    format!("- Keep the validation command green before committing: {cmd}")
                }
                None => "- No validation command configured; verify changes before committing."
                    .to_string(),
            });
        }
        MemoryTier::Recent => {
            lines.push(format!("## {} Iteration {}", ctx.timestamp, ctx.iteration));
            if ctx.item_title.is_empty() {
                lines.push(format!("- Item: {}", ctx.item_id));
            } else {
                lines.push(format!("- Item: {} - {}", ctx.item_id, ctx.item_title));
            }
            lines.push(format!("- Mode: {}", ctx.work_mode.as_str()));
            lines.push(format!("- Agent exit code: {}", ctx.agent_exit));
            let validation = match ctx.validation_exit {
                Some(0) => "pass",
                Some(_) => "fail",
                None => "skipped",
            };
            lines.push(format!("- Validation: {validation}"));
            lines.push(format!("- Outcome: {}", ctx.reason));
        }
    }
    lines.push(format!("- Runtime logs: {}", ctx.artifact_dir));
    let mut entry = lines.join("\n");
    entry.push('\n');
    entry
}

fn guardrail_rule(reason: ReasonCode) -> &'static str {
    match reason {
        ReasonCode::ValidationFailed => {
            "Do not move to a new backlog item while validation is red."
        }
        ReasonCode::AgentTimeout => {
            "Agent exceeded the iteration timeout; reduce scope and keep commits smaller."
        }
        ReasonCode::Abort => {
            "Abort means scope exceeded safety; reduce change size next iteration."
        }
        ReasonCode::StabilizedValidation => {
            "Backlog is done but validation was red; keep fixes minimal and re-run validation."
        }
        ReasonCode::Progressed => "Keep changes isolated and verifiable before commit.",
    }
}
