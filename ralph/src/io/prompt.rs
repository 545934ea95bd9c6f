//! Prompt builder for one iteration.
//!
//! The operator's template is emitted verbatim first, followed by the loop's
//! own sections rendered from a built-in minijinja template. Rendering is pure;
//! reading the inputs from disk is left to the caller.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::markers::Markers;
use crate::core::types::{WorkItem, WorkMode};
use crate::io::git::CommitEntry;
use crate::io::memory::MemoryTails;

const ITERATION_TEMPLATE: &str = include_str!("prompts/iteration.md");

/// Backlog item as shown to the agent.
#[derive(Debug, Clone, Serialize)]
struct ItemContext {
    id: String,
    title: String,
    description: String,
    priority: Option<f64>,
    passes: bool,
}

impl ItemContext {
    fn from_item(item: &WorkItem) -> Self {
        Self {
            id: item.id.clone(),
            title: item.title.trim().to_string(),
            description: item.description.trim().to_string(),
            priority: item.priority,
            passes: item.passes,
        }
    }
}

/// Display names for the files the agent is told to touch.
#[derive(Debug, Clone)]
pub struct PromptFiles<'a> {
    pub prd_file: &'a str,
    pub progress_file: &'a str,
    pub guardrails_file: &'a str,
    pub style_file: &'a str,
    pub recent_file: &'a str,
}

/// All inputs needed to build a prompt.
#[derive(Debug, Clone)]
pub struct PromptInputs<'a> {
    /// Operator template, emitted verbatim.
    pub template: &'a str,
    pub run_id: &'a str,
    pub iteration: u32,
    pub max_iterations: u32,
    pub work_mode: WorkMode,
    pub project: Option<&'a str>,
    /// Scoped backlog in document order.
    pub backlog: &'a [&'a WorkItem],
    pub selected: &'a WorkItem,
    /// Remaining items to embed for self-selection; empty embeds only `selected`.
    pub remaining: &'a [&'a WorkItem],
    pub remaining_count: usize,
    pub progress_tail: &'a str,
    pub progress_tail_lines: usize,
    pub memory: &'a MemoryTails,
    pub rules: Option<&'a str>,
    pub commits: &'a [CommitEntry],
    pub commit_tag: &'a str,
    pub validation_cmd: Option<&'a str>,
    /// Output of the last red validation; empty after a green one.
    pub last_failure: &'a str,
    pub markers: &'a Markers,
    pub files: PromptFiles<'a>,
}

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("iteration.md", ITERATION_TEMPLATE)
            .context("load iteration prompt template")?;
        Ok(Self { env })
    }

    fn render(&self, input: &PromptInputs<'_>) -> Result<String> {
        let backlog: Vec<ItemContext> = input
            .backlog
            .iter()
            .map(|item| ItemContext::from_item(item))
            .collect();
        let remaining: Vec<ItemContext> = input
            .remaining
            .iter()
            .map(|item| ItemContext::from_item(item))
            .collect();
        let commits: Vec<String> = input.commits.iter().map(CommitEntry::render).collect();
        let last_failure = Some(input.last_failure.trim_end()).filter(|s| !s.trim().is_empty());
        let template = self.env.get_template("iteration.md")?;
        let rendered = template.render(context! {
            template => input.template.trim_end(),
            run_id => input.run_id,
            iteration => input.iteration,
            max_iterations => input.max_iterations,
            work_mode => input.work_mode.as_str(),
            stabilize => input.work_mode == WorkMode::Stabilize,
            project => input.project.map(str::trim).filter(|s| !s.is_empty()),
            backlog => backlog,
            scoped_count => input.backlog.len(),
            remaining_count => input.remaining_count,
            self_select => !remaining.is_empty() && input.work_mode == WorkMode::Feature,
            remaining => remaining,
            selected => ItemContext::from_item(input.selected),
            progress_file => input.files.progress_file,
            progress_tail => input.progress_tail.trim_end(),
            progress_tail_lines => input.progress_tail_lines,
            guardrails => input.memory.guardrails.trim_end(),
            style => input.memory.style.trim_end(),
            recent => input.memory.recent.trim_end(),
            rules => input.rules.map(str::trim).filter(|s| !s.is_empty()),
            commits => commits,
            commit_tag => input.commit_tag,
            validation_cmd => input.validation_cmd,
            last_failure => last_failure,
            prd_file => input.files.prd_file,
            guardrails_file => input.files.guardrails_file,
            style_file => input.files.style_file,
            recent_file => input.files.recent_file,
            complete_marker => &input.markers.complete,
            alternate_complete_marker => &input.markers.alternate_complete,
            abort_marker => &input.markers.abort,
        })?;
        Ok(rendered)
    }
}

/// Render the full prompt text.
pub fn build_prompt(input: &PromptInputs<'_>) -> Result<String> {
    let mut prompt = PromptEngine::new()?
        .render(input)
        .context("render iteration prompt")?;
    prompt.push('\n');
    Ok(prompt)
}

/// Read file contents if it exists, returning `None` for missing files.
pub fn read_optional(path: &Path) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("read prompt input {}", path.display()))?;
    Ok(Some(contents))
}
