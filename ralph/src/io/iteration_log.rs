//! Per-iteration artifacts under `<runtime>/iterations/<run_id>/<i>/`.
//!
//! Artifacts are product output: always written, never cleaned up by the loop.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;

use crate::core::decision::CycleDecision;
use crate::core::memory::MemoryTier;
use crate::core::stream::TokenUsage;
use crate::core::types::{ReasonCode, WorkMode};
use crate::io::transport::TransportKind;

/// Identity of one loop invocation: `run-<UTC timestamp>-<pid>`.
pub fn new_run_id() -> String {
    format!(
        "run-{}-{}",
        Utc::now().format("%Y%m%dT%H%M%SZ"),
        std::process::id()
    )
}

/// RFC 3339 UTC timestamp with second precision.
pub fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[derive(Debug, Clone, Serialize)]
pub struct IterationMeta {
    pub run_id: String,
    pub iteration: u32,
    pub item_id: String,
    pub work_mode: WorkMode,
    /// `None` when no agent ran (the pre-loop validation).
    pub transport: Option<TransportKind>,
    pub agent_exit_code: Option<i32>,
    pub timed_out: bool,
    /// `None` when validation was skipped after an abort.
    pub validation_exit_code: Option<i32>,
    pub aborted: bool,
    pub completed: bool,
    /// Memory files that received a synthetic entry, and why.
    pub fallback: BTreeMap<MemoryTier, ReasonCode>,
    pub compact_exit_code: Option<i32>,
    pub decision: Option<CycleDecision>,
    /// Reported by stream-json agents only.
    pub token_usage: Option<TokenUsage>,
    pub token_model: Option<String>,
    pub cost_usd: Option<f64>,
    pub started_at: String,
    pub ended_at: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterationPaths {
    pub dir: PathBuf,
    pub prompt_path: PathBuf,
    pub agent_log_path: PathBuf,
    pub assistant_path: PathBuf,
    pub result_path: PathBuf,
    pub validate_log_path: PathBuf,
    pub compact_log_path: PathBuf,
    pub pre_iteration_log_path: PathBuf,
    pub hooks_log_path: PathBuf,
    pub meta_path: PathBuf,
}

impl IterationPaths {
    pub fn new(runtime_dir: &Path, run_id: &str, iteration: u32) -> Self {
        let dir = runtime_dir
            .join("iterations")
            .join(run_id)
            .join(iteration.to_string());
        Self {
            prompt_path: dir.join("prompt.md"),
            agent_log_path: dir.join("agent.log"),
            assistant_path: dir.join("agent.assistant.txt"),
            result_path: dir.join("agent.result.txt"),
            validate_log_path: dir.join("validate.log"),
            compact_log_path: dir.join("compact.log"),
            pre_iteration_log_path: dir.join("pre-iteration.log"),
            hooks_log_path: dir.join("hooks.log"),
            meta_path: dir.join("meta.json"),
            dir,
        }
    }

    pub fn create(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create iteration dir {}", self.dir.display()))
    }
}

pub fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

pub fn write_meta(paths: &IterationPaths, meta: &IterationMeta) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(meta).context("serialize iteration meta")?;
    buf.push('\n');
    write_text(&paths.meta_path, &buf)
}
