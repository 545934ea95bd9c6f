//! Loop configuration: defaults, optional `.ralph/config.toml`, CLI overrides.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::core::markers::Markers;
use crate::core::selector::ScopeFilter;
use crate::core::types::{CompactMode, OutputMode, TransportChoice};

pub const DEFAULT_CONFIG_PATH: &str = ".ralph/config.toml";

/// Configuration problem detected before any iteration runs.
///
/// The binary maps this error to its own exit code, so callers should return it
/// (wrapped in `anyhow::Error`) rather than a plain message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub message: String,
}

impl ConfigError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "configuration error: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

/// Best-effort maintenance hook run after compaction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HookConfig {
    pub name: String,
    /// Shell command; `{iteration}` and `{item_id}` are substituted.
    pub cmd: String,
}

/// Loop configuration (TOML).
///
/// Every field has a default so an empty or missing file is valid apart from
/// the agent command, which must come from somewhere.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoopConfig {
    /// Agent command line. May contain `{prompt_file}`; otherwise the prompt is piped on stdin.
    pub agent_cmd: String,
    pub validate_cmd: Option<String>,
    pub agent_output_mode: OutputMode,
    pub agent_transport: TransportChoice,
    /// Wall-clock limit per agent run; 0 disables it.
    pub agent_timeout_seconds: u64,
    pub prd_file: PathBuf,
    /// Allow-list of backlog ids; empty means the whole backlog.
    pub prd_ids: Vec<String>,
    pub progress_file: PathBuf,
    pub prompt_template: PathBuf,
    pub max_iterations: u32,
    pub sleep_seconds: u64,
    pub markers: Markers,
    pub commit_feed_count: usize,
    pub commit_tag: String,
    pub progress_tail_lines: usize,
    pub memory_tail_lines: usize,
    pub memory_dir: PathBuf,
    /// Overrides for the individual memory files; default to `memory_dir/<NAME>.md`.
    pub guardrails_file: Option<PathBuf>,
    pub style_file: Option<PathBuf>,
    pub recent_file: Option<PathBuf>,
    pub rules_file: Option<PathBuf>,
    pub compact_cmd: Option<String>,
    pub compact_mode: CompactMode,
    pub pre_iteration_cmd: Option<String>,
    /// Run once at exit; `{iteration}`, `{status}` and `{reason}` are substituted.
    pub notify_cmd: Option<String>,
    pub hooks: Vec<HookConfig>,
    pub runtime_dir: PathBuf,
    pub lock_file: PathBuf,
    /// Embed up to N remaining items in the prompt; 0 embeds only the selected one.
    pub prompt_prd_top_n: usize,
    /// Mirror agent output to the console while capturing it.
    pub echo: bool,
    /// Stop once the cost reported by a stream-json agent reaches this many dollars.
    pub cost_budget_usd: Option<f64>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            agent_cmd: String::new(),
            validate_cmd: None,
            agent_output_mode: OutputMode::Plain,
            agent_transport: TransportChoice::Auto,
            agent_timeout_seconds: 0,
            prd_file: PathBuf::from(".ralph/prd.json"),
            prd_ids: Vec::new(),
            progress_file: PathBuf::from(".ralph/progress.txt"),
            prompt_template: PathBuf::from(".ralph/agent-prompt.md"),
            max_iterations: 10,
            sleep_seconds: 2,
            markers: Markers::default(),
            commit_feed_count: 10,
            commit_tag: "RALPH".to_string(),
            progress_tail_lines: 200,
            memory_tail_lines: 120,
            memory_dir: PathBuf::from(".agent"),
            guardrails_file: None,
            style_file: None,
            recent_file: None,
            rules_file: None,
            compact_cmd: Some("agent-recall compact".to_string()),
            compact_mode: CompactMode::Always,
            pre_iteration_cmd: None,
            notify_cmd: None,
            hooks: default_hooks(),
            runtime_dir: PathBuf::from(".ralph/runtime"),
            lock_file: PathBuf::from(".ralph/ralph.lock"),
            prompt_prd_top_n: 8,
            echo: false,
            cost_budget_usd: None,
        }
    }
}

fn default_hooks() -> Vec<HookConfig> {
    [
        (
            "archive-completed",
            "agent-recall ralph archive-completed --iteration {iteration}",
        ),
        ("rebuild-forecast", "agent-recall ralph rebuild-forecast"),
        (
            "refresh-context",
            "agent-recall ralph refresh-context --item {item_id} --iteration {iteration}",
        ),
    ]
    .into_iter()
    .map(|(name, cmd)| HookConfig {
        name: name.to_string(),
        cmd: cmd.to_string(),
    })
    .collect()
}

/// Command-line values that take precedence over the config file.
///
/// Enum-valued flags stay as strings here so a bad spelling surfaces as a
/// [`ConfigError`] instead of a usage error.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub agent_cmd: Option<String>,
    pub validate_cmd: Option<String>,
    pub agent_output_mode: Option<String>,
    pub agent_transport: Option<String>,
    pub agent_timeout_seconds: Option<u64>,
    pub prd_file: Option<PathBuf>,
    pub prd_ids: Option<String>,
    pub progress_file: Option<PathBuf>,
    pub prompt_template: Option<PathBuf>,
    pub max_iterations: Option<u32>,
    pub sleep_seconds: Option<u64>,
    pub complete_marker: Option<String>,
    pub alternate_complete_marker: Option<String>,
    pub abort_marker: Option<String>,
    pub commit_feed_count: Option<usize>,
    pub commit_tag: Option<String>,
    pub progress_tail_lines: Option<usize>,
    pub memory_tail_lines: Option<usize>,
    pub memory_dir: Option<PathBuf>,
    pub guardrails_file: Option<PathBuf>,
    pub style_file: Option<PathBuf>,
    pub recent_file: Option<PathBuf>,
    pub rules_file: Option<PathBuf>,
    pub compact_cmd: Option<String>,
    pub compact_mode: Option<String>,
    pub pre_iteration_cmd: Option<String>,
    pub notify_cmd: Option<String>,
    pub runtime_dir: Option<PathBuf>,
    pub lock_file: Option<PathBuf>,
    pub prompt_prd_top_n: Option<usize>,
    pub echo: bool,
    pub cost_budget_usd: Option<f64>,
}

/// Absolute locations of every file the loop touches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopPaths {
    pub root: PathBuf,
    pub prd_file: PathBuf,
    pub progress_file: PathBuf,
    pub prompt_template: PathBuf,
    pub runtime_dir: PathBuf,
    pub lock_file: PathBuf,
    pub guardrails: PathBuf,
    pub style: PathBuf,
    pub recent: PathBuf,
    pub rules: PathBuf,
}

impl LoopConfig {
    /// Layer `overrides` on top of this configuration.
    pub fn apply(&mut self, overrides: ConfigOverrides) -> Result<()> {
        fn set<T>(slot: &mut T, value: Option<T>) {
            if let Some(value) = value {
                *slot = value;
            }
        }

        set(&mut self.agent_cmd, overrides.agent_cmd);
        if let Some(cmd) = overrides.validate_cmd {
            self.validate_cmd = non_blank(cmd);
        }
        if let Some(raw) = overrides.agent_output_mode {
            self.agent_output_mode = raw
                .trim()
                .parse()
                .map_err(|err| ConfigError::new(format!("{err}")))?;
        }
        if let Some(raw) = overrides.agent_transport {
            self.agent_transport = raw
                .trim()
                .parse()
                .map_err(|err| ConfigError::new(format!("{err}")))?;
        }
        if let Some(raw) = overrides.compact_mode {
            self.compact_mode = raw
                .trim()
                .to_lowercase()
                .parse()
                .map_err(|err| ConfigError::new(format!("{err}")))?;
        }
        set(&mut self.agent_timeout_seconds, overrides.agent_timeout_seconds);
        set(&mut self.prd_file, overrides.prd_file);
        if let Some(raw) = overrides.prd_ids {
            self.prd_ids = ScopeFilter::parse(&raw)
                .ids()
                .into_iter()
                .map(str::to_string)
                .collect();
        }
        set(&mut self.progress_file, overrides.progress_file);
        set(&mut self.prompt_template, overrides.prompt_template);
        set(&mut self.max_iterations, overrides.max_iterations);
        set(&mut self.sleep_seconds, overrides.sleep_seconds);
        set(&mut self.markers.complete, overrides.complete_marker);
        set(
            &mut self.markers.alternate_complete,
            overrides.alternate_complete_marker,
        );
        set(&mut self.markers.abort, overrides.abort_marker);
        set(&mut self.commit_feed_count, overrides.commit_feed_count);
        set(&mut self.commit_tag, overrides.commit_tag);
        set(&mut self.progress_tail_lines, overrides.progress_tail_lines);
        set(&mut self.memory_tail_lines, overrides.memory_tail_lines);
        set(&mut self.memory_dir, overrides.memory_dir);
        if overrides.guardrails_file.is_some() {
            self.guardrails_file = overrides.guardrails_file;
        }
        if overrides.style_file.is_some() {
            self.style_file = overrides.style_file;
        }
        if overrides.recent_file.is_some() {
            self.recent_file = overrides.recent_file;
        }
        if overrides.rules_file.is_some() {
            self.rules_file = overrides.rules_file;
        }
        if let Some(cmd) = overrides.compact_cmd {
            self.compact_cmd = non_blank(cmd);
        }
        if let Some(cmd) = overrides.pre_iteration_cmd {
            self.pre_iteration_cmd = non_blank(cmd);
        }
        if let Some(cmd) = overrides.notify_cmd {
            self.notify_cmd = non_blank(cmd);
        }
        set(&mut self.runtime_dir, overrides.runtime_dir);
        set(&mut self.lock_file, overrides.lock_file);
        set(&mut self.prompt_prd_top_n, overrides.prompt_prd_top_n);
        self.echo |= overrides.echo;
        if overrides.cost_budget_usd.is_some() {
            self.cost_budget_usd = overrides.cost_budget_usd;
        }
        Ok(())
    }

    /// Checks that need nothing but the config values themselves.
    pub fn validate(&self) -> Result<()> {
        if self.agent_cmd.trim().is_empty() {
            return Err(ConfigError::new("agent command is required (--agent-cmd)").into());
        }
        if self.max_iterations == 0 {
            return Err(ConfigError::new("max iterations must be a positive integer").into());
        }
        if let Some(budget) = self.cost_budget_usd
            && !(budget.is_finite() && budget >= 0.0)
        {
            return Err(ConfigError::new(format!(
                "cost budget must be a non-negative number of dollars, got {budget}"
            ))
            .into());
        }
        for (name, marker) in [
            ("complete marker", &self.markers.complete),
            ("alternate complete marker", &self.markers.alternate_complete),
            ("abort marker", &self.markers.abort),
        ] {
            if marker.trim().is_empty() {
                return Err(ConfigError::new(format!("{name} must not be empty")).into());
            }
        }
        Ok(())
    }

    /// [`validate`](Self::validate) plus the files that must already exist under `root`.
    pub fn validate_files(&self, root: &Path) -> Result<()> {
        self.validate()?;
        let paths = self.paths(root);
        if !paths.prd_file.is_file() {
            return Err(ConfigError::new(format!(
                "backlog file not found: {}",
                paths.prd_file.display()
            ))
            .into());
        }
        if !paths.prompt_template.is_file() {
            return Err(ConfigError::new(format!(
                "prompt template not found: {}",
                paths.prompt_template.display()
            ))
            .into());
        }
        Ok(())
    }

    pub fn scope(&self) -> ScopeFilter {
        ScopeFilter::only(self.prd_ids.iter().cloned())
    }

    pub fn paths(&self, root: &Path) -> LoopPaths {
        let resolve = |path: &Path| -> PathBuf {
            if path.is_absolute() {
                path.to_path_buf()
            } else {
                root.join(path)
            }
        };
        let memory_file = |custom: &Option<PathBuf>, name: &str| -> PathBuf {
            match custom {
                Some(path) => resolve(path),
                None => resolve(&self.memory_dir.join(name)),
            }
        };
        LoopPaths {
            root: root.to_path_buf(),
            prd_file: resolve(&self.prd_file),
            progress_file: resolve(&self.progress_file),
            prompt_template: resolve(&self.prompt_template),
            runtime_dir: resolve(&self.runtime_dir),
            lock_file: resolve(&self.lock_file),
            guardrails: memory_file(&self.guardrails_file, "GUARDRAILS.md"),
            style: memory_file(&self.style_file, "STYLE.md"),
            recent: memory_file(&self.recent_file, "RECENT.md"),
            rules: memory_file(&self.rules_file, "RULES.md"),
        }
    }
}

fn non_blank(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Load config from a TOML file.
///
/// A missing file yields `LoopConfig::default()` unless `required` is set
/// (an explicit `--config` that does not exist is an error).
pub fn load_config(path: &Path, required: bool) -> Result<LoopConfig> {
    if !path.exists() {
        if required {
            return Err(
                ConfigError::new(format!("config file not found: {}", path.display())).into(),
            );
        }
        return Ok(LoopConfig::default());
    }
    let contents = fs::read_to_string(path)
        .map_err(|err| ConfigError::new(format!("read {}: {err}", path.display())))?;
    let cfg: LoopConfig = toml::from_str(&contents)
        .map_err(|err| ConfigError::new(format!("parse {}: {err}", path.display())))?;
    Ok(cfg)
}
