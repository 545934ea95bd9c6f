//! Test-only helpers: backlog items, scripted agent and validator, scratch workspaces.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;

use crate::core::types::WorkItem;
use crate::io::agent::{Agent, AgentExit, AgentRequest};
use crate::io::config::LoopConfig;
use crate::io::transport::TransportKind;
use crate::io::validation::{ValidationRequest, ValidationResult, Validator};

/// Create a deterministic work item with a generated title.
pub fn work_item(id: &str, priority: Option<f64>, passes: bool) -> WorkItem {
    WorkItem {
        id: id.to_string(),
        title: format!("{id} title"),
        description: String::new(),
        priority,
        passes,
        extra: serde_json::Map::new(),
    }
}

/// Workspace change applied while a scripted agent "runs".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEffect {
    /// Set `passes: true` on the backlog item with this id.
    MarkPassed(String),
    /// Append text to a file relative to the workspace root.
    Append { path: PathBuf, text: String },
}

/// One canned agent run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentTurn {
    pub output: String,
    pub exit_code: i32,
    pub timed_out: bool,
    pub effects: Vec<AgentEffect>,
}

impl AgentTurn {
    pub fn output(text: &str) -> Self {
        Self {
            output: text.to_string(),
            exit_code: 0,
            timed_out: false,
            effects: Vec::new(),
        }
    }

    pub fn timed_out(text: &str) -> Self {
        Self {
            exit_code: 124,
            timed_out: true,
            ..Self::output(text)
        }
    }

    pub fn mark_passed(mut self, id: &str) -> Self {
        self.effects.push(AgentEffect::MarkPassed(id.to_string()));
        self
    }

    pub fn append(mut self, path: &str, text: &str) -> Self {
        self.effects.push(AgentEffect::Append {
            path: PathBuf::from(path),
            text: text.to_string(),
        });
        self
    }
}

/// Agent that replays canned turns in order and fails once they run out.
#[derive(Debug)]
pub struct ScriptedAgent {
    turns: RefCell<VecDeque<AgentTurn>>,
    prompts: RefCell<Vec<String>>,
}

impl ScriptedAgent {
    pub fn new(turns: Vec<AgentTurn>) -> Self {
        Self {
            turns: RefCell::new(turns.into()),
            prompts: RefCell::new(Vec::new()),
        }
    }

    /// Prompts seen so far, in invocation order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.borrow().clone()
    }

    pub fn calls(&self) -> usize {
        self.prompts.borrow().len()
    }

    pub fn assert_drained(&self) {
        let left = self.turns.borrow().len();
        assert_eq!(left, 0, "{left} scripted agent turn(s) were never used");
    }
}

impl Agent for ScriptedAgent {
    fn invoke(&self, request: &AgentRequest<'_>) -> Result<AgentExit> {
        let turn = self
            .turns
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted agent has no turns left"))?;
        let prompt = fs::read_to_string(request.prompt_path)
            .with_context(|| format!("read {}", request.prompt_path.display()))?;
        self.prompts.borrow_mut().push(prompt);
        for effect in &turn.effects {
            apply_effect(request.workdir, effect)?;
        }
        fs::write(request.log_path, &turn.output)
            .with_context(|| format!("write {}", request.log_path.display()))?;
        Ok(AgentExit {
            exit_code: turn.exit_code,
            timed_out: turn.timed_out,
            transport: TransportKind::Pipe,
        })
    }
}

fn apply_effect(root: &Path, effect: &AgentEffect) -> Result<()> {
    match effect {
        AgentEffect::MarkPassed(id) => {
            let path = root.join(".ralph/prd.json");
            let raw = fs::read_to_string(&path).context("read backlog")?;
            let mut doc: serde_json::Value = serde_json::from_str(&raw).context("parse backlog")?;
            let items = doc["items"]
                .as_array_mut()
                .ok_or_else(|| anyhow!("backlog has no items array"))?;
            for item in items {
                if item["id"] == id.as_str() {
                    item["passes"] = serde_json::Value::Bool(true);
                }
            }
            fs::write(&path, serde_json::to_string_pretty(&doc)?).context("write backlog")
        }
        AgentEffect::Append { path, text } => {
            let path = root.join(path);
            let mut contents = fs::read_to_string(&path).unwrap_or_default();
            contents.push_str(text);
            fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
        }
    }
}

/// Validator that replays `(exit_code, output)` pairs, repeating the last one.
#[derive(Debug)]
pub struct ScriptedValidator {
    results: RefCell<VecDeque<(i32, String)>>,
    last: RefCell<(i32, String)>,
    calls: Cell<usize>,
}

impl ScriptedValidator {
    pub fn always(exit_code: i32) -> Self {
        Self::sequence(vec![(exit_code, format!("exit {exit_code}\n"))])
    }

    pub fn sequence(results: Vec<(i32, String)>) -> Self {
        Self {
            results: RefCell::new(results.into()),
            last: RefCell::new((0, String::new())),
            calls: Cell::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.get()
    }
}

impl Validator for ScriptedValidator {
    fn validate(&self, request: &ValidationRequest<'_>) -> Result<ValidationResult> {
        self.calls.set(self.calls.get() + 1);
        if let Some(next) = self.results.borrow_mut().pop_front() {
            *self.last.borrow_mut() = next;
        }
        let (exit_code, output) = self.last.borrow().clone();
        fs::write(request.log_path, &output)
            .with_context(|| format!("write {}", request.log_path.display()))?;
        Ok(ValidationResult { exit_code, output })
    }
}

/// Scratch project with a backlog and prompt template under `.ralph/`.
pub struct TestWorkspace {
    temp: TempDir,
}

impl TestWorkspace {
    pub fn new(backlog: &str) -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let ralph_dir = temp.path().join(".ralph");
        fs::create_dir_all(&ralph_dir).expect("create .ralph");
        fs::write(ralph_dir.join("prd.json"), backlog).expect("write backlog");
        fs::write(
            ralph_dir.join("agent-prompt.md"),
            "# Test prompt\nWork on the selected item.\n",
        )
        .expect("write prompt template");
        Self { temp }
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    /// Config with no external commands and no sleeping.
    pub fn config(&self) -> LoopConfig {
        LoopConfig {
            agent_cmd: "scripted-agent".to_string(),
            max_iterations: 5,
            sleep_seconds: 0,
            compact_cmd: None,
            hooks: Vec::new(),
            ..LoopConfig::default()
        }
    }

    pub fn write(&self, relative: &str, contents: &str) {
        let path = self.root().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(&path, contents).expect("write file");
    }

    pub fn read(&self, relative: &str) -> String {
        fs::read_to_string(self.root().join(relative)).expect("read file")
    }
}
