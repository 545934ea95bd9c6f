//! Git adapter for the commit feed.
//!
//! The loop never commits; it only reads history so the agent can see what
//! earlier iterations did. Any git failure degrades to an empty feed.

use std::path::PathBuf;
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

/// One tagged commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitEntry {
    pub hash: String,
    pub date: String,
    pub subject: String,
}

impl CommitEntry {
    pub fn render(&self) -> String {
        format!("{} {} {}", self.hash, self.date, self.subject)
    }
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// Up to `count` most recent commits whose message contains `tag`.
    ///
    /// Outside a repository, or when git itself fails, the feed is empty.
    #[instrument(skip_all, fields(tag, count))]
    pub fn commits_matching(&self, tag: &str, count: usize) -> Vec<CommitEntry> {
        if count == 0 {
            return Vec::new();
        }
        let limit = count.to_string();
        let args = [
            "log",
            "--fixed-strings",
            "--grep",
            tag,
            "-n",
            &limit,
            "--date=short",
            "--pretty=format:%h|%ad|%s",
        ];
        match self.run_capture(&args) {
            Ok(out) => {
                let entries: Vec<CommitEntry> = out.lines().filter_map(parse_log_line).collect();
                debug!(found = entries.len(), "commit feed loaded");
                entries
            }
            Err(err) => {
                warn!(err = %err, "commit feed unavailable");
                Vec::new()
            }
        }
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn parse_log_line(line: &str) -> Option<CommitEntry> {
    let mut parts = line.splitn(3, '|');
    let hash = parts.next()?.trim();
    let date = parts.next()?.trim();
    let subject = parts.next()?.trim();
    if hash.is_empty() {
        return None;
    }
    Some(CommitEntry {
        hash: hash.to_string(),
        date: date.to_string(),
        subject: subject.to_string(),
    })
}
