//! Best-effort external commands: compaction, maintenance hooks, the
//! pre-iteration command and the exit notification.
//!
//! None of these can fail the loop. A missing tool or a non-zero exit becomes
//! a warning that the controller reports and moves past.

use std::path::Path;

use tracing::{debug, info, warn};

use crate::io::command::{Execution, ExternalCommand};
use crate::io::config::HookConfig;

/// How a best-effort command ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookOutcome {
    /// The executable is not on `PATH`; nothing ran.
    Unavailable,
    Exited(i32),
    /// The command could not be started or recorded.
    Failed(String),
}

impl HookOutcome {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Exited(code) => Some(*code),
            Self::Unavailable | Self::Failed(_) => None,
        }
    }

    /// One-line operator warning, or `None` on success.
    pub fn warning(&self, name: &str) -> Option<String> {
        match self {
            Self::Exited(0) => None,
            Self::Exited(code) => Some(format!("{name} exited with code {code}")),
            Self::Unavailable => Some(format!("{name} skipped: command not found")),
            Self::Failed(err) => Some(format!("{name} failed: {err}")),
        }
    }
}

/// A named command that is skipped when its executable is not installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionalHook {
    pub name: String,
    pub command: ExternalCommand,
}

impl OptionalHook {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: ExternalCommand::new(command),
        }
    }

    pub fn from_config(config: &HookConfig) -> Self {
        Self::new(config.name.clone(), config.cmd.clone())
    }

    /// True when the command's executable resolves on `PATH` (or is a path that exists).
    pub fn available(&self) -> bool {
        let Some(program) = program_of(self.command.template()) else {
            return false;
        };
        which::which(program).is_ok()
    }

    /// Run with `{key}` substitution, appending output to `log_path`.
    pub fn run(&self, workdir: &Path, args: &[(&str, &str)], log_path: &Path) -> HookOutcome {
        if !self.available() {
            warn!(hook = %self.name, "hook command not found, skipping");
            return HookOutcome::Unavailable;
        }
        debug!(hook = %self.name, command = %self.command.render(args), "running hook");
        let result = self.command.execute(
            args,
            None,
            &Execution {
                workdir,
                log_path,
                append_log: true,
                timeout: None,
                label: Some(&self.name),
            },
        );
        match result {
            Ok(output) => {
                if output.exit_code == 0 {
                    info!(hook = %self.name, "hook finished");
                } else {
                    warn!(hook = %self.name, exit_code = output.exit_code, "hook failed");
                }
                HookOutcome::Exited(output.exit_code)
            }
            Err(err) => {
                warn!(hook = %self.name, err = %format!("{err:#}"), "hook could not run");
                HookOutcome::Failed(format!("{err:#}"))
            }
        }
    }
}

/// Run every hook in order, collecting outcomes. A failure never stops the rest.
pub fn run_all(
    hooks: &[OptionalHook],
    workdir: &Path,
    args: &[(&str, &str)],
    log_path: &Path,
) -> Vec<(String, HookOutcome)> {
    hooks
        .iter()
        .map(|hook| (hook.name.clone(), hook.run(workdir, args, log_path)))
        .collect()
}

/// Executable of a shell command line, skipping leading `VAR=value` assignments.
fn program_of(command: &str) -> Option<&str> {
    command
        .split_whitespace()
        .find(|word| !is_assignment(word))
}

fn is_assignment(word: &str) -> bool {
    word.split_once('=').is_some_and(|(name, _)| {
        !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_skips_env_assignments() {
        assert_eq!(program_of("RUST_LOG=debug cargo test"), Some("cargo"));
        assert_eq!(program_of("agent-recall compact"), Some("agent-recall"));
        assert_eq!(program_of("   "), None);
    }

    #[test]
    fn missing_tool_is_unavailable_not_fatal() {
        let temp = tempfile::tempdir().expect("tempdir");
        let hook = OptionalHook::new("rebuild-forecast", "ralph-no-such-tool-xyz --flag");
        assert!(!hook.available());
        let outcome = hook.run(temp.path(), &[], &temp.path().join("hooks.log"));
        assert_eq!(outcome, HookOutcome::Unavailable);
        assert!(outcome.warning("rebuild-forecast").is_some());
    }

    #[cfg(unix)]
    #[test]
    fn hooks_share_one_appended_log() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = temp.path().join("hooks.log");
        let hooks = vec![
            OptionalHook::new("first", "echo first {iteration}"),
            OptionalHook::new("second", "sh -c 'exit 4'"),
            OptionalHook::new("third", "echo third"),
        ];
        let outcomes = run_all(&hooks, temp.path(), &[("iteration", "7")], &log);
        assert_eq!(outcomes[0].1, HookOutcome::Exited(0));
        assert_eq!(outcomes[1].1, HookOutcome::Exited(4));
        assert_eq!(outcomes[2].1, HookOutcome::Exited(0));
        let logged = std::fs::read_to_string(&log).expect("log");
        assert!(logged.contains("first 7\n"));
        assert!(logged.contains("third\n"));
        assert!(logged.find("first 7").expect("first") < logged.find("third\n").expect("third"));
    }
}
