//! External command templates with `{key}` placeholders.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;

use crate::io::process::{self, ShellOutput, ShellRequest};

/// Placeholder that switches the agent from stdin to a prompt-file argument.
pub const PROMPT_FILE_PLACEHOLDER: &str = "prompt_file";

/// A shell command line with `{key}` placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalCommand {
    template: String,
}

impl ExternalCommand {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn has_placeholder(&self, key: &str) -> bool {
        self.template.contains(&format!("{{{key}}}"))
    }

    /// Substitute every `{key}` with its value, shell-quoted.
    ///
    /// Unknown placeholders are left as written.
    pub fn render(&self, args: &[(&str, &str)]) -> String {
        let mut rendered = self.template.clone();
        for (key, value) in args {
            rendered = rendered.replace(&format!("{{{key}}}"), &shell_quote(value));
        }
        rendered
    }

    /// Render with `args` and run under `sh -c`, capturing combined output.
    pub fn execute(
        &self,
        args: &[(&str, &str)],
        stdin: Option<Vec<u8>>,
        execution: &Execution<'_>,
    ) -> Result<ShellOutput> {
        let command = self.render(args);
        process::run_shell(&ShellRequest {
            command: &command,
            workdir: execution.workdir,
            stdin,
            timeout: execution.timeout,
            log_path: execution.log_path,
            append_log: execution.append_log,
            preamble: execution
                .label
                .map(|label| format!("[ralph] {label}: {command}\n")),
            echo: false,
            output_limit_bytes: process::DEFAULT_OUTPUT_LIMIT_BYTES,
        })
    }
}

/// Where an [`ExternalCommand`] runs and where its output goes.
#[derive(Debug, Clone, Copy)]
pub struct Execution<'a> {
    pub workdir: &'a Path,
    pub log_path: &'a Path,
    pub append_log: bool,
    pub timeout: Option<Duration>,
    /// Prefixes the log with the rendered command when set.
    pub label: Option<&'a str>,
}

/// Quote `value` for `sh` when it contains anything beyond a safe charset.
pub fn shell_quote(value: &str) -> String {
    let safe = !value.is_empty()
        && value.chars().all(|c| {
            c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-' | ':' | '=' | '+' | ',')
        });
    if safe {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}
