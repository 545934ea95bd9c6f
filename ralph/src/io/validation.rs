//! Validation gate: the external command whose exit code decides green or red.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::io::command::{Execution, ExternalCommand};

#[derive(Debug, Clone)]
pub struct ValidationRequest<'a> {
    pub workdir: &'a Path,
    /// Combined output is written here even when no command is configured.
    pub log_path: &'a Path,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    pub exit_code: i32,
    pub output: String,
}

impl ValidationResult {
    pub fn passed(&self) -> bool {
        self.exit_code == 0
    }
}

pub trait Validator {
    fn validate(&self, request: &ValidationRequest<'_>) -> Result<ValidationResult>;
}

/// Runs the configured command with `sh -c`; no command means always green.
#[derive(Debug, Clone)]
pub struct CommandValidator {
    command: Option<String>,
}

impl CommandValidator {
    pub fn new(command: Option<String>) -> Self {
        Self { command }
    }
}

impl Validator for CommandValidator {
    #[instrument(skip_all)]
    fn validate(&self, request: &ValidationRequest<'_>) -> Result<ValidationResult> {
        let Some(command) = self.command.as_deref() else {
            debug!("no validation command configured");
            write_empty(request.log_path)?;
            return Ok(ValidationResult {
                exit_code: 0,
                output: String::new(),
            });
        };
        info!(command, "running validation");
        let output = ExternalCommand::new(command)
            .execute(
                &[],
                None,
                &Execution {
                    workdir: request.workdir,
                    log_path: request.log_path,
                    append_log: false,
                    timeout: None,
                    label: None,
                },
            )
            .context("run validation")?;
        if output.exit_code != 0 {
            warn!(exit_code = output.exit_code, "validation failed");
        }
        Ok(ValidationResult {
            exit_code: output.exit_code,
            output: output.text(),
        })
    }
}

fn write_empty(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::write(path, "").with_context(|| format!("write {}", path.display()))
}
