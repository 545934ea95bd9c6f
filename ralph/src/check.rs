//! Preflight checks for `ralph check`.
//!
//! Everything `ralph run` verifies before its first cycle, without taking the
//! lock or starting any command.

use std::path::Path;

use anyhow::Result;

use crate::core::selector::remaining_count;
use crate::io::backlog::{check_scope, load_backlog};
use crate::io::config::LoopConfig;
use crate::io::hooks::OptionalHook;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckReport {
    pub items: usize,
    pub remaining: usize,
    pub scoped: bool,
    /// Best-effort commands whose executable is not installed.
    pub unavailable: Vec<String>,
}

pub fn check_from_root(root: &Path, config: &LoopConfig) -> Result<CheckReport> {
    config.validate_files(root)?;
    let paths = config.paths(root);
    let backlog = load_backlog(&paths.prd_file)?;
    let scope = config.scope();
    check_scope(&backlog, &scope)?;

    Ok(CheckReport {
        items: backlog.items.len(),
        remaining: remaining_count(&backlog.items, &scope),
        scoped: scope.is_scoped(),
        unavailable: optional_hooks(config)
            .into_iter()
            .filter(|hook| !hook.available())
            .map(|hook| hook.name)
            .collect(),
    })
}

fn optional_hooks(config: &LoopConfig) -> Vec<OptionalHook> {
    let mut hooks = Vec::new();
    if let Some(cmd) = config.compact_cmd.as_deref() {
        hooks.push(OptionalHook::new("compact", cmd));
    }
    hooks.extend(config.hooks.iter().map(OptionalHook::from_config));
    if let Some(cmd) = config.pre_iteration_cmd.as_deref() {
        hooks.push(OptionalHook::new("pre-iteration", cmd));
    }
    if let Some(cmd) = config.notify_cmd.as_deref() {
        hooks.push(OptionalHook::new("notify", cmd));
    }
    hooks
}
