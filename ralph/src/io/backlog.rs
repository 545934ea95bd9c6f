//! Backlog document loading with schema validation.
//!
//! The backlog is owned by the agent. The loop reads it fresh every cycle and
//! never writes it back.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::Result;
use jsonschema::{Draft, Validator};
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::core::selector::ScopeFilter;
use crate::core::types::WorkItem;
use crate::io::config::ConfigError;

const BACKLOG_SCHEMA: &str = include_str!("../../schemas/backlog.schema.json");

static BACKLOG_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| {
    let schema: Value = serde_json::from_str(BACKLOG_SCHEMA).unwrap();
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .unwrap()
});

/// Parsed backlog document.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Backlog {
    #[serde(default)]
    pub project: Option<String>,
    pub items: Vec<WorkItem>,
}

/// Load and validate the backlog (schema + unique ids).
///
/// Every failure is a [`ConfigError`]: a malformed backlog cannot be worked on.
pub fn load_backlog(path: &Path) -> Result<Backlog> {
    let contents = fs::read_to_string(path)
        .map_err(|err| ConfigError::new(format!("read backlog {}: {err}", path.display())))?;
    parse_backlog(&contents)
        .map_err(|message| ConfigError::new(format!("backlog {}: {message}", path.display())))
        .map_err(Into::into)
}

fn parse_backlog(contents: &str) -> std::result::Result<Backlog, String> {
    let value: Value = serde_json::from_str(contents).map_err(|err| format!("parse: {err}"))?;
    let messages: Vec<String> = BACKLOG_VALIDATOR
        .iter_errors(&value)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(format!(
            "schema validation failed:\n- {}",
            messages.join("\n- ")
        ));
    }
    let backlog: Backlog =
        serde_json::from_value(value).map_err(|err| format!("deserialize: {err}"))?;

    let mut seen = BTreeSet::new();
    let duplicates: BTreeSet<&str> = backlog
        .items
        .iter()
        .filter(|item| !seen.insert(item.id.as_str()))
        .map(|item| item.id.as_str())
        .collect();
    if !duplicates.is_empty() {
        let ids: Vec<&str> = duplicates.into_iter().collect();
        return Err(format!("duplicate item ids: {}", ids.join(", ")));
    }
    Ok(backlog)
}

/// A scope that matches no backlog id cannot make progress.
pub fn check_scope(backlog: &Backlog, scope: &ScopeFilter) -> Result<()> {
    if scope.matches_nothing(&backlog.items) {
        return Err(ConfigError::new(format!(
            "backlog scope [{}] matches no backlog item",
            scope.ids().join(", ")
        ))
        .into());
    }
    let unknown = scope.unknown_ids(&backlog.items);
    if !unknown.is_empty() {
        warn!(?unknown, "scoped ids not found in the backlog");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, contents: &str) -> std::path::PathBuf {
        let path = dir.join("prd.json");
        fs::write(&path, contents).expect("write backlog");
        path
    }

    #[test]
    fn loads_items_with_optional_fields() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write(
            temp.path(),
            r#"{"project":"demo","items":[
                {"id":"A","title":"First","priority":2,"passes":false,"notes":"x"},
                {"id":"B","passes":true}
            ]}"#,
        );
        let backlog = load_backlog(&path).expect("load");
        assert_eq!(backlog.project.as_deref(), Some("demo"));
        assert_eq!(backlog.items.len(), 2);
        assert_eq!(backlog.items[0].priority, Some(2.0));
        assert_eq!(backlog.items[1].priority, None);
        assert!(backlog.items[0].extra.contains_key("notes"));
    }

    #[test]
    fn schema_violations_are_config_errors() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write(temp.path(), r#"{"items":[{"id":"A","passes":"no"}]}"#);
        let err = load_backlog(&path).unwrap_err();
        let config = err.downcast_ref::<ConfigError>().expect("config error");
        assert!(config.message.contains("schema validation failed"));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write(
            temp.path(),
            r#"{"items":[{"id":"A","passes":false},{"id":"A","passes":true}]}"#,
        );
        let err = load_backlog(&path).unwrap_err();
        assert!(err.to_string().contains("duplicate item ids: A"));
    }

    #[test]
    fn scope_without_matches_is_rejected() {
        let backlog = Backlog {
            project: None,
            items: vec![crate::test_support::work_item("A", None, false)],
        };
        assert!(check_scope(&backlog, &ScopeFilter::parse("A")).is_ok());
        let err = check_scope(&backlog, &ScopeFilter::parse("Q")).unwrap_err();
        assert!(err.downcast_ref::<ConfigError>().is_some());
    }
}
