//! Selection for `ralph select`.

use std::path::Path;

use anyhow::Result;

use crate::core::selector::{ScopeFilter, next_item, remaining_count};
use crate::io::backlog::{Backlog, check_scope, load_backlog};
use crate::io::config::LoopConfig;

/// Structured selection outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum SelectOutcome {
    /// Next item to work on.
    Open(SelectedItem),
    /// Every in-scope item passes.
    Exhausted,
}

/// Selected item metadata for reporting.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectedItem {
    pub id: String,
    pub title: String,
    pub priority: Option<f64>,
    /// Unpassed in-scope items, including this one.
    pub remaining: usize,
}

/// Select the next item from an in-memory backlog.
pub fn select_item(backlog: &Backlog, scope: &ScopeFilter) -> SelectOutcome {
    match next_item(&backlog.items, scope) {
        Some(item) => SelectOutcome::Open(SelectedItem {
            id: item.id.clone(),
            title: item.title.clone(),
            priority: item.priority,
            remaining: remaining_count(&backlog.items, scope),
        }),
        None => SelectOutcome::Exhausted,
    }
}

/// Load the configured backlog and select the next item.
pub fn select_from_root(root: &Path, config: &LoopConfig) -> Result<SelectOutcome> {
    let paths = config.paths(root);
    let backlog = load_backlog(&paths.prd_file)?;
    let scope = config.scope();
    check_scope(&backlog, &scope)?;
    Ok(select_item(&backlog, &scope))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::work_item;

    fn backlog() -> Backlog {
        Backlog {
            project: None,
            items: vec![
                work_item("A", Some(5.0), false),
                work_item("B", None, false),
                work_item("C", Some(1.0), false),
                work_item("X", Some(0.0), true),
            ],
        }
    }

    #[test]
    fn select_returns_lowest_priority_first() {
        let outcome = select_item(&backlog(), &ScopeFilter::all());
        let SelectOutcome::Open(item) = outcome else {
            panic!("expected open item, got {outcome:?}");
        };
        assert_eq!(item.id, "C");
        assert_eq!(item.remaining, 3);
    }

    #[test]
    fn select_respects_scope() {
        let outcome = select_item(&backlog(), &ScopeFilter::parse("B,X"));
        assert!(matches!(outcome, SelectOutcome::Open(ref item) if item.id == "B"));
    }

    #[test]
    fn scoped_exhaustion_ignores_items_outside_scope() {
        let outcome = select_item(&backlog(), &ScopeFilter::parse("X"));
        assert_eq!(outcome, SelectOutcome::Exhausted);
    }
}
