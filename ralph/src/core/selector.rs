//! Deterministic work-item selection over the backlog.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use crate::core::types::WorkItem;

/// Id of the transient item used when the backlog is done but validation is red.
pub const STABILIZE_ID: &str = "STABILIZE";

/// Optional allow-list of backlog ids.
///
/// An empty filter means "every item is in scope".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeFilter {
    ids: Option<BTreeSet<String>>,
}

impl ScopeFilter {
    pub fn all() -> Self {
        Self { ids: None }
    }

    pub fn only<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids: BTreeSet<String> = ids.into_iter().map(Into::into).collect();
        if ids.is_empty() {
            return Self::all();
        }
        Self { ids: Some(ids) }
    }

    /// Parse a comma-separated id list; blank entries are ignored.
    pub fn parse(raw: &str) -> Self {
        Self::only(
            raw.split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string),
        )
    }

    pub fn is_scoped(&self) -> bool {
        self.ids.is_some()
    }

    pub fn contains(&self, id: &str) -> bool {
        match &self.ids {
            Some(ids) => ids.contains(id),
            None => true,
        }
    }

    /// Scoped ids that do not appear in `backlog`, in sorted order.
    pub fn unknown_ids(&self, backlog: &[WorkItem]) -> Vec<String> {
        let Some(ids) = &self.ids else {
            return Vec::new();
        };
        ids.iter()
            .filter(|id| !backlog.iter().any(|item| &item.id == *id))
            .cloned()
            .collect()
    }

    /// True when a scope is set and none of its ids exist in the backlog.
    pub fn matches_nothing(&self, backlog: &[WorkItem]) -> bool {
        self.is_scoped() && !backlog.iter().any(|item| self.contains(&item.id))
    }

    pub fn ids(&self) -> Vec<&str> {
        self.ids
            .as_ref()
            .map(|ids| ids.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }
}

/// Unpassed, in-scope items sorted by priority ascending.
///
/// Missing priority sorts last; ties keep backlog order (stable sort).
pub fn remaining_items<'a>(backlog: &'a [WorkItem], scope: &ScopeFilter) -> Vec<&'a WorkItem> {
    let mut open: Vec<&WorkItem> = backlog
        .iter()
        .filter(|item| !item.passes && scope.contains(&item.id))
        .collect();
    open.sort_by(|a, b| compare_priority(a.priority, b.priority));
    open
}

pub fn remaining_count(backlog: &[WorkItem], scope: &ScopeFilter) -> usize {
    backlog
        .iter()
        .filter(|item| !item.passes && scope.contains(&item.id))
        .count()
}

pub fn next_item<'a>(backlog: &'a [WorkItem], scope: &ScopeFilter) -> Option<&'a WorkItem> {
    remaining_items(backlog, scope).into_iter().next()
}

pub fn all_done(backlog: &[WorkItem], scope: &ScopeFilter) -> bool {
    remaining_count(backlog, scope) == 0
}

/// Synthetic item worked on while the backlog is done but validation is red.
///
/// Never written back to the backlog document.
pub fn stabilization_item() -> WorkItem {
    WorkItem {
        id: STABILIZE_ID.to_string(),
        title: "Stabilize validation".to_string(),
        description: "All backlog items pass but validation is failing. Fix the validation \
                      failures without starting new feature work."
            .to_string(),
        priority: Some(0.0),
        passes: false,
        extra: serde_json::Map::new(),
    }
}

fn compare_priority(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.total_cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}
