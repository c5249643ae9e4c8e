//! Per-project rule registry
//!
//! Ingestion takes a snapshot of a project's rules for every event, so the
//! rule list is stored copy-on-write: readers clone an `Arc` and never hold
//! the lock while aggregating.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::{AggregationRule, RuleId};
use crate::error::ValidationError;

type RuleList = Arc<Vec<Arc<AggregationRule>>>;

/// Registered rules, grouped by project
#[derive(Debug, Default)]
pub struct RuleRegistry {
    rules: RwLock<HashMap<String, RuleList>>,
}

impl RuleRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a rule; ids must be unique within the project
    pub fn register(&self, rule: AggregationRule) -> Result<Arc<AggregationRule>, ValidationError> {
        let rule = Arc::new(rule);
        let mut rules = self.rules.write();
        let list = rules.entry(rule.project().to_string()).or_default();

        if list.iter().any(|r| r.id() == rule.id()) {
            return Err(ValidationError::DuplicateRule(rule.id().to_string()));
        }

        let mut next = Vec::with_capacity(list.len() + 1);
        next.extend(list.iter().cloned());
        next.push(Arc::clone(&rule));
        *list = Arc::new(next);

        tracing::debug!(
            project = rule.project(),
            rule = %rule.id(),
            definition = %rule.describe(),
            "Rule registered"
        );
        Ok(rule)
    }

    /// Snapshot of a project's rules (empty when none are registered)
    pub fn rules(&self, project: &str) -> RuleList {
        self.rules
            .read()
            .get(project)
            .cloned()
            .unwrap_or_default()
    }

    /// Look up one rule
    pub fn rule(&self, project: &str, id: &RuleId) -> Option<Arc<AggregationRule>> {
        self.rules
            .read()
            .get(project)
            .and_then(|list| list.iter().find(|r| r.id() == id).cloned())
    }

    /// Remove a rule, returning it if it was registered
    pub fn remove(&self, project: &str, id: &RuleId) -> Option<Arc<AggregationRule>> {
        let mut rules = self.rules.write();
        let list = rules.get_mut(project)?;
        let position = list.iter().position(|r| r.id() == id)?;

        let mut next: Vec<_> = list.iter().cloned().collect();
        let removed = next.remove(position);
        *list = Arc::new(next);
        Some(removed)
    }

    /// Every registered rule across all projects
    pub fn all(&self) -> Vec<Arc<AggregationRule>> {
        self.rules
            .read()
            .values()
            .flat_map(|list| list.iter().cloned())
            .collect()
    }

    /// Projects with at least one registered rule
    pub fn projects(&self) -> Vec<String> {
        let mut projects: Vec<String> = self
            .rules
            .read()
            .iter()
            .filter(|(_, list)| !list.is_empty())
            .map(|(project, _)| project.clone())
            .collect();
        projects.sort();
        projects
    }

    /// Total number of rules
    pub fn len(&self) -> usize {
        self.rules.read().values().map(|list| list.len()).sum()
    }

    /// Whether no rules are registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
