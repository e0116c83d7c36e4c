// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Task query AST.
//!
//! Filters over task columns and over field metadata compose freely, so a new
//! combination never needs a new store method. The SQL store translates the
//! tree with [`super::sql_translator::SqlTranslator`]; the in-memory store
//! evaluates it with [`TaskQuery::matches`].
//!
//! # Example
//!
//! ```rust
//! use task_sync::storage::query::{TaskQuery, QueryBuilder};
//! use task_sync::metadata::FieldName;
//!
//! // Open errands in the "home" project that need supplies
//! let query = QueryBuilder::new()
//!     .project("home")
//!     .completed(false)
//!     .meta_eq(FieldName::Category, "errand")
//!     .meta_eq(FieldName::NeedsSupplies, true)
//!     .build();
//!
//! // Boolean combinations
//! let urgent_or_quick = TaskQuery::priority_at_least(4)
//!     .or(TaskQuery::meta_range(FieldName::TimeEstimateMinutes, None, Some(15.0)));
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::metadata::{FieldMetadata, FieldName};
use crate::model::Task;

/// Query over mirrored tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskQuery {
    pub root: QueryNode,
}

impl TaskQuery {
    pub fn new(root: QueryNode) -> Self {
        Self { root }
    }

    /// Matches every task.
    pub fn all() -> Self {
        Self::new(QueryNode::All)
    }

    pub fn project(project_id: impl Into<String>) -> Self {
        Self::new(QueryNode::Project(project_id.into()))
    }

    pub fn completed(is_completed: bool) -> Self {
        Self::new(QueryNode::Completed(is_completed))
    }

    pub fn priority(priority: u8) -> Self {
        Self::new(QueryNode::Priority(priority))
    }

    pub fn priority_at_least(priority: u8) -> Self {
        Self::new(QueryNode::PriorityAtLeast(priority))
    }

    pub fn label(name: impl Into<String>) -> Self {
        Self::new(QueryNode::Label(name.into()))
    }

    /// Metadata field equals a JSON value (strings, numbers, bools).
    pub fn meta_eq(field: FieldName, value: impl Into<Value>) -> Self {
        Self::new(QueryNode::Meta(MetaPredicate {
            field,
            operator: MetaOperator::Equals(value.into()),
        }))
    }

    /// Numeric metadata field within `[min, max]` (either bound optional).
    pub fn meta_range(field: FieldName, min: Option<f64>, max: Option<f64>) -> Self {
        Self::new(QueryNode::Meta(MetaPredicate {
            field,
            operator: MetaOperator::Range { min, max },
        }))
    }

    /// Metadata field has been classified at all.
    pub fn meta_present(field: FieldName) -> Self {
        Self::new(QueryNode::Meta(MetaPredicate {
            field,
            operator: MetaOperator::Present,
        }))
    }

    pub fn and(self, other: TaskQuery) -> Self {
        Self::new(QueryNode::And(vec![self.root, other.root]))
    }

    pub fn or(self, other: TaskQuery) -> Self {
        Self::new(QueryNode::Or(vec![self.root, other.root]))
    }

    pub fn negate(self) -> Self {
        Self::new(QueryNode::Not(Box::new(self.root)))
    }

    /// Evaluate against a task and its metadata (if any).
    pub fn matches(&self, task: &Task, meta: Option<&FieldMetadata>) -> bool {
        self.root.matches(task, meta)
    }
}

impl Default for TaskQuery {
    fn default() -> Self {
        Self::all()
    }
}

/// Query AST node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QueryNode {
    All,
    Project(String),
    Completed(bool),
    Priority(u8),
    PriorityAtLeast(u8),
    Label(String),
    Meta(MetaPredicate),
    And(Vec<QueryNode>),
    Or(Vec<QueryNode>),
    Not(Box<QueryNode>),
}

impl QueryNode {
    fn matches(&self, task: &Task, meta: Option<&FieldMetadata>) -> bool {
        match self {
            Self::All => true,
            Self::Project(id) => task.project_id.as_deref() == Some(id.as_str()),
            Self::Completed(c) => task.is_completed == *c,
            Self::Priority(p) => task.priority == *p,
            Self::PriorityAtLeast(p) => task.priority >= *p,
            Self::Label(name) => task.labels.iter().any(|l| l == name),
            Self::Meta(pred) => pred.matches(meta),
            Self::And(nodes) => nodes.iter().all(|n| n.matches(task, meta)),
            Self::Or(nodes) => nodes.iter().any(|n| n.matches(task, meta)),
            Self::Not(inner) => !inner.matches(task, meta),
        }
    }
}

/// Predicate over one metadata field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaPredicate {
    pub field: FieldName,
    pub operator: MetaOperator,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetaOperator {
    Equals(Value),
    Range { min: Option<f64>, max: Option<f64> },
    Present,
}

impl MetaPredicate {
    fn matches(&self, meta: Option<&FieldMetadata>) -> bool {
        let Some(value) = meta.and_then(|m| m.value(self.field)) else {
            return false;
        };
        match &self.operator {
            MetaOperator::Equals(expected) => value == expected,
            MetaOperator::Range { min, max } => match value.as_f64() {
                Some(n) => min.map_or(true, |m| n >= m) && max.map_or(true, |m| n <= m),
                None => false,
            },
            MetaOperator::Present => true,
        }
    }
}

/// Builder for AND-combined queries
#[derive(Default)]
pub struct QueryBuilder {
    nodes: Vec<QueryNode>,
}

impl QueryBuilder {
    pub fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    pub fn project(mut self, project_id: impl Into<String>) -> Self {
        self.nodes.push(QueryNode::Project(project_id.into()));
        self
    }

    pub fn completed(mut self, is_completed: bool) -> Self {
        self.nodes.push(QueryNode::Completed(is_completed));
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.nodes.push(QueryNode::Priority(priority));
        self
    }

    pub fn label(mut self, name: impl Into<String>) -> Self {
        self.nodes.push(QueryNode::Label(name.into()));
        self
    }

    pub fn meta_eq(mut self, field: FieldName, value: impl Into<Value>) -> Self {
        self.nodes.push(TaskQuery::meta_eq(field, value).root);
        self
    }

    pub fn meta_range(mut self, field: FieldName, min: Option<f64>, max: Option<f64>) -> Self {
        self.nodes.push(TaskQuery::meta_range(field, min, max).root);
        self
    }

    /// Add an arbitrary sub-query
    pub fn with(mut self, query: TaskQuery) -> Self {
        self.nodes.push(query.root);
        self
    }

    /// Build with AND semantics. An empty builder matches everything.
    pub fn build(mut self) -> TaskQuery {
        match self.nodes.len() {
            0 => TaskQuery::all(),
            1 => TaskQuery::new(self.nodes.remove(0)),
            _ => TaskQuery::new(QueryNode::And(self.nodes)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task(id: &str, project: &str, priority: u8) -> Task {
        let mut t = Task::new(id, format!("task {}", id));
        t.project_id = Some(project.to_string());
        t.priority = priority;
        t
    }

    fn meta(task_id: &str, pairs: &[(FieldName, Value)]) -> FieldMetadata {
        let mut m = FieldMetadata::new(task_id);
        for (f, v) in pairs {
            let _ = m.apply(*f, v.clone(), 1);
        }
        m
    }

    #[test]
    fn test_empty_builder_matches_all() {
        let q = QueryBuilder::new().build();
        assert_eq!(q, TaskQuery::all());
        assert!(q.matches(&task("1", "p", 1), None));
    }

    #[test]
    fn test_single_node_builder_is_not_wrapped() {
        let q = QueryBuilder::new().project("p").build();
        assert_eq!(q.root, QueryNode::Project("p".into()));
    }

    #[test]
    fn test_column_predicates() {
        let t = task("1", "home", 3);
        assert!(TaskQuery::project("home").matches(&t, None));
        assert!(!TaskQuery::project("work").matches(&t, None));
        assert!(TaskQuery::priority_at_least(2).matches(&t, None));
        assert!(!TaskQuery::priority(4).matches(&t, None));
        assert!(TaskQuery::completed(false).matches(&t, None));
    }

    #[test]
    fn test_meta_predicates_need_metadata() {
        let t = task("1", "home", 1);
        let q = TaskQuery::meta_eq(FieldName::Category, "errand");
        assert!(!q.matches(&t, None));

        let m = meta("1", &[(FieldName::Category, json!("errand"))]);
        assert!(q.matches(&t, Some(&m)));
    }

    #[test]
    fn test_meta_range() {
        let t = task("1", "home", 1);
        let m = meta("1", &[(FieldName::TimeEstimateMinutes, json!(25))]);
        assert!(TaskQuery::meta_range(FieldName::TimeEstimateMinutes, Some(10.0), Some(30.0)).matches(&t, Some(&m)));
        assert!(!TaskQuery::meta_range(FieldName::TimeEstimateMinutes, None, Some(15.0)).matches(&t, Some(&m)));
    }

    #[test]
    fn test_and_of_metadata_predicates() {
        let t = task("1", "home", 1);
        let m = meta(
            "1",
            &[
                (FieldName::Category, json!("errand")),
                (FieldName::NeedsSupplies, json!(true)),
                (FieldName::EnergyLevel, json!("low")),
            ],
        );
        let q = QueryBuilder::new()
            .meta_eq(FieldName::Category, "errand")
            .meta_eq(FieldName::NeedsSupplies, true)
            .meta_eq(FieldName::EnergyLevel, "low")
            .build();
        assert!(q.matches(&t, Some(&m)));

        let q2 = q.and(TaskQuery::meta_eq(FieldName::CanDelegate, true));
        assert!(!q2.matches(&t, Some(&m)));
    }

    #[test]
    fn test_or_and_not() {
        let t = task("1", "home", 1);
        let q = TaskQuery::project("work").or(TaskQuery::priority(1));
        assert!(q.matches(&t, None));
        assert!(!q.negate().matches(&t, None));
    }
}
